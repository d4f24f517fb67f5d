use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

use crate::error::BrokerError;

/// Action name every schema-owning service exposes for delegated execution.
pub const GRAPHQL_ACTION_NAME: &str = "$handleGraphQLRequest";

/// Event broadcast by the gateway after each successful stitch.
pub const SCHEMA_UPDATED_EVENT: &str = "graphql.schema.updated";

pub fn build_full_action_name(
    service_name: &str,
    action_name: &str,
    version: Option<u32>,
) -> String {
    match version {
        Some(version) => format!("v{version}.{service_name}.{action_name}"),
        None => format!("{service_name}.{action_name}"),
    }
}

/// Per-fragment stitching configuration advertised alongside the SDL.
/// Per-type merge keys travel inside the SDL itself as stitching directives.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubschemaConfig {
    #[serde(default = "default_batch")]
    pub batch: bool,
}

fn default_batch() -> bool {
    true
}

impl Default for SubschemaConfig {
    fn default() -> Self {
        SubschemaConfig { batch: true }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphQLServiceSettings {
    pub type_defs: String,
    pub subschema_config: SubschemaConfig,
}

/// Typed capability record: a service either carries a GraphQL fragment or it
/// does not. The stitcher checks this field, not arbitrary settings keys.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graphql: Option<GraphQLServiceSettings>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default)]
    pub settings: ServiceSettings,
}

/// Notification that services joined, left, or restarted.
#[derive(Clone, Copy, Debug)]
pub struct TopologyEvent;

/// Interface boundary to the service-mesh/RPC runtime: directory lookup, the
/// call and broadcast primitives, and topology-change notifications.
#[async_trait]
pub trait ServiceBroker: Send + Sync {
    async fn call(
        &self,
        action: &str,
        params: Value,
        ctx: BrokerContext,
    ) -> Result<Value, BrokerError>;

    async fn broadcast(&self, event: &str, payload: Value) -> Result<(), BrokerError>;

    fn service_list(&self) -> Vec<ServiceInfo>;

    fn subscribe_topology(&self) -> broadcast::Receiver<TopologyEvent>;
}

/// The call handle threaded through every resolver invocation.
#[derive(Clone)]
pub struct BrokerContext {
    broker: Arc<dyn ServiceBroker>,
}

impl BrokerContext {
    pub fn new(broker: Arc<dyn ServiceBroker>) -> Self {
        BrokerContext { broker }
    }

    pub async fn call(&self, action: &str, params: Value) -> Result<Value, BrokerError> {
        self.broker.call(action, params, self.clone()).await
    }

    pub async fn broadcast(&self, event: &str, payload: Value) -> Result<(), BrokerError> {
        self.broker.broadcast(event, payload).await
    }

    pub fn broker(&self) -> &Arc<dyn ServiceBroker> {
        &self.broker
    }
}

impl fmt::Debug for BrokerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerContext").finish_non_exhaustive()
    }
}

pub type ActionHandler = Arc<
    dyn Fn(Value, BrokerContext) -> BoxFuture<'static, Result<Value, BrokerError>> + Send + Sync,
>;

pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Everything a hosting runtime needs to attach one service: its directory
/// record and its callable actions.
pub struct ServiceDefinition {
    pub name: String,
    pub version: Option<u32>,
    pub settings: ServiceSettings,
    pub actions: HashMap<String, ActionHandler>,
}

/// In-process [`ServiceBroker`]: a service directory plus direct dispatch,
/// enough to exercise the boundary contract in one process. Used by the demo
/// binary and the test suite.
pub struct LocalBroker {
    services: RwLock<Vec<ServiceInfo>>,
    actions: RwLock<HashMap<String, ActionHandler>>,
    event_handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    topology: broadcast::Sender<TopologyEvent>,
}

impl LocalBroker {
    pub fn new() -> Arc<Self> {
        let (topology, _) = broadcast::channel(16);
        Arc::new(LocalBroker {
            services: RwLock::new(Vec::new()),
            actions: RwLock::new(HashMap::new()),
            event_handlers: RwLock::new(HashMap::new()),
            topology,
        })
    }

    /// Attach a service and notify topology subscribers. Duplicate names stay
    /// in the directory (a restarted instance registers again); dispatch and
    /// stitching both resolve to the first occurrence.
    pub fn register(&self, definition: ServiceDefinition) {
        write_lock(&self.services).push(ServiceInfo {
            name: definition.name.clone(),
            version: definition.version,
            settings: definition.settings,
        });

        let mut actions = write_lock(&self.actions);
        for (action_name, handler) in definition.actions {
            let full_name =
                build_full_action_name(&definition.name, &action_name, definition.version);
            actions.entry(full_name).or_insert(handler);
        }
        drop(actions);

        let _ = self.topology.send(TopologyEvent);
    }

    /// Subscribe a handler to a broadcast event by name.
    pub fn on_event(&self, event: &str, handler: EventHandler) {
        write_lock(&self.event_handlers)
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }
}

#[async_trait]
impl ServiceBroker for LocalBroker {
    async fn call(
        &self,
        action: &str,
        params: Value,
        ctx: BrokerContext,
    ) -> Result<Value, BrokerError> {
        let handler = read_lock(&self.actions).get(action).cloned();

        match handler {
            Some(handler) => handler(params, ctx).await,
            None => Err(BrokerError::UnknownAction(action.to_string())),
        }
    }

    async fn broadcast(&self, event: &str, payload: Value) -> Result<(), BrokerError> {
        let handlers = read_lock(&self.event_handlers)
            .get(event)
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            handler(payload.clone());
        }

        Ok(())
    }

    fn service_list(&self) -> Vec<ServiceInfo> {
        read_lock(&self.services).clone()
    }

    fn subscribe_topology(&self) -> broadcast::Receiver<TopologyEvent> {
        self.topology.subscribe()
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
