use http_body_util::BodyExt;
use hyper::Request;
use hyper::body::Incoming;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error};
use url::form_urlencoded;

use crate::broker::{BrokerContext, SCHEMA_UPDATED_EVENT, ServiceBroker};
use crate::context::{ContextFactory, GraphQLContextCreator};
use crate::error::SchemaError;
use crate::request_handler::{
    GatewayRequest, HandlerResponse, RequestHandler, RequestHandlerOptions, error_response,
};
use crate::stitcher::GatewayStitcher;
use crate::validation::{CreateValidateOptions, ValidationRule, create_validate};
use http::StatusCode;

#[derive(Clone)]
pub struct GatewayOptions {
    pub introspection: bool,
    pub show_graphiql: bool,
    pub validation_rules: Vec<Arc<dyn ValidationRule>>,
    pub context_factory: Option<ContextFactory>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        GatewayOptions {
            introspection: true,
            show_graphiql: true,
            validation_rules: Vec::new(),
            context_factory: None,
        }
    }
}

struct CacheEntry {
    handler: Option<Arc<RequestHandler>>,
    generation: u64,
}

/// Cross-request shared state: the cached request handler and the topology
/// generation it was built from. The two always change together under the
/// write lock.
pub struct SchemaCache {
    topology: AtomicU64,
    state: RwLock<CacheEntry>,
}

impl SchemaCache {
    fn new() -> Self {
        SchemaCache {
            topology: AtomicU64::new(1),
            state: RwLock::new(CacheEntry {
                handler: None,
                generation: 0,
            }),
        }
    }

    /// Mark the cached schema stale. The next request pays the restitch.
    pub fn invalidate(&self) {
        self.topology.fetch_add(1, Ordering::AcqRel);
    }
}

/// The gateway: stitches on demand, caches the result until the topology
/// changes, and serves HTTP-shaped requests against the composite schema.
pub struct GraphQLGateway {
    broker: Arc<dyn ServiceBroker>,
    stitcher: GatewayStitcher,
    cache: Arc<SchemaCache>,
    context_creator: Arc<GraphQLContextCreator>,
    options: GatewayOptions,
}

impl GraphQLGateway {
    pub fn new(broker: Arc<dyn ServiceBroker>, options: GatewayOptions) -> Self {
        let cache = Arc::new(SchemaCache::new());

        let mut topology = broker.subscribe_topology();
        {
            let cache = cache.clone();
            tokio::spawn(async move {
                loop {
                    match topology.recv().await {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => cache.invalidate(),
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        let context_creator = Arc::new(GraphQLContextCreator::new(
            options.context_factory.clone(),
        ));

        GraphQLGateway {
            stitcher: GatewayStitcher::new(broker.clone()),
            broker,
            cache,
            context_creator,
            options,
        }
    }

    /// The handler for the current topology. Rebuilds synchronously when the
    /// cache is stale; concurrent rebuilds are allowed and idempotent.
    pub async fn handler(&self) -> Result<Arc<RequestHandler>, SchemaError> {
        let generation = self.cache.topology.load(Ordering::Acquire);
        {
            let state = self.cache.state.read().await;
            if state.generation == generation {
                if let Some(handler) = &state.handler {
                    return Ok(handler.clone());
                }
            }
        }

        let schema = Arc::new(self.stitcher.stitch()?);
        debug!(
            subschemas = schema.subschema_names().len(),
            "stitched composite schema"
        );

        let validator = create_validate(CreateValidateOptions {
            introspection: self.options.introspection,
            validation_rules: self.options.validation_rules.clone(),
        });
        let handler = Arc::new(RequestHandler::new(
            schema.clone(),
            validator,
            self.context_creator.clone(),
            RequestHandlerOptions {
                introspection: self.options.introspection,
                show_graphiql: self.options.show_graphiql,
            },
        ));

        {
            let mut state = self.cache.state.write().await;
            state.handler = Some(handler.clone());
            state.generation = generation;
        }

        if let Err(err) = self
            .broker
            .broadcast(SCHEMA_UPDATED_EVENT, json!({ "schema": schema.type_defs() }))
            .await
        {
            error!(%err, "failed to broadcast schema update");
        }

        Ok(handler)
    }

    pub async fn handle(&self, req: GatewayRequest) -> HandlerResponse {
        match self.handler().await {
            Ok(handler) => handler.handle(req).await,
            Err(err) => {
                error!(%err, "failed to stitch composite schema");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    }

    /// Bridge a hyper request into the transport-agnostic shape and serve it.
    pub async fn handle_http(&self, req: Request<Incoming>) -> HandlerResponse {
        let (parts, body) = req.into_parts();

        let query = parts
            .uri
            .query()
            .map(|raw| {
                form_urlencoded::parse(raw.as_bytes())
                    .into_owned()
                    .collect::<HashMap<String, String>>()
            })
            .unwrap_or_default();

        let body = body.collect().await.ok().map(|collected| collected.to_bytes());

        let gateway_request = GatewayRequest {
            url: Some(parts.uri.to_string()),
            method: Some(parts.method),
            headers: parts.headers,
            query,
            body,
            ctx: BrokerContext::new(self.broker.clone()),
        };

        self.handle(gateway_request).await
    }
}
