use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::broker::BrokerContext;
use crate::error::BrokerError;

/// Asynchronous producer of caller-supplied context data, invoked once per
/// request with no arguments.
pub type ContextFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Map<String, Value>> + Send + Sync>;

/// The per-request value threaded through every resolver: the broker call
/// handle plus whatever the configured factory produced. The handle is a
/// dedicated field, so factory output can never shadow it.
#[derive(Clone, Debug)]
pub struct GraphQLContext {
    pub ctx: BrokerContext,
    pub extra: Arc<Map<String, Value>>,
}

impl GraphQLContext {
    pub fn new(ctx: BrokerContext) -> Self {
        GraphQLContext {
            ctx,
            extra: Arc::new(Map::new()),
        }
    }

    pub async fn call(&self, action: &str, params: Value) -> Result<Value, BrokerError> {
        self.ctx.call(action, params).await
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

/// Builds a fresh [`GraphQLContext`] for each request.
pub struct GraphQLContextCreator {
    factory: Option<ContextFactory>,
}

impl GraphQLContextCreator {
    pub fn new(factory: Option<ContextFactory>) -> Self {
        GraphQLContextCreator { factory }
    }

    pub async fn create(&self, ctx: BrokerContext) -> GraphQLContext {
        let extra = match &self.factory {
            Some(factory) => factory().await,
            None => Map::new(),
        };

        GraphQLContext {
            ctx,
            extra: Arc::new(extra),
        }
    }
}
