use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::broker::{
    ActionHandler, BrokerContext, GRAPHQL_ACTION_NAME, GraphQLServiceSettings, ServiceDefinition,
    ServiceSettings, SubschemaConfig,
};
use crate::context::{ContextFactory, GraphQLContextCreator};
use crate::error::{BrokerError, SchemaError};
use crate::executor::GraphQLExecutor;
use crate::schema_builder::{
    ActionBinding, Resolver, SchemaBuilder, SchemaBuilderOptions, SchemaTransformer,
};
use crate::GraphQLRequest;

/// Root field names an action resolves. One action may fan out to several
/// query and/or mutation fields.
#[derive(Clone, Debug, Default)]
pub struct GraphQLBinding {
    pub query: Vec<String>,
    pub mutation: Vec<String>,
}

/// One action of a schema-owning service. Actions without a binding are
/// callable over the broker but not exposed as GraphQL fields.
pub struct GraphQLAction {
    pub name: String,
    pub handler: ActionHandler,
    pub graphql: Option<GraphQLBinding>,
}

impl GraphQLAction {
    pub fn new(name: &str, handler: ActionHandler) -> Self {
        GraphQLAction {
            name: name.to_string(),
            handler,
            graphql: None,
        }
    }

    pub fn query(mut self, field_name: &str) -> Self {
        self.graphql
            .get_or_insert_with(GraphQLBinding::default)
            .query
            .push(field_name.to_string());
        self
    }

    pub fn mutation(mut self, field_name: &str) -> Self {
        self.graphql
            .get_or_insert_with(GraphQLBinding::default)
            .mutation
            .push(field_name.to_string());
        self
    }
}

pub struct GraphQLServiceConfig {
    pub name: String,
    pub version: Option<u32>,
    pub type_defs: String,
    pub actions: Vec<GraphQLAction>,
    pub resolvers: HashMap<String, HashMap<String, Resolver>>,
    pub schema_directive_transformers: Vec<SchemaTransformer>,
    pub subschema_config: SubschemaConfig,
    pub context_factory: Option<ContextFactory>,
}

impl GraphQLServiceConfig {
    pub fn new(name: &str, type_defs: &str) -> Self {
        GraphQLServiceConfig {
            name: name.to_string(),
            version: None,
            type_defs: type_defs.to_string(),
            actions: Vec::new(),
            resolvers: HashMap::new(),
            schema_directive_transformers: Vec::new(),
            subschema_config: SubschemaConfig::default(),
            context_factory: None,
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn action(mut self, action: GraphQLAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn resolver(mut self, type_name: &str, field_name: &str, resolver: Resolver) -> Self {
        self.resolvers
            .entry(type_name.to_string())
            .or_default()
            .insert(field_name.to_string(), resolver);
        self
    }

    pub fn schema_directive_transformer(mut self, transformer: SchemaTransformer) -> Self {
        self.schema_directive_transformers.push(transformer);
        self
    }

    pub fn context_factory(mut self, factory: ContextFactory) -> Self {
        self.context_factory = Some(factory);
        self
    }
}

/// Assemble one schema-owning service: build its executable fragment, expose
/// the well-known execution action, and advertise the fragment through the
/// service settings. Fails when the fragment cannot be built, in which case
/// the service must not start.
pub fn graphql_service(config: GraphQLServiceConfig) -> Result<ServiceDefinition, SchemaError> {
    let bindings = config
        .actions
        .iter()
        .filter_map(|action| {
            action.graphql.as_ref().map(|binding| ActionBinding {
                action: action.name.clone(),
                query: binding.query.clone(),
                mutation: binding.mutation.clone(),
            })
        })
        .collect();

    let builder = SchemaBuilder::new(
        &config.name,
        config.version,
        &config.type_defs,
        SchemaBuilderOptions {
            bindings,
            resolvers: config.resolvers,
            schema_directive_transformers: config.schema_directive_transformers,
        },
    );
    let type_defs = builder.type_defs().to_string();
    let schema = Arc::new(builder.build()?);

    let executor = Arc::new(GraphQLExecutor::new(schema));
    let context_creator = Arc::new(GraphQLContextCreator::new(config.context_factory));

    let mut actions: HashMap<String, ActionHandler> = config
        .actions
        .into_iter()
        .map(|action| (action.name, action.handler))
        .collect();
    actions.insert(
        GRAPHQL_ACTION_NAME.to_string(),
        make_execute_action(executor, context_creator),
    );

    Ok(ServiceDefinition {
        name: config.name,
        version: config.version,
        settings: ServiceSettings {
            graphql: Some(GraphQLServiceSettings {
                type_defs,
                subschema_config: config.subschema_config,
            }),
        },
        actions,
    })
}

/// The single remote contact point: takes the request envelope, executes it
/// against the local fragment with a fresh context, returns the result.
fn make_execute_action(
    executor: Arc<GraphQLExecutor>,
    context_creator: Arc<GraphQLContextCreator>,
) -> ActionHandler {
    Arc::new(move |params: Value, ctx: BrokerContext| {
        let executor = executor.clone();
        let context_creator = context_creator.clone();
        Box::pin(async move {
            let request: GraphQLRequest = serde_json::from_value(params)
                .map_err(|err| BrokerError::call_failed(GRAPHQL_ACTION_NAME, err))?;

            let graphql_context = context_creator.create(ctx).await;
            let result = executor
                .execute(
                    graphql_context,
                    &request.query,
                    request.variables.as_ref(),
                    request.operation_name.as_deref(),
                )
                .await;

            serde_json::to_value(result)
                .map_err(|err| BrokerError::call_failed(GRAPHQL_ACTION_NAME, err))
        })
    })
}
