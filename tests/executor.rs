mod common;

use pretty_assertions::assert_eq;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use stitchgate::broker::{ActionHandler, LocalBroker};
use stitchgate::context::GraphQLContext;
use stitchgate::error::BrokerError;
use stitchgate::executor::GraphQLExecutor;
use stitchgate::schema_builder::{Resolver, SchemaBuilder, SchemaBuilderOptions};
use stitchgate::service::{GraphQLAction, GraphQLServiceConfig, graphql_service};
use stitchgate::validation::{
    CreateValidateOptions, INTROSPECTION_DISABLED_MESSAGE, create_validate,
};
use stitchgate::{ExecutionResult, PathSegment};

fn empty_ctx() -> GraphQLContext {
    GraphQLContext::new(common::broker_ctx(&LocalBroker::new()))
}

fn constant(value: Value, calls: Arc<AtomicUsize>) -> Resolver {
    Resolver::Function(Arc::new(move |_parent, _args, _ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        let value = value.clone();
        Box::pin(async move { Ok(value) })
    }))
}

#[tokio::test]
async fn executes_action_bound_root_fields_through_the_exposed_action() {
    let broker = LocalBroker::new();
    let (author, calls) = common::author_service();
    broker.register(author);

    let ctx = common::broker_ctx(&broker);
    let raw = ctx
        .call(
            "author.$handleGraphQLRequest",
            json!({
                "query": r#"{ authorById(id: "1") { name } }"#,
                "variables": null,
                "operationName": null
            }),
        )
        .await
        .expect("call succeeds");

    let result: ExecutionResult = serde_json::from_value(raw).expect("well-formed result");
    assert_eq!(result.errors, vec![]);
    assert_eq!(result.data, Some(json!({ "authorById": { "name": "O.J. Simpson" } })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn one_action_fans_out_to_multiple_field_names() {
    let broker = LocalBroker::new();

    let handler: ActionHandler =
        Arc::new(|_params, _ctx| Box::pin(async move { Ok(json!(7)) }));

    let definition = graphql_service(
        GraphQLServiceConfig::new("numbers", "type Query {\n  a: Int\n  b: Int\n}\n")
            .action(GraphQLAction::new("value", handler).query("a").query("b")),
    )
    .expect("service builds");
    broker.register(definition);

    let ctx = common::broker_ctx(&broker);
    let raw = ctx
        .call(
            "numbers.$handleGraphQLRequest",
            json!({ "query": "{ a b }", "variables": null, "operationName": null }),
        )
        .await
        .expect("call succeeds");

    let result: ExecutionResult = serde_json::from_value(raw).expect("well-formed result");
    assert_eq!(result.data, Some(json!({ "a": 7, "b": 7 })));
}

#[tokio::test]
async fn multiple_operations_require_an_operation_name() {
    let schema = Arc::new(
        SchemaBuilder::new(
            "test",
            None,
            "type Query {\n  value: Int\n}\n",
            SchemaBuilderOptions::default(),
        )
        .build()
        .expect("schema builds"),
    );
    let executor = GraphQLExecutor::new(schema);

    let query = "query A { value }\nquery B { value }";

    let ambiguous = executor.execute(empty_ctx(), query, None, None).await;
    assert_eq!(
        ambiguous.errors[0].message,
        "Must provide operation name if query contains multiple operations."
    );
    assert!(ambiguous.data.is_none());

    let named = executor.execute(empty_ctx(), query, None, Some("B")).await;
    assert_eq!(named.data, Some(json!({ "value": null })));

    let unknown = executor.execute(empty_ctx(), query, None, Some("C")).await;
    assert_eq!(unknown.errors[0].message, "Unknown operation named \"C\".");
}

#[tokio::test]
async fn coerces_variables_and_definition_defaults() {
    let echo = Resolver::Function(Arc::new(|_parent, args, _ctx| {
        Box::pin(async move { Ok(args.get("id").cloned().unwrap_or(Value::Null)) })
    }));

    let mut options = SchemaBuilderOptions::default();
    options.resolvers.insert(
        "Query".to_string(),
        [("echo".to_string(), echo)].into_iter().collect(),
    );

    let schema = Arc::new(
        SchemaBuilder::new(
            "test",
            None,
            "type Query {\n  echo(id: ID): ID\n}\n",
            options,
        )
        .build()
        .expect("schema builds"),
    );
    let executor = GraphQLExecutor::new(schema);

    let query = r#"query Fetch($id: ID = "fallback") { echo(id: $id) }"#;

    let mut variables = Map::new();
    variables.insert("id".to_string(), json!("supplied"));
    let supplied = executor
        .execute(empty_ctx(), query, Some(&variables), None)
        .await;
    assert_eq!(supplied.data, Some(json!({ "echo": "supplied" })));

    let defaulted = executor.execute(empty_ctx(), query, None, None).await;
    assert_eq!(defaulted.data, Some(json!({ "echo": "fallback" })));
}

#[tokio::test]
async fn resolver_failures_become_field_errors_with_partial_data() {
    let broker = LocalBroker::new();

    let ok: ActionHandler = Arc::new(|_params, _ctx| Box::pin(async move { Ok(json!("fine")) }));
    let failing: ActionHandler = Arc::new(|_params, _ctx| {
        Box::pin(async move {
            Err(BrokerError::call_failed("boom.handler", "exploded"))
        })
    });

    let definition = graphql_service(
        GraphQLServiceConfig::new("mixed", "type Query {\n  good: String\n  bad: String\n}\n")
            .action(GraphQLAction::new("good", ok).query("good"))
            .action(GraphQLAction::new("bad", failing).query("bad")),
    )
    .expect("service builds");
    broker.register(definition);

    let ctx = common::broker_ctx(&broker);
    let raw = ctx
        .call(
            "mixed.$handleGraphQLRequest",
            json!({ "query": "{ good bad }", "variables": null, "operationName": null }),
        )
        .await
        .expect("call succeeds");

    let result: ExecutionResult = serde_json::from_value(raw).expect("well-formed result");
    assert_eq!(result.data, Some(json!({ "good": "fine", "bad": null })));
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].path, vec![PathSegment::Field("bad".to_string())]);
    assert!(result.errors[0].message.contains("exploded"));
}

#[tokio::test]
async fn validation_failure_skips_execution_entirely() {
    let calls = Arc::new(AtomicUsize::new(0));

    let mut options = SchemaBuilderOptions::default();
    options.resolvers.insert(
        "Query".to_string(),
        [("value".to_string(), constant(json!(1), calls.clone()))]
            .into_iter()
            .collect(),
    );

    let schema = Arc::new(
        SchemaBuilder::new("test", None, "type Query {\n  value: Int\n}\n", options)
            .build()
            .expect("schema builds"),
    );
    let executor = GraphQLExecutor::new(schema).with_validator(create_validate(
        CreateValidateOptions {
            introspection: false,
            validation_rules: Vec::new(),
        },
    ));

    let result = executor
        .execute(empty_ctx(), "{ __schema { queryType { name } } }", None, None)
        .await;

    assert!(result.data.is_none());
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].message, INTROSPECTION_DISABLED_MESSAGE);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn honors_skip_and_include_directives() {
    let calls = Arc::new(AtomicUsize::new(0));

    let mut options = SchemaBuilderOptions::default();
    options.resolvers.insert(
        "Query".to_string(),
        [
            ("kept".to_string(), constant(json!("kept"), calls.clone())),
            ("dropped".to_string(), constant(json!("dropped"), calls.clone())),
        ]
        .into_iter()
        .collect(),
    );

    let schema = Arc::new(
        SchemaBuilder::new(
            "test",
            None,
            "type Query {\n  kept: String\n  dropped: String\n}\n",
            options,
        )
        .build()
        .expect("schema builds"),
    );
    let executor = GraphQLExecutor::new(schema);

    let variables: Map<String, Value> = [("off".to_string(), json!(true))].into_iter().collect();
    let result = executor
        .execute(
            empty_ctx(),
            "query ($off: Boolean!) { kept @include(if: true) dropped @skip(if: $off) }",
            Some(&variables),
            None,
        )
        .await;

    assert_eq!(result.data, Some(json!({ "kept": "kept" })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn nested_action_binding_resolves_through_fragments() {
    let broker = LocalBroker::new();
    let (author, _) = common::author_service();
    broker.register(author);

    let ctx = common::broker_ctx(&broker);
    let raw = ctx
        .call(
            "author.$handleGraphQLRequest",
            json!({
                "query": "query { authorById(id: \"2\") { ...AuthorParts } }\nfragment AuthorParts on Author { id name }",
                "variables": null,
                "operationName": null
            }),
        )
        .await
        .expect("call succeeds");

    let result: ExecutionResult = serde_json::from_value(raw).expect("well-formed result");
    assert_eq!(
        result.data,
        Some(json!({ "authorById": { "id": "2", "name": "John Steinbeck" } }))
    );
}
