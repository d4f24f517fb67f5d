mod common;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stitchgate::broker::{ActionHandler, SCHEMA_UPDATED_EVENT};
use stitchgate::gateway::{GatewayOptions, GraphQLGateway};
use stitchgate::request_handler::GatewayRequest;
use stitchgate::service::{GraphQLServiceConfig, graphql_service};

async fn settle() {
    // lets the topology subscription task drain pending events
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn caches_the_handler_until_the_topology_changes() {
    let (broker, _, _) = common::fixture_broker();
    let gateway = GraphQLGateway::new(broker.clone(), GatewayOptions::default());
    settle().await;

    let first = gateway.handler().await.expect("first stitch");
    let second = gateway.handler().await.expect("cached handler");
    assert!(Arc::ptr_eq(&first, &second));

    let comment = graphql_service(GraphQLServiceConfig::new(
        "comment",
        "type Query {\n  commentById(id: ID!): Comment\n}\n\ntype Comment {\n  id: ID!\n}\n",
    ))
    .expect("comment service builds");
    broker.register(comment);
    settle().await;

    let rebuilt = gateway.handler().await.expect("rebuilt handler");
    assert!(!Arc::ptr_eq(&second, &rebuilt));
    assert!(rebuilt.schema().query_fields().contains(&"commentById"));
}

#[tokio::test]
async fn broadcasts_the_composite_schema_after_each_rebuild() {
    let (broker, _, _) = common::fixture_broker();

    let received: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        broker.on_event(
            SCHEMA_UPDATED_EVENT,
            Arc::new(move |payload| {
                received
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(payload);
            }),
        );
    }

    let gateway = GraphQLGateway::new(broker.clone(), GatewayOptions::default());
    settle().await;

    gateway.handler().await.expect("stitch succeeds");
    gateway.handler().await.expect("cached, no second broadcast");

    let events = received
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    assert_eq!(events.len(), 1);
    let sdl = events[0]["schema"].as_str().expect("schema payload");
    assert!(sdl.contains("authorById"));
    assert!(sdl.contains("postById"));
}

#[tokio::test]
async fn requests_after_a_topology_change_see_the_new_fragment() {
    let (broker, _, _) = common::fixture_broker();
    let gateway = GraphQLGateway::new(broker.clone(), GatewayOptions::default());
    settle().await;

    // warm the cache, then change the topology
    gateway.handler().await.expect("initial stitch");

    let greeting_handler: ActionHandler =
        Arc::new(|_params, _ctx| Box::pin(async move { Ok(json!("hello")) }));
    let greeter = graphql_service(
        GraphQLServiceConfig::new("greeter", "type Query {\n  greeting: String\n}\n").action(
            stitchgate::service::GraphQLAction::new("greeting", greeting_handler)
                .query("greeting"),
        ),
    )
    .expect("greeter service builds");
    broker.register(greeter);
    settle().await;

    let mut request = GatewayRequest::new(common::broker_ctx(&broker));
    request.body = Some(Bytes::from(json!({ "query": "{ greeting }" }).to_string()));

    let response = gateway.handle(request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body collects")
        .to_bytes();
    let body: Value = serde_json::from_slice(&bytes).expect("JSON body");
    assert_eq!(body, json!({ "data": { "greeting": "hello" } }));
}
