mod common;

use pretty_assertions::assert_eq;
use serde_json::{Map, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use stitchgate::broker::LocalBroker;
use stitchgate::context::{ContextFactory, GraphQLContextCreator};

#[tokio::test]
async fn default_context_is_just_the_call_handle() {
    let broker = LocalBroker::new();
    let creator = GraphQLContextCreator::new(None);

    let context = creator.create(common::broker_ctx(&broker)).await;

    assert!(context.extra.is_empty());
}

#[tokio::test]
async fn factory_output_is_merged_alongside_the_call_handle() {
    let broker = LocalBroker::new();
    let factory: ContextFactory = Arc::new(|| {
        Box::pin(async move {
            let mut extra = Map::new();
            extra.insert("foo".to_string(), json!("foo"));
            extra
        })
    });
    let creator = GraphQLContextCreator::new(Some(factory));

    let context = creator.create(common::broker_ctx(&broker)).await;

    assert_eq!(context.get("foo"), Some(&json!("foo")));
    assert_eq!(context.extra.len(), 1);
}

#[tokio::test]
async fn every_request_gets_a_fresh_context() {
    let broker = LocalBroker::new();
    let invocations = Arc::new(AtomicUsize::new(0));

    let factory: ContextFactory = {
        let invocations = invocations.clone();
        Arc::new(move || {
            let count = invocations.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let mut extra = Map::new();
                extra.insert("count".to_string(), json!(count));
                extra
            })
        })
    };
    let creator = GraphQLContextCreator::new(Some(factory));

    let first = creator.create(common::broker_ctx(&broker)).await;
    let second = creator.create(common::broker_ctx(&broker)).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(first.get("count"), Some(&json!(0)));
    assert_eq!(second.get("count"), Some(&json!(1)));
}

#[tokio::test]
async fn context_call_handle_reaches_registered_actions() {
    let broker = LocalBroker::new();
    let (author, _) = common::author_service();
    broker.register(author);

    let creator = GraphQLContextCreator::new(None);
    let context = creator.create(common::broker_ctx(&broker)).await;

    let result = context
        .call("author.authorById", json!({ "id": "1" }))
        .await
        .expect("call succeeds");

    assert_eq!(result, json!({ "id": "1", "name": "O.J. Simpson" }));
}
