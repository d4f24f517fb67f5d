#![allow(dead_code)]

use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use stitchgate::broker::{ActionHandler, BrokerContext, LocalBroker, ServiceDefinition};
use stitchgate::error::SchemaError;
use stitchgate::schema_builder::Resolver;
use stitchgate::service::{GraphQLAction, GraphQLServiceConfig, graphql_service};

pub const AUTHOR_TYPE_DEFS: &str = "\
type Query {
  authorById(id: ID!): Author @merge(keyField: \"id\")
  authorsById(ids: [ID!]!): [Author]
}

type Author @key(selectionSet: \"{ id }\") {
  id: ID!
  name: String!
}
";

pub const POST_TYPE_DEFS: &str = "\
type Query {
  postById(id: ID!): Post
  postsById(ids: [ID!]!): [Post]
}

type Post {
  id: ID!
  message: String!
  author: Author!
}

type Author {
  id: ID!
}
";

fn authors() -> Vec<Value> {
    vec![
        json!({ "id": "1", "name": "O.J. Simpson" }),
        json!({ "id": "2", "name": "John Steinbeck" }),
    ]
}

fn posts() -> Vec<Value> {
    vec![
        json!({ "id": "1", "authorId": "1", "message": "This is a test" }),
        json!({
            "id": "2",
            "authorId": "2",
            "message": "How can we live without our lives? How will we know it's us without our past?"
        }),
    ]
}

fn find_by_id(data: Vec<Value>, calls: Arc<AtomicUsize>) -> ActionHandler {
    Arc::new(move |params, _ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        let data = data.clone();
        Box::pin(async move {
            let id = params.get("id").and_then(Value::as_str).unwrap_or_default();
            Ok(data
                .iter()
                .find(|entry| entry["id"] == id)
                .cloned()
                .unwrap_or(Value::Null))
        })
    })
}

fn filter_by_ids(data: Vec<Value>, calls: Arc<AtomicUsize>) -> ActionHandler {
    Arc::new(move |params, _ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        let data = data.clone();
        Box::pin(async move {
            let ids: Vec<String> = params
                .get("ids")
                .and_then(Value::as_array)
                .map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Ok(Value::Array(
                data.iter()
                    .filter(|entry| {
                        entry["id"]
                            .as_str()
                            .is_some_and(|id| ids.iter().any(|wanted| wanted == id))
                    })
                    .cloned()
                    .collect(),
            ))
        })
    })
}

/// The `author` fixture service. The returned counter increments once per
/// action invocation.
pub fn author_service() -> (ServiceDefinition, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let definition = graphql_service(
        GraphQLServiceConfig::new("author", AUTHOR_TYPE_DEFS)
            .action(
                GraphQLAction::new("authorById", find_by_id(authors(), calls.clone()))
                    .query("authorById"),
            )
            .action(
                GraphQLAction::new("authorsById", filter_by_ids(authors(), calls.clone()))
                    .query("authorsById"),
            ),
    )
    .expect("author service should build");
    (definition, calls)
}

/// The `post` fixture service with a nested `Post.author` resolver.
pub fn post_service() -> (ServiceDefinition, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));

    let post_author = Resolver::Function(Arc::new(|parent: Value, _args, _ctx| {
        Box::pin(async move {
            Ok(json!({ "id": parent.get("authorId").cloned().unwrap_or(Value::Null) }))
        })
    }));

    let definition = graphql_service(
        GraphQLServiceConfig::new("post", POST_TYPE_DEFS)
            .action(
                GraphQLAction::new("postById", find_by_id(posts(), calls.clone()))
                    .query("postById"),
            )
            .action(
                GraphQLAction::new("postsById", filter_by_ids(posts(), calls.clone()))
                    .query("postsById"),
            )
            .resolver("Post", "author", post_author),
    )
    .expect("post service should build");
    (definition, calls)
}

pub const BATCH_AUTHOR_TYPE_DEFS: &str = "\
type Query {
  authorsById(ids: [ID!]!): [Author] @merge(keyField: \"id\")
}

type Author @key(selectionSet: \"{ id }\") {
  id: ID!
  name: String!
}
";

pub const BATCH_POST_TYPE_DEFS: &str = "\
type Query {
  postAuthorsById(ids: [ID!]!): [Author]
}

type Author {
  id: ID!
}
";

/// Batch-merge fixtures: the author fragment merges through a list-keyed
/// field, the post fragment exposes bare author stubs.
pub fn batch_author_service() -> (ServiceDefinition, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let definition = graphql_service(
        GraphQLServiceConfig::new("author", BATCH_AUTHOR_TYPE_DEFS).action(
            GraphQLAction::new("authorsById", filter_by_ids(authors(), calls.clone()))
                .query("authorsById"),
        ),
    )
    .expect("author service should build");
    (definition, calls)
}

pub fn batch_post_service() -> (ServiceDefinition, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));

    let post_authors = {
        let calls = calls.clone();
        Resolver::Function(Arc::new(move |_parent, args, _ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let stubs = args
                    .get("ids")
                    .and_then(Value::as_array)
                    .map(|ids| ids.iter().map(|id| json!({ "id": id })).collect())
                    .unwrap_or_default();
                Ok(Value::Array(stubs))
            })
        }))
    };

    let definition = graphql_service(
        GraphQLServiceConfig::new("post", BATCH_POST_TYPE_DEFS).resolver(
            "Query",
            "postAuthorsById",
            post_authors,
        ),
    )
    .expect("post service should build");
    (definition, calls)
}

/// A broker with both fixture services registered.
pub fn fixture_broker() -> (Arc<LocalBroker>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let broker = LocalBroker::new();
    let (author, author_calls) = author_service();
    let (post, post_calls) = post_service();
    broker.register(author);
    broker.register(post);
    (broker, author_calls, post_calls)
}

pub fn broker_ctx(broker: &Arc<LocalBroker>) -> BrokerContext {
    BrokerContext::new(broker.clone())
}

pub fn build_error(result: Result<ServiceDefinition, SchemaError>) -> SchemaError {
    match result {
        Ok(_) => panic!("expected the service build to fail"),
        Err(err) => err,
    }
}
