use bytes::Bytes;
use clap::Parser;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stitchgate::broker::{ActionHandler, LocalBroker, ServiceDefinition};
use stitchgate::error::SchemaError;
use stitchgate::gateway::{GatewayOptions, GraphQLGateway};
use stitchgate::schema_builder::Resolver;
use stitchgate::service::{GraphQLAction, GraphQLServiceConfig, graphql_service};
use stitchgate::validation::DepthLimitRule;

#[derive(Parser)]
#[command(name = "stitchgate", about = "Schema-stitching GraphQL gateway demo")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:3000")]
    addr: SocketAddr,

    /// Directory holding the demo schema files
    #[arg(long, default_value = "./schemas")]
    schemas: PathBuf,

    /// Disable introspection and the GraphiQL UI
    #[arg(long)]
    no_introspection: bool,
}

fn author_service(type_defs: &str) -> Result<ServiceDefinition, SchemaError> {
    let authors = Arc::new(vec![
        json!({ "id": "1", "name": "O.J. Simpson" }),
        json!({ "id": "2", "name": "John Steinbeck" }),
    ]);

    let author_by_id: ActionHandler = {
        let authors = authors.clone();
        Arc::new(move |params, _ctx| {
            let authors = authors.clone();
            Box::pin(async move {
                let id = params.get("id").and_then(Value::as_str).unwrap_or_default();
                let result = authors
                    .iter()
                    .find(|author| author["id"] == id)
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(result)
            })
        })
    };

    let authors_by_id: ActionHandler = {
        let authors = authors.clone();
        Arc::new(move |params, _ctx| {
            let authors = authors.clone();
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
                let result = authors
                    .iter()
                    .filter(|author| {
                        author["id"]
                            .as_str()
                            .is_some_and(|id| ids.iter().any(|wanted| wanted == id))
                    })
                    .cloned()
                    .collect();
                Ok(Value::Array(result))
            })
        })
    };

    graphql_service(
        GraphQLServiceConfig::new("author", type_defs)
            .action(GraphQLAction::new("authorById", author_by_id).query("authorById"))
            .action(GraphQLAction::new("authorsById", authors_by_id).query("authorsById")),
    )
}

fn post_service(type_defs: &str) -> Result<ServiceDefinition, SchemaError> {
    let posts = Arc::new(vec![
        json!({ "id": "1", "authorId": "1", "message": "This is a test" }),
        json!({
            "id": "2",
            "authorId": "2",
            "message": "How can we live without our lives? How will we know it's us without our past?"
        }),
    ]);

    let post_by_id: ActionHandler = {
        let posts = posts.clone();
        Arc::new(move |params, _ctx| {
            let posts = posts.clone();
            Box::pin(async move {
                let id = params.get("id").and_then(Value::as_str).unwrap_or_default();
                let result = posts
                    .iter()
                    .find(|post| post["id"] == id)
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(result)
            })
        })
    };

    let posts_by_id: ActionHandler = {
        let posts = posts.clone();
        Arc::new(move |params, _ctx| {
            let posts = posts.clone();
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
                let result = posts
                    .iter()
                    .filter(|post| {
                        post["id"]
                            .as_str()
                            .is_some_and(|id| ids.iter().any(|wanted| wanted == id))
                    })
                    .cloned()
                    .collect();
                Ok(Value::Array(result))
            })
        })
    };

    let post_author = Resolver::Function(Arc::new(|parent: Value, _args, _ctx| {
        Box::pin(async move {
            Ok(json!({ "id": parent.get("authorId").cloned().unwrap_or(Value::Null) }))
        })
    }));

    graphql_service(
        GraphQLServiceConfig::new("post", type_defs)
            .action(GraphQLAction::new("postById", post_by_id).query("postById"))
            .action(GraphQLAction::new("postsById", posts_by_id).query("postsById"))
            .resolver("Post", "author", post_author),
    )
}

fn not_found() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(
            Full::new(Bytes::from_static(b"Not Found"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()).map_err(|never| match never {}).boxed()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let broker = LocalBroker::new();

    let author_sdl = std::fs::read_to_string(args.schemas.join("author.graphql"))?;
    let post_sdl = std::fs::read_to_string(args.schemas.join("post.graphql"))?;

    broker.register(author_service(&author_sdl)?);
    broker.register(post_service(&post_sdl)?);

    let gateway = Arc::new(GraphQLGateway::new(
        broker.clone(),
        GatewayOptions {
            introspection: !args.no_introspection,
            show_graphiql: !args.no_introspection,
            validation_rules: vec![Arc::new(DepthLimitRule::new(10))],
            context_factory: None,
        },
    ));

    let listener = TcpListener::bind(args.addr).await?;
    info!("GraphQL gateway listening on http://{}", args.addr);
    info!("GraphiQL UI available at http://{}/graphql", args.addr);

    loop {
        let (stream, _addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let gateway = Arc::clone(&gateway);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let gateway = gateway.clone();
                async move {
                    let response = if req.uri().path() == "/graphql" {
                        gateway.handle_http(req).await
                    } else {
                        not_found()
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });

            if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                error!("error processing connection: {err}");
            }
        });
    }
}
