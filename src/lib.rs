pub mod broker;
pub mod context;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod request_handler;
pub mod schema_builder;
pub mod service;
pub mod stitcher;
pub mod validation;

pub use broker::{BrokerContext, LocalBroker, ServiceBroker, build_full_action_name};
pub use context::{GraphQLContext, GraphQLContextCreator};
pub use executor::GraphQLExecutor;
pub use gateway::GraphQLGateway;
pub use request_handler::RequestHandler;
pub use schema_builder::SchemaBuilder;
pub use service::graphql_service;
pub use stitcher::GatewayStitcher;

use graphql_parser::Pos;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The request envelope exchanged between the gateway and schema-owning
/// services. Flows across the broker boundary unchanged; a parsed document is
/// printed back to text before it is placed in the envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
    #[serde(
        rename = "operationName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_name: Option<String>,
}

/// A single entry of an execution result's error list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<PathSegment>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            locations: Vec::new(),
            path: Vec::new(),
        }
    }

    pub fn at(mut self, pos: Pos) -> Self {
        self.locations.push(Location {
            line: pos.line,
            column: pos.column,
        });
        self
    }

    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = path;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(value: &str) -> Self {
        PathSegment::Field(value.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(value: usize) -> Self {
        PathSegment::Index(value)
    }
}

/// The standard result shape returned by both local and remote execution.
/// `data` is omitted from the JSON form when execution never started,
/// serialized as an explicit `null` when it started and failed outright.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

impl ExecutionResult {
    pub fn of_errors(errors: Vec<GraphQLError>) -> Self {
        ExecutionResult { data: None, errors }
    }

    pub fn of_error(error: GraphQLError) -> Self {
        ExecutionResult::of_errors(vec![error])
    }
}
