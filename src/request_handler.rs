use bytes::Bytes;
use graphql_parser::parse_query;
use http::header::{ACCEPT, ALLOW, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::Response;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::broker::BrokerContext;
use crate::context::GraphQLContextCreator;
use crate::executor::{OperationKind, select_operation};
use crate::stitcher::StitchedSchema;
use crate::validation::Validator;
use crate::{ExecutionResult, GraphQLError};

pub type HandlerResponse = Response<BoxBody<Bytes, hyper::Error>>;

const GRAPHIQL_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>GraphiQL - Stitchgate</title>
  <link href="https://unpkg.com/graphiql@1.5.0/graphiql.min.css" rel="stylesheet" />
  <style>
    body { margin: 0; padding: 0; height: 100vh; }
    #graphiql { height: 100vh; }
  </style>
</head>
<body>
  <div id="graphiql"></div>

  <script src="https://unpkg.com/react@17.0.2/umd/react.production.min.js"></script>
  <script src="https://unpkg.com/react-dom@17.0.2/umd/react-dom.production.min.js"></script>
  <script src="https://unpkg.com/graphiql@1.5.0/graphiql.min.js"></script>
  <script>
    function graphQLFetcher(graphQLParams) {
      return fetch(window.location.pathname, {
        method: 'post',
        headers: { 'Content-Type': 'application/json' },
        body: JSON.stringify(graphQLParams),
      }).then(response => response.json());
    }

    ReactDOM.render(
      React.createElement(GraphiQL, { fetcher: graphQLFetcher }),
      document.getElementById('graphiql')
    );
  </script>
</body>
</html>
"#;

// Create a response body from a string
fn full<T: Into<Bytes>>(value: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

/// The transport-agnostic shape of one inbound gateway request. The HTTP
/// bridge fills it from a hyper request; tests construct it directly.
pub struct GatewayRequest {
    pub url: Option<String>,
    pub method: Option<Method>,
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
    pub body: Option<Bytes>,
    pub ctx: BrokerContext,
}

impl GatewayRequest {
    pub fn new(ctx: BrokerContext) -> Self {
        GatewayRequest {
            url: Some("/graphql".to_string()),
            method: Some(Method::POST),
            headers: HeaderMap::new(),
            query: HashMap::new(),
            body: None,
            ctx,
        }
    }
}

pub struct RequestHandlerOptions {
    pub introspection: bool,
    pub show_graphiql: bool,
}

impl Default for RequestHandlerOptions {
    fn default() -> Self {
        RequestHandlerOptions {
            introspection: true,
            show_graphiql: true,
        }
    }
}

/// Serves one inbound HTTP-shaped GraphQL request against the composite
/// schema: fixed transport errors, the GraphiQL asset, or validate + execute.
pub struct RequestHandler {
    schema: Arc<StitchedSchema>,
    validator: Validator,
    context_creator: Arc<GraphQLContextCreator>,
    show_graphiql: bool,
}

impl RequestHandler {
    pub fn new(
        schema: Arc<StitchedSchema>,
        validator: Validator,
        context_creator: Arc<GraphQLContextCreator>,
        opts: RequestHandlerOptions,
    ) -> Self {
        RequestHandler {
            schema,
            validator,
            context_creator,
            show_graphiql: opts.introspection && opts.show_graphiql,
        }
    }

    pub fn schema(&self) -> &Arc<StitchedSchema> {
        &self.schema
    }

    pub async fn handle(&self, req: GatewayRequest) -> HandlerResponse {
        if req.url.is_none() {
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Missing request URL");
        }
        let Some(method) = req.method.clone() else {
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Missing request method");
        };

        if method != Method::GET && method != Method::POST {
            return Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .header(ALLOW, "GET, POST")
                .body(full("Method Not Allowed"))
                .unwrap_or_else(|_| internal_server_error());
        }

        if self.can_display_graphiql(&req, &method) {
            return respond_with_graphiql();
        }

        let request = match parse_graphql_request(&req, &method) {
            Ok(request) => request,
            Err(response) => return response,
        };

        let document = match parse_query::<String>(&request.query) {
            Ok(document) => document.into_static(),
            Err(err) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("Failed to parse query: {err}"),
                );
            }
        };

        // Standard transport rule: mutations ride on POST only.
        if method == Method::GET {
            if let Ok(operation) =
                select_operation(&document, request.operation_name.as_deref())
            {
                if operation.kind == OperationKind::Mutation {
                    return error_response(
                        StatusCode::METHOD_NOT_ALLOWED,
                        "Can only perform a mutation operation from a POST request.",
                    );
                }
            }
        }

        let validation_errors = self.validator.validate(&document);
        if !validation_errors.is_empty() {
            return json_response(
                StatusCode::BAD_REQUEST,
                &ExecutionResult::of_errors(validation_errors),
            );
        }

        let graphql_context = self.context_creator.create(req.ctx.clone()).await;
        let result = self
            .schema
            .execute_document(
                graphql_context,
                &document,
                request.variables.as_ref(),
                request.operation_name.as_deref(),
            )
            .await;

        json_response(StatusCode::OK, &result)
    }

    /// GraphiQL is served only for plain browser navigation: GET, no query
    /// string, HTML preferred over JSON, and both UI flags on.
    fn can_display_graphiql(&self, req: &GatewayRequest, method: &Method) -> bool {
        self.show_graphiql && *method == Method::GET && req.query.is_empty()
            && prefers_html(&req.headers)
    }
}

struct ParsedRequest {
    query: String,
    variables: Option<Map<String, Value>>,
    operation_name: Option<String>,
}

fn parse_graphql_request(
    req: &GatewayRequest,
    method: &Method,
) -> Result<ParsedRequest, HandlerResponse> {
    if *method == Method::GET {
        let Some(query) = req.query.get("query").filter(|q| !q.is_empty()) else {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "Must provide query string.",
            ));
        };

        let variables = match req.query.get("variables").filter(|v| !v.is_empty()) {
            Some(raw) => match serde_json::from_str::<Map<String, Value>>(raw) {
                Ok(variables) => Some(variables),
                Err(_) => {
                    return Err(error_response(
                        StatusCode::BAD_REQUEST,
                        "Variables are invalid JSON.",
                    ));
                }
            },
            None => None,
        };

        return Ok(ParsedRequest {
            query: query.clone(),
            variables,
            operation_name: req.query.get("operationName").cloned(),
        });
    }

    let Some(body) = req.body.as_ref().filter(|body| !body.is_empty()) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Must provide query string.",
        ));
    };

    match serde_json::from_slice::<crate::GraphQLRequest>(body) {
        Ok(request) => Ok(ParsedRequest {
            query: request.query,
            variables: request.variables,
            operation_name: request.operation_name,
        }),
        Err(err) => Err(error_response(
            StatusCode::BAD_REQUEST,
            format!("Invalid JSON request: {err}"),
        )),
    }
}

fn respond_with_graphiql() -> HandlerResponse {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html")
        .header(CONTENT_LENGTH, GRAPHIQL_HTML.len())
        .body(full(GRAPHIQL_HTML))
        .unwrap_or_else(|_| internal_server_error())
}

fn json_response(status: StatusCode, result: &ExecutionResult) -> HandlerResponse {
    let body = serde_json::to_string(result).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full(body))
        .unwrap_or_else(|_| internal_server_error())
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> HandlerResponse {
    json_response(status, &ExecutionResult::of_error(GraphQLError::new(message.into())))
}

fn plain_response(status: StatusCode, message: &'static str) -> HandlerResponse {
    Response::builder()
        .status(status)
        .body(full(message))
        .unwrap_or_else(|_| internal_server_error())
}

// Create a standard internal server error response
fn internal_server_error() -> HandlerResponse {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(full("Internal Server Error"))
        .unwrap()
}

/// Minimal `Accept` negotiation between JSON and HTML: HTML wins only when
/// its quality is strictly higher, matching the browser-navigation case.
fn prefers_html(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(ACCEPT).and_then(|value| value.to_str().ok()) else {
        return false;
    };

    let mut best_html = 0.0f32;
    let mut best_json = 0.0f32;

    for part in accept.split(',') {
        let mut pieces = part.trim().split(';');
        let media = pieces.next().unwrap_or("").trim();

        let mut quality = 1.0f32;
        for param in pieces {
            if let Some(value) = param.trim().strip_prefix("q=") {
                quality = value.parse().unwrap_or(0.0);
            }
        }

        if matches!(media, "text/html" | "text/*" | "*/*") && quality > best_html {
            best_html = quality;
        }
        if matches!(media, "application/json" | "application/*" | "*/*") && quality > best_json {
            best_json = quality;
        }
    }

    best_html > best_json
}
