use thiserror::Error;

/// Configuration and build failures. These are fatal: a service that cannot
/// build its fragment does not start, and a gateway that cannot stitch does
/// not serve.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to parse type definitions: {0}")]
    InvalidTypeDefs(String),

    #[error("duplicate root field `{field}` on type `{type_name}`")]
    DuplicateRootField { type_name: String, field: String },

    #[error("field `{field}` is not defined on type `{type_name}`")]
    UnknownField { type_name: String, field: String },

    #[error("resolver references unknown type `{0}`")]
    UnknownType(String),

    #[error("invalid use of @{directive}: {reason}")]
    InvalidDirective { directive: String, reason: String },

    #[error("No registered GraphQL services")]
    NoGraphQLServices,
}

/// Failures raised by the broker boundary. Inside resolvers these are
/// captured as field errors; they never abort a whole request on their own.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown action `{0}`")]
    UnknownAction(String),

    #[error("call to `{action}` failed: {message}")]
    CallFailed { action: String, message: String },

    #[error("broadcast of `{0}` failed")]
    BroadcastFailed(String),
}

impl BrokerError {
    pub fn call_failed(action: impl Into<String>, message: impl ToString) -> Self {
        BrokerError::CallFailed {
            action: action.into(),
            message: message.to_string(),
        }
    }
}
