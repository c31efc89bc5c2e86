//! Error types for every boundary the core crosses.
//!
//! Each enum maps to one recovery policy:
//! - [`ParseError`] drops a single statement
//! - [`EvalError`] is per record (fatal for filters, null for output fields)
//! - [`StreamError`] belongs to a stream actor or its handle
//! - [`TransportError`] and [`SessionError`] end one client session

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A statement that could not be turned into an expression tree.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("Empty statement")]
    Empty,

    #[error("Unbalanced parentheses in \"{0}\"")]
    UnbalancedParens(String),

    #[error("Unbalanced quote marks in \"{0}\"")]
    UnbalancedQuotes(String),

    #[error("Empty argument in \"{0}\"")]
    EmptyArgument(String),

    #[error("Unrecognized function name '{0}'")]
    UnknownFunction(String),

    #[error("{function} expects {expected}, got {actual} argument(s)")]
    Arity {
        function: String,
        expected: String,
        actual: usize,
    },

    #[error("{function}: {message}")]
    InvalidArgument { function: String, message: String },

    #[error("\"{0}\" is not a literal, a function call or a field path")]
    InvalidPath(String),
}

/// A failure while evaluating an expression against one record.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("Field \"{0}\" not found")]
    FieldNotFound(String),

    #[error("{function} expects {expected} for {operand}, got {actual}")]
    TypeMismatch {
        function: String,
        operand: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("{function}: {message}")]
    InvalidValue { function: String, message: String },

    #[error("Integer overflow in {0}")]
    Overflow(String),

    #[error("Division by zero in {0}")]
    DivisionByZero(String),

    #[error("Empty window")]
    EmptyWindow,
}

/// Errors raised by a stream actor or while talking to one.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Failed to connect to upstream {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Upstream IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream actor for '{0}' is no longer running")]
    ActorGone(String),

    #[error("Stream registry is no longer running")]
    RegistryGone,
}

/// Errors on a client connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Reasons a client session ended abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Filter {statement} failed: {source}")]
    Filter {
        statement: String,
        #[source]
        source: EvalError,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
}
