//! Per-client control loop.
//!
//! A session reads one query record, parses its statements, subscribes to
//! the named stream and then, for every delivered record, applies the
//! filters (in order, stopping at the first false) and writes the evaluated
//! output fields back to the client.
//!
//! Error policy:
//! - a statement that fails to parse is logged and dropped from its list
//! - an output field that fails to evaluate is written as `null`
//! - a filter that fails to evaluate ends the session, since an
//!   always-failing filter would otherwise silently match nothing forever

use crate::error::{EvalError, SessionError, TransportError};
use crate::expression::{parse, Expression};
use crate::registry::StreamRegistry;
use crate::window::type_name;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

/// A bidirectional connection carrying one JSON value per message.
#[async_trait]
pub trait JsonConn: Send {
    /// Reads the next value, or `None` once the client has closed.
    ///
    /// Must be cancel-safe: the session races it against record delivery.
    async fn read_json(&mut self) -> Result<Option<Value>, TransportError>;

    async fn write_json(&mut self, value: &Value) -> Result<(), TransportError>;
}

/// The query a client sends first.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Query {
    #[serde(rename = "logName")]
    pub log_name: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
}

/// A statement together with the expression tree parsed from it.
#[derive(Debug)]
pub struct Statement {
    pub text: String,
    pub expression: Expression,
}

/// Parses every statement, logging and dropping the ones that fail.
pub fn parse_statements(role: &str, statements: &[String]) -> Vec<Statement> {
    statements
        .iter()
        .filter_map(|text| match parse(text) {
            Ok(expression) => {
                debug!(role, statement = %text, parsed = %expression, "parsed statement");
                Some(Statement {
                    text: text.clone(),
                    expression,
                })
            }
            Err(e) => {
                warn!(role, statement = %text, error = %e, "dropping statement");
                None
            }
        })
        .collect()
}

/// True when every filter passes. The first false stops evaluation.
pub fn passes_filters(filters: &mut [Statement], record: &Value) -> Result<bool, SessionError> {
    for filter in filters.iter_mut() {
        let verdict = filter
            .expression
            .evaluate(record)
            .map_err(|source| SessionError::Filter {
                statement: filter.text.clone(),
                source,
            })?;
        match verdict {
            Value::Bool(true) => continue,
            Value::Bool(false) => return Ok(false),
            other => {
                return Err(SessionError::Filter {
                    statement: filter.text.clone(),
                    source: EvalError::TypeMismatch {
                        function: "filter".to_string(),
                        operand: "result".to_string(),
                        expected: "bool",
                        actual: type_name(&other),
                    },
                })
            }
        }
    }
    Ok(true)
}

/// Evaluates the output fields into `[[statement, value], ...]`.
pub fn evaluate_fields(fields: &mut [Statement], record: &Value) -> Value {
    let pairs = fields
        .iter_mut()
        .map(|field| {
            let value = field.expression.evaluate(record).unwrap_or_else(|e| {
                warn!(statement = %field.text, error = %e, "field evaluation failed");
                Value::Null
            });
            Value::Array(vec![Value::String(field.text.clone()), value])
        })
        .collect();
    Value::Array(pairs)
}

pub struct ClientSession<C> {
    conn: C,
    registry: StreamRegistry,
    queue_capacity: usize,
}

impl<C: JsonConn> ClientSession<C> {
    pub fn new(conn: C, registry: StreamRegistry, queue_capacity: usize) -> Self {
        Self {
            conn,
            registry,
            queue_capacity,
        }
    }

    /// Runs the session until the client leaves, the stream ends or an
    /// error stops it. The subscription is released on every exit path.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let query = match self.read_query().await? {
            Some(query) => query,
            None => {
                info!("client closed before sending a query");
                return Ok(());
            }
        };

        let mut fields = parse_statements("field", &query.fields);
        let mut filters = parse_statements("filter", &query.filters);

        let stream = self.registry.locate(&query.log_name).await?;
        let mut subscription = stream.subscribe(self.queue_capacity).await?;
        info!(
            stream = %query.log_name,
            slot = subscription.slot(),
            fields = fields.len(),
            filters = filters.len(),
            "session subscribed"
        );

        loop {
            tokio::select! {
                record = subscription.recv() => {
                    let Some(record) = record else {
                        info!(stream = %query.log_name, "stream ended");
                        return Ok(());
                    };
                    if !passes_filters(&mut filters, &record)? {
                        continue;
                    }
                    let output = evaluate_fields(&mut fields, &record);
                    self.conn.write_json(&output).await?;
                }
                incoming = self.conn.read_json() => match incoming? {
                    Some(_) => debug!("ignoring client message received after the query"),
                    None => {
                        info!(stream = %query.log_name, "client disconnected");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn read_query(&mut self) -> Result<Option<Query>, SessionError> {
        let value = match self.conn.read_json().await {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(None),
            Err(TransportError::Json(e)) => return Err(SessionError::InvalidQuery(e.to_string())),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| SessionError::InvalidQuery(e.to_string()))
    }
}
