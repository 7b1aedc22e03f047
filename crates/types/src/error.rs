//! Error values carried by operation results and push sources.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use thiserror::Error;

/// Position of a graph error inside the operation document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

/// A single error reported by the remote executor for one operation.
///
/// Mirrors the shape of entries in a response `errors` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphError {
    /// Human readable description of the failure.
    pub message: String,
    /// Response path of the field that failed, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    /// Locations in the document the error refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<SourceLocation>>,
    /// Executor specific metadata (error codes and similar).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<JsonMap<String, Value>>,
}

impl GraphError {
    /// Create an error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            locations: None,
            extensions: None,
        }
    }

    /// Attach a response path.
    pub fn with_path(mut self, path: Vec<Value>) -> Self {
        self.path = Some(path);
        self
    }
}

/// Structured remote-operation error.
///
/// This is the only error kind that is folded into result state. It aggregates the
/// graph errors of a response, a network failure, or client side failures such as a
/// payload that could not be decoded into the caller's data type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{message}")]
pub struct OperationError {
    pub message: String,
    #[serde(default)]
    pub graph_errors: Vec<GraphError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_error: Option<String>,
    #[serde(default)]
    pub client_errors: Vec<String>,
}

impl OperationError {
    /// Aggregate a response error list into one error value.
    pub fn from_graph_errors(graph_errors: Vec<GraphError>) -> Self {
        let message = graph_errors
            .iter()
            .map(|error| error.message.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            message,
            graph_errors,
            network_error: None,
            client_errors: Vec::new(),
        }
    }

    /// A failure reaching the executor.
    pub fn network(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            message: message.clone(),
            graph_errors: Vec::new(),
            network_error: Some(message),
            client_errors: Vec::new(),
        }
    }

    /// A failure on the client side after a response arrived.
    pub fn client(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            message: message.clone(),
            graph_errors: Vec::new(),
            network_error: None,
            client_errors: vec![message],
        }
    }

    pub fn has_graph_errors(&self) -> bool {
        !self.graph_errors.is_empty()
    }
}

/// Error pushed by a watched query on its error channel.
///
/// Only [`SourceError::Operation`] values become part of result state. A
/// [`SourceError::Fault`] is a transport or programming failure and is handed to
/// the owner's fault handler instead.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error("push source fault: {0}")]
    Fault(anyhow::Error),
}

impl SourceError {
    pub fn fault(error: impl Into<anyhow::Error>) -> Self {
        SourceError::Fault(error.into())
    }

    /// Whether the error carries the structured remote-operation shape.
    pub fn is_operation_error(&self) -> bool {
        matches!(self, SourceError::Operation(_))
    }
}
