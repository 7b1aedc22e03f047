//! The client: explicit holder of the engine, configuration and fault channel.
//!
//! Every container is created through a [`Client`], which replaces a process-wide
//! client reference. A client without an engine can still be handed around; the
//! operations that need the engine fail with `NotConfigured`.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::error;
use watchstore_types::{CombineError, OperationDescriptor, combine, generated_operation_name};

use crate::config::ClientConfig;
use crate::engine::OperationEngine;

/// Receives faults that are not part of any result state.
pub type FaultHandler = Arc<dyn Fn(anyhow::Error) + Send + Sync>;

/// Payload types a container can decode results into.
pub trait Payload: DeserializeOwned + Clone + PartialEq + Send + Sync + 'static {}

impl<T> Payload for T where T: DeserializeOwned + Clone + PartialEq + Send + Sync + 'static {}

/// Errors raised while creating containers.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client has no operation engine configured")]
    NotConfigured,
    #[error(transparent)]
    Combine(#[from] CombineError),
    #[error("failed to decode operation result: {0}")]
    Decode(String),
}

/// One operation, or several to be combined into one round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum Operations {
    Single(OperationDescriptor),
    Many(Vec<OperationDescriptor>),
}

impl From<OperationDescriptor> for Operations {
    fn from(operation: OperationDescriptor) -> Self {
        Operations::Single(operation)
    }
}

impl From<Vec<OperationDescriptor>> for Operations {
    fn from(operations: Vec<OperationDescriptor>) -> Self {
        Operations::Many(operations)
    }
}

impl<const N: usize> From<[OperationDescriptor; N]> for Operations {
    fn from(operations: [OperationDescriptor; N]) -> Self {
        Operations::Many(operations.into())
    }
}

struct ClientInner {
    engine: RwLock<Option<Arc<dyn OperationEngine>>>,
    config: RwLock<ClientConfig>,
    faults: RwLock<FaultHandler>,
}

/// Cheaply clonable handle shared by every container it creates.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// A client without an engine.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClientInner {
                engine: RwLock::new(None),
                config: RwLock::new(ClientConfig::default()),
                faults: RwLock::new(default_fault_handler()),
            }),
        }
    }

    pub fn with_engine(engine: Arc<dyn OperationEngine>) -> Self {
        let client = Self::new();
        client.configure(engine);
        client
    }

    pub fn with_config(self, config: ClientConfig) -> Self {
        *self.inner.config.write() = config;
        self
    }

    /// Route faults to `handler` instead of the log.
    pub fn with_fault_handler<F>(self, handler: F) -> Self
    where
        F: Fn(anyhow::Error) + Send + Sync + 'static,
    {
        *self.inner.faults.write() = Arc::new(handler);
        self
    }

    /// Install or replace the engine. Containers resolve the engine when they need it.
    pub fn configure(&self, engine: Arc<dyn OperationEngine>) {
        *self.inner.engine.write() = Some(engine);
    }

    pub fn is_configured(&self) -> bool {
        self.inner.engine.read().is_some()
    }

    pub fn engine(&self) -> Result<Arc<dyn OperationEngine>, ClientError> {
        self.inner.engine.read().clone().ok_or(ClientError::NotConfigured)
    }

    pub fn config(&self) -> ClientConfig {
        self.inner.config.read().clone()
    }

    pub fn fault_handler(&self) -> FaultHandler {
        Arc::clone(&self.inner.faults.read())
    }

    /// Turn caller supplied operations into the single descriptor sent to the engine.
    ///
    /// Several operations are combined under `operation_name`, or under a generated
    /// name when none is given.
    pub fn resolve_operation(&self, operations: Operations, operation_name: Option<&str>) -> Result<OperationDescriptor, ClientError> {
        match operations {
            Operations::Single(operation) => Ok(operation),
            Operations::Many(operations) => {
                let first = operations.first().ok_or(CombineError::Empty)?;
                let name = match operation_name {
                    Some(name) => name.to_string(),
                    None => {
                        let prefix = self
                            .config()
                            .operation_name_prefix
                            .unwrap_or_else(|| first.kind.name_prefix().to_string());
                        generated_operation_name(&prefix)
                    }
                };
                Ok(combine(&operations, &name)?)
            }
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("configured", &self.is_configured())
            .field("config", &*self.inner.config.read())
            .finish()
    }
}

fn default_fault_handler() -> FaultHandler {
    Arc::new(|fault: anyhow::Error| {
        error!(error = %format!("{fault:#}"), "unhandled fault from a result source");
    })
}

/// Log label for an operation.
pub(crate) fn operation_label(operation: &OperationDescriptor) -> String {
    match &operation.name {
        Some(name) => format!("{} {}", operation.kind, name),
        None => format!("anonymous {}", operation.kind),
    }
}
