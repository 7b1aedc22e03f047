//! Contract of the execution engine the adapters run on top of.
//!
//! The engine performs the actual requests and keeps whatever result cache it
//! likes; the adapters only rely on the traits below. [`memory`] provides an
//! in-process implementation used by tests and the demo binary.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value};
use watchstore_store::Unsubscribe;
use watchstore_types::{ExecuteOptions, FetchResult, OperationDescriptor, OperationError, ResultEnvelope, SourceError};

pub use memory::{DeferredExecution, ExecutionRecord, MemoryEngine, MemoryEventStream, MemoryWatchedQuery, WatchEvent};

/// Executes operations and opens long-lived result sources.
#[async_trait]
pub trait OperationEngine: Send + Sync {
    /// Run `operation` once and return the settled response.
    async fn execute(&self, operation: &OperationDescriptor, options: &ExecuteOptions) -> Result<FetchResult, OperationError>;

    /// Open a watched query that pushes successive results for `operation`.
    fn watch(&self, operation: &OperationDescriptor, options: &ExecuteOptions) -> Arc<dyn WatchedQuery>;

    /// Open a stream of server pushed events for a subscription operation.
    fn subscribe_to_events(&self, operation: &OperationDescriptor, options: &ExecuteOptions) -> Arc<dyn EventStream>;
}

/// Result and error callbacks registered on a [`WatchedQuery`].
#[derive(Clone)]
pub struct QueryObserver {
    on_next: Arc<dyn Fn(ResultEnvelope) + Send + Sync>,
    on_error: Arc<dyn Fn(SourceError) + Send + Sync>,
}

impl QueryObserver {
    pub fn new<N, E>(on_next: N, on_error: E) -> Self
    where
        N: Fn(ResultEnvelope) + Send + Sync + 'static,
        E: Fn(SourceError) + Send + Sync + 'static,
    {
        Self {
            on_next: Arc::new(on_next),
            on_error: Arc::new(on_error),
        }
    }

    pub fn next(&self, result: ResultEnvelope) {
        (self.on_next)(result)
    }

    pub fn error(&self, error: SourceError) {
        (self.on_error)(error)
    }
}

impl fmt::Debug for QueryObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver").finish_non_exhaustive()
    }
}

/// The engine's record of the last result or error a watched query delivered.
///
/// Engines redeliver a recorded error to new subscribers, which is why the bridge
/// clears it before re-subscribing and puts it back afterward.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LastResult {
    pub result: Option<ResultEnvelope>,
    pub error: Option<OperationError>,
}

/// A push-based source of results for one query.
///
/// Once a watched query delivers an error its subscribers are closed; a consumer
/// that wants further results has to subscribe again.
#[async_trait]
pub trait WatchedQuery: Send + Sync {
    /// The authoritative current result. Pushed payloads may differ from it for
    /// in-flight states, so consumers read this instead.
    fn current_result(&self) -> ResultEnvelope;

    /// Forget the last delivered result and error.
    fn reset_last_results(&self);

    /// Capture the last result marker so it can survive a re-subscription.
    ///
    /// Engines that cannot expose the marker keep the default, which makes the
    /// bridge fall back to a plain reset and re-subscribe.
    fn preserve_last_result(&self) -> Option<LastResult> {
        None
    }

    /// Put back a marker captured with [`WatchedQuery::preserve_last_result`].
    fn restore_last_result(&self, _last: Option<LastResult>) {}

    fn subscribe(&self, observer: QueryObserver) -> Unsubscribe;

    /// Re-run the query, optionally with new variables.
    async fn refetch(&self, variables: Option<JsonMap<String, Value>>) -> Result<ResultEnvelope, OperationError>;

    /// Replace the variables of the query and re-run it if they changed.
    async fn set_variables(&self, variables: JsonMap<String, Value>) -> Result<ResultEnvelope, OperationError>;
}

/// A push-only stream of subscription events.
pub trait EventStream: Send + Sync {
    fn subscribe(&self, on_next: Arc<dyn Fn(FetchResult) + Send + Sync>) -> Unsubscribe;
}
