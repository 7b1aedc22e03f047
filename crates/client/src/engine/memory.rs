//! In-process engine for tests, previews and the demo binary.
//!
//! Executions either take the next scripted outcome or wait until the caller
//! resolves them through [`MemoryEngine::next_deferred`], which lets tests settle
//! overlapping calls in any order. Watched queries and event streams are driven by
//! hand with `push_*` methods.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map as JsonMap, Value};
use tokio::sync::{Notify, oneshot};
use tracing::debug;
use watchstore_store::Unsubscribe;
use watchstore_types::{ExecuteOptions, FetchResult, OperationDescriptor, OperationError, ResultEnvelope, SourceError};

use super::{EventStream, LastResult, OperationEngine, QueryObserver, WatchedQuery};

type Outcome = Result<FetchResult, OperationError>;

/// One request received by [`MemoryEngine::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub operation: OperationDescriptor,
    pub options: ExecuteOptions,
}

/// An execution waiting for the test to settle it.
#[derive(Debug)]
pub struct DeferredExecution {
    pub record: ExecutionRecord,
    responder: oneshot::Sender<Outcome>,
}

impl DeferredExecution {
    pub fn resolve(self, result: FetchResult) {
        self.respond(Ok(result));
    }

    pub fn reject(self, error: OperationError) {
        self.respond(Err(error));
    }

    pub fn respond(self, outcome: Outcome) {
        if self.responder.send(outcome).is_err() {
            debug!(operation = ?self.record.operation.name, "deferred execution dropped by its caller");
        }
    }
}

#[derive(Default)]
struct EngineState {
    executions: Vec<ExecutionRecord>,
    scripted: VecDeque<Outcome>,
    deferred: Vec<DeferredExecution>,
    watch_initial: VecDeque<ResultEnvelope>,
    watched: Vec<Arc<MemoryWatchedQuery>>,
    streams: Vec<Arc<MemoryEventStream>>,
}

/// Scriptable in-memory [`OperationEngine`].
#[derive(Default)]
pub struct MemoryEngine {
    state: Mutex<EngineState>,
    deferred_ready: Notify,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next execution. Executions without a queued outcome are deferred.
    pub fn respond_with(&self, outcome: Outcome) {
        self.state.lock().scripted.push_back(outcome);
    }

    /// Queue the initial snapshot of the next watched query. Defaults to a loading result.
    pub fn prepare_watch(&self, initial: ResultEnvelope) {
        self.state.lock().watch_initial.push_back(initial);
    }

    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.state.lock().executions.clone()
    }

    pub fn execution_count(&self) -> usize {
        self.state.lock().executions.len()
    }

    /// Wait until `count` executions are deferred and take them, oldest first.
    pub async fn next_deferred(&self, count: usize) -> Vec<DeferredExecution> {
        loop {
            let notified = self.deferred_ready.notified();
            {
                let mut state = self.state.lock();
                if state.deferred.len() >= count {
                    return state.deferred.drain(..count).collect();
                }
            }
            notified.await;
        }
    }

    pub fn watched_queries(&self) -> Vec<Arc<MemoryWatchedQuery>> {
        self.state.lock().watched.clone()
    }

    pub fn event_streams(&self) -> Vec<Arc<MemoryEventStream>> {
        self.state.lock().streams.clone()
    }
}

enum Dispatch {
    Ready(Outcome),
    Waiting(oneshot::Receiver<Outcome>),
}

#[async_trait]
impl OperationEngine for MemoryEngine {
    async fn execute(&self, operation: &OperationDescriptor, options: &ExecuteOptions) -> Result<FetchResult, OperationError> {
        let record = ExecutionRecord {
            operation: operation.clone(),
            options: options.clone(),
        };
        let dispatch = {
            let mut state = self.state.lock();
            state.executions.push(record.clone());
            match state.scripted.pop_front() {
                Some(outcome) => Dispatch::Ready(outcome),
                None => {
                    let (responder, receiver) = oneshot::channel();
                    state.deferred.push(DeferredExecution { record, responder });
                    Dispatch::Waiting(receiver)
                }
            }
        };

        match dispatch {
            Dispatch::Ready(outcome) => outcome,
            Dispatch::Waiting(receiver) => {
                self.deferred_ready.notify_waiters();
                receiver
                    .await
                    .unwrap_or_else(|_| Err(OperationError::network("execution was dropped before it settled")))
            }
        }
    }

    fn watch(&self, operation: &OperationDescriptor, options: &ExecuteOptions) -> Arc<dyn WatchedQuery> {
        let mut state = self.state.lock();
        let initial = state.watch_initial.pop_front().unwrap_or_else(ResultEnvelope::loading);
        let query = Arc::new(MemoryWatchedQuery::new(operation.clone(), initial, options.variables.clone()));
        state.watched.push(Arc::clone(&query));
        query
    }

    fn subscribe_to_events(&self, operation: &OperationDescriptor, _options: &ExecuteOptions) -> Arc<dyn EventStream> {
        let stream = Arc::new(MemoryEventStream::new(operation.clone()));
        self.state.lock().streams.push(Arc::clone(&stream));
        stream
    }
}

/// Calls made on a [`MemoryWatchedQuery`], in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    Subscribed,
    Unsubscribed,
    Preserved,
    ResetLastResults,
    Restored,
}

struct WatchState {
    current: ResultEnvelope,
    last: Option<LastResult>,
    observers: Vec<(u64, QueryObserver)>,
    next_id: u64,
    journal: Vec<WatchEvent>,
    variables: JsonMap<String, Value>,
}

/// Hand-driven watched query.
///
/// Like real engines it closes every observer after delivering an error and
/// redelivers a recorded error to anyone subscribing while it is still recorded.
pub struct MemoryWatchedQuery {
    operation: OperationDescriptor,
    state: Arc<Mutex<WatchState>>,
}

impl MemoryWatchedQuery {
    pub fn new(operation: OperationDescriptor, initial: ResultEnvelope, variables: JsonMap<String, Value>) -> Self {
        Self {
            operation,
            state: Arc::new(Mutex::new(WatchState {
                current: initial,
                last: None,
                observers: Vec::new(),
                next_id: 1,
                journal: Vec::new(),
                variables,
            })),
        }
    }

    pub fn operation(&self) -> &OperationDescriptor {
        &self.operation
    }

    /// Replace the snapshot without notifying anyone.
    pub fn set_current(&self, result: ResultEnvelope) {
        self.state.lock().current = result;
    }

    /// Deliver `payload` to observers without touching the snapshot.
    pub fn emit_next(&self, payload: ResultEnvelope) {
        let observers = self.observers();
        for observer in observers {
            observer.next(payload.clone());
        }
    }

    /// Update the snapshot and push it to observers.
    pub fn push_result(&self, result: ResultEnvelope) {
        {
            let mut state = self.state.lock();
            state.current = result.clone();
            state.last = Some(LastResult {
                result: Some(result.clone()),
                error: None,
            });
        }
        self.emit_next(result);
    }

    /// Push a remote-operation error, closing every observer.
    pub fn push_error(&self, error: OperationError) {
        let observers = {
            let mut state = self.state.lock();
            let last = state.last.get_or_insert_with(LastResult::default);
            last.error = Some(error.clone());
            state.observers.drain(..).map(|(_, observer)| observer).collect::<Vec<_>>()
        };
        for observer in observers {
            observer.error(SourceError::Operation(error.clone()));
        }
    }

    /// Push a transport fault, closing every observer.
    pub fn push_fault(&self, message: &str) {
        let observers = {
            let mut state = self.state.lock();
            state.observers.drain(..).map(|(_, observer)| observer).collect::<Vec<_>>()
        };
        for observer in observers {
            observer.error(SourceError::fault(anyhow!(message.to_string())));
        }
    }

    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    pub fn journal(&self) -> Vec<WatchEvent> {
        self.state.lock().journal.clone()
    }

    pub fn last_result(&self) -> Option<LastResult> {
        self.state.lock().last.clone()
    }

    pub fn variables(&self) -> JsonMap<String, Value> {
        self.state.lock().variables.clone()
    }

    fn observers(&self) -> Vec<QueryObserver> {
        self.state.lock().observers.iter().map(|(_, observer)| observer.clone()).collect()
    }
}

#[async_trait]
impl WatchedQuery for MemoryWatchedQuery {
    fn current_result(&self) -> ResultEnvelope {
        self.state.lock().current.clone()
    }

    fn reset_last_results(&self) {
        let mut state = self.state.lock();
        state.last = None;
        state.journal.push(WatchEvent::ResetLastResults);
    }

    fn preserve_last_result(&self) -> Option<LastResult> {
        let mut state = self.state.lock();
        state.journal.push(WatchEvent::Preserved);
        state.last.clone()
    }

    fn restore_last_result(&self, last: Option<LastResult>) {
        let mut state = self.state.lock();
        state.last = last;
        state.journal.push(WatchEvent::Restored);
    }

    fn subscribe(&self, observer: QueryObserver) -> Unsubscribe {
        let recorded_error = {
            let mut state = self.state.lock();
            state.journal.push(WatchEvent::Subscribed);
            state.last.as_ref().and_then(|last| last.error.clone())
        };

        if let Some(error) = recorded_error {
            observer.error(SourceError::Operation(error));
            let state = Arc::clone(&self.state);
            return Box::new(move || state.lock().journal.push(WatchEvent::Unsubscribed));
        }

        let observer_id = {
            let mut state = self.state.lock();
            let observer_id = state.next_id;
            state.next_id += 1;
            state.observers.push((observer_id, observer));
            observer_id
        };
        let state = Arc::clone(&self.state);
        Box::new(move || {
            let mut state = state.lock();
            state.observers.retain(|(id, _)| *id != observer_id);
            state.journal.push(WatchEvent::Unsubscribed);
        })
    }

    async fn refetch(&self, variables: Option<JsonMap<String, Value>>) -> Result<ResultEnvelope, OperationError> {
        let mut state = self.state.lock();
        if let Some(variables) = variables {
            state.variables = variables;
        }
        Ok(state.current.clone())
    }

    async fn set_variables(&self, variables: JsonMap<String, Value>) -> Result<ResultEnvelope, OperationError> {
        let mut state = self.state.lock();
        state.variables = variables;
        Ok(state.current.clone())
    }
}

/// Hand-driven event stream.
pub struct MemoryEventStream {
    operation: OperationDescriptor,
    subscribers: Arc<Mutex<Vec<(u64, Arc<dyn Fn(FetchResult) + Send + Sync>)>>>,
    next_id: Mutex<u64>,
}

impl MemoryEventStream {
    pub fn new(operation: OperationDescriptor) -> Self {
        Self {
            operation,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_id: Mutex::new(1),
        }
    }

    pub fn operation(&self) -> &OperationDescriptor {
        &self.operation
    }

    pub fn push(&self, event: FetchResult) {
        let subscribers = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, on_next)| Arc::clone(on_next))
            .collect::<Vec<_>>();
        for on_next in subscribers {
            on_next(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl EventStream for MemoryEventStream {
    fn subscribe(&self, on_next: Arc<dyn Fn(FetchResult) + Send + Sync>) -> Unsubscribe {
        let subscriber_id = {
            let mut next_id = self.next_id.lock();
            let subscriber_id = *next_id;
            *next_id += 1;
            subscriber_id
        };
        self.subscribers.lock().push((subscriber_id, on_next));
        let subscribers = Arc::clone(&self.subscribers);
        Box::new(move || subscribers.lock().retain(|(id, _)| *id != subscriber_id))
    }
}
