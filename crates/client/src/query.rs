//! Bridge from a watched query to a [`Store`].
//!
//! The store subscribes to the watched query when it gains its first listener and
//! drops the subscription when it loses its last one. Results are read from the
//! query's snapshot rather than the pushed payload, and updates that do not change
//! what a consumer renders are suppressed.
//!
//! A watched query closes its subscribers after delivering an error and replays a
//! recorded error to anyone who subscribes. To keep the store live the bridge
//! clears the recorded result before re-subscribing and restores it afterward.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use parking_lot::Mutex;
use serde_json::{Map as JsonMap, Value};
use tracing::{debug, warn};
use watchstore_store::{Readable, Setter, Store, Unsubscribe};
use watchstore_types::{NetworkStatus, OperationDescriptor, OperationError, QueryOptions, ResultEnvelope, SourceError};

use crate::client::{Client, ClientError, FaultHandler, Operations, Payload, operation_label};
use crate::engine::{QueryObserver, WatchedQuery};

/// Wrap `query` in a store whose initial value is the query's current snapshot.
///
/// Faults pushed by the query, and snapshots that cannot be decoded into `D`, are
/// handed to `faults` and leave the store unchanged.
pub fn readable_from_watched_query<D: Payload>(
    query: Arc<dyn WatchedQuery>,
    faults: FaultHandler,
) -> Result<Store<ResultEnvelope<D>>, ClientError> {
    let initial = query
        .current_result()
        .decode::<D>()
        .map_err(|error| ClientError::Decode(error.to_string()))?;

    Ok(Store::readable(initial, move |setter| {
        let link = Arc::new(BridgeLink {
            query: Arc::clone(&query),
            setter,
            faults: Arc::clone(&faults),
            subscription: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        BridgeLink::attach(&link);
        Some(Box::new(move || link.detach()) as Unsubscribe)
    }))
}

/// One activation of the bridge: lives from the first listener to the last.
struct BridgeLink<D> {
    query: Arc<dyn WatchedQuery>,
    setter: Setter<ResultEnvelope<D>>,
    faults: FaultHandler,
    subscription: Mutex<Option<Unsubscribe>>,
    closed: AtomicBool,
}

impl<D: Payload> BridgeLink<D> {
    fn observer(self: &Arc<Self>) -> QueryObserver {
        let on_next: Weak<Self> = Arc::downgrade(self);
        let on_error: Weak<Self> = Arc::downgrade(self);
        QueryObserver::new(
            move |_payload| {
                if let Some(link) = on_next.upgrade() {
                    link.handle_next();
                }
            },
            move |error| {
                if let Some(link) = on_error.upgrade() {
                    link.handle_error(error);
                }
            },
        )
    }

    fn attach(self: &Arc<Self>) {
        let unsubscribe = self.query.subscribe(self.observer());
        let mut slot = self.subscription.lock();
        // The query may call back into the link while subscribing; a re-subscription
        // made from there, or a detach, supersedes this handle.
        if slot.is_some() || self.closed.load(Ordering::SeqCst) {
            drop(slot);
            unsubscribe();
            return;
        }
        *slot = Some(unsubscribe);
        debug!("watched query subscribed");
    }

    fn detach(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let unsubscribe = self.subscription.lock().take();
        if let Some(unsubscribe) = unsubscribe {
            unsubscribe();
            debug!("watched query unsubscribed");
        }
    }

    fn handle_next(&self) {
        match self.query.current_result().decode::<D>() {
            Ok(next) => {
                self.setter.publish_if_changed(next, |current, next| current.same_observable_state(next));
            }
            Err(error) => (self.faults)(anyhow!(error).context("failed to decode watched query result")),
        }
    }

    fn handle_error(self: &Arc<Self>, error: SourceError) {
        if !self.closed.load(Ordering::SeqCst) {
            self.resubscribe();
        }

        match error {
            SourceError::Fault(fault) => {
                warn!(error = %fault, "watched query reported a fault");
                (self.faults)(fault);
            }
            SourceError::Operation(error) => self.publish_error(error),
        }
    }

    fn resubscribe(self: &Arc<Self>) {
        let last = self.query.preserve_last_result();
        let previous = self.subscription.lock().take();
        if let Some(unsubscribe) = previous {
            unsubscribe();
        }
        self.query.reset_last_results();
        self.attach();
        self.query.restore_last_result(last);
        debug!("watched query re-subscribed after an error");
    }

    fn publish_error(&self, error: OperationError) {
        self.setter.update_if(|previous| {
            let notify = previous.loading || previous.error.as_ref() != Some(&error);
            notify.then(|| ResultEnvelope {
                data: previous.data.clone(),
                error: Some(error),
                loading: false,
                network_status: Some(NetworkStatus::Error),
                errors: None,
            })
        });
    }
}

/// A watched query exposed as a store, together with the query handle itself.
pub struct ReadableQuery<D> {
    store: Store<ResultEnvelope<D>>,
    query: Arc<dyn WatchedQuery>,
    operation: OperationDescriptor,
}

impl<D> Clone for ReadableQuery<D> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            query: Arc::clone(&self.query),
            operation: self.operation.clone(),
        }
    }
}

impl<D: Payload> ReadableQuery<D> {
    pub fn get(&self) -> ResultEnvelope<D> {
        self.store.get()
    }

    pub fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&ResultEnvelope<D>) + Send + Sync + 'static,
    {
        self.store.subscribe(listener)
    }

    pub fn store(&self) -> &Store<ResultEnvelope<D>> {
        &self.store
    }

    /// The underlying watched query.
    pub fn observable(&self) -> Arc<dyn WatchedQuery> {
        Arc::clone(&self.query)
    }

    /// The operation that was sent to the engine, after combining.
    pub fn operation(&self) -> &OperationDescriptor {
        &self.operation
    }

    /// Re-run the query. Results reach listeners through the watched query.
    pub async fn refetch(&self, variables: Option<JsonMap<String, Value>>) -> Result<ResultEnvelope, OperationError> {
        self.query.refetch(variables).await
    }

    pub async fn set_variables(&self, variables: JsonMap<String, Value>) -> Result<ResultEnvelope, OperationError> {
        self.query.set_variables(variables).await
    }
}

impl<D: Payload> Readable<ResultEnvelope<D>> for ReadableQuery<D> {
    fn get(&self) -> ResultEnvelope<D> {
        ReadableQuery::get(self)
    }

    fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&ResultEnvelope<D>) + Send + Sync + 'static,
    {
        ReadableQuery::subscribe(self, listener)
    }
}

impl Client {
    /// Watch one operation, or several combined into one, as a store.
    pub fn query<D: Payload>(&self, operations: impl Into<Operations>, options: QueryOptions) -> Result<ReadableQuery<D>, ClientError> {
        let engine = self.engine()?;
        let operation = self.resolve_operation(operations.into(), options.operation_name.as_deref())?;
        let options = self.config().request_defaults().merged(&options);
        debug!(operation = %operation_label(&operation), "watching query");

        let query = engine.watch(&operation, &options.to_execute_options());
        let store = readable_from_watched_query(Arc::clone(&query), self.fault_handler())?;
        Ok(ReadableQuery { store, query, operation })
    }
}
