//! Lazy queries: one-shot query executions exposed as a store.
//!
//! A lazy query is idle until called. Only one call may be outstanding; calling
//! again while the previous call is loading is rejected without touching state.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use watchstore_store::{Readable, Store, Unsubscribe};
use watchstore_types::{ErrorPolicy, FetchResult, LazyQueryOptions, OperationDescriptor, OperationError, ResultEnvelope};

use crate::call::{CallError, PendingCall, current_runtime};
use crate::client::{Client, ClientError, Operations, Payload, operation_label};

struct LazyQueryInner<D> {
    client: Client,
    operation: OperationDescriptor,
    options: LazyQueryOptions,
    store: Store<ResultEnvelope<D>>,
    last_call: Mutex<Option<PendingCall<ResultEnvelope<D>>>>,
}

/// A query that runs when called and keeps the outcome of its latest call.
pub struct LazyQuery<D> {
    inner: Arc<LazyQueryInner<D>>,
}

impl<D> Clone for LazyQuery<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Payload> LazyQuery<D> {
    fn new(client: Client, operation: OperationDescriptor, options: LazyQueryOptions) -> Self {
        Self {
            inner: Arc::new(LazyQueryInner {
                client,
                operation,
                options,
                store: Store::new(ResultEnvelope::default()),
                last_call: Mutex::new(None),
            }),
        }
    }

    /// Execute the query with `overrides` layered over the container options.
    ///
    /// Outside a Tokio runtime the call is rejected with [`CallError::NoRuntime`]
    /// and state is left untouched. The call settles and publishes its outcome
    /// whether or not the returned handle is awaited.
    pub fn call(&self, overrides: LazyQueryOptions) -> PendingCall<ResultEnvelope<D>> {
        let inner = &self.inner;
        let engine = match inner.client.engine() {
            Ok(engine) => engine,
            Err(_) => return PendingCall::rejected(CallError::NotConfigured),
        };
        let runtime = match current_runtime() {
            Ok(runtime) => runtime,
            Err(error) => return PendingCall::rejected(error),
        };

        // The handle is recorded together with the loading claim, so a clear
        // never observes a loading state without the call that owns it.
        let (settle, call) = PendingCall::deferred();
        let claimed = inner.store.update_if(|current| {
            if current.loading {
                return None;
            }
            *inner.last_call.lock() = Some(call.clone());
            Some(ResultEnvelope::loading())
        });
        if !claimed {
            debug!(operation = %operation_label(&inner.operation), "lazy query already loading, call suppressed");
            return PendingCall::rejected(CallError::Suppressed);
        }

        let execute_options = inner.options.merged(&overrides).to_execute_options();
        let operation = inner.operation.clone();
        let store = inner.store.clone();
        debug!(operation = %operation_label(&operation), "executing lazy query");

        settle.run_on(&runtime, async move {
            let error_policy = execute_options.error_policy;
            let outcome = engine
                .execute(&operation, &execute_options)
                .await
                .and_then(|response| settle_response::<D>(response, error_policy));
            match outcome {
                Ok(envelope) => {
                    store.set(envelope.clone());
                    Ok(envelope)
                }
                Err(error) => {
                    debug!(operation = %operation_label(&operation), error = %error, "lazy query failed");
                    store.set(ResultEnvelope::failed(error.clone()));
                    Err(CallError::Operation(error))
                }
            }
        });
        call
    }

    /// Remove `error` and `errors` once the last call has settled.
    pub async fn clear_error(&self) {
        self.clear_with(|current| {
            if current.error.is_none() && current.errors.is_none() {
                return None;
            }
            Some(ResultEnvelope {
                error: None,
                errors: None,
                ..current.clone()
            })
        })
        .await;
    }

    /// Remove the data and in-flight markers once the last call has settled.
    pub async fn clear_result(&self) {
        self.clear_with(|current| {
            if current.data.is_none() && !current.loading && current.network_status.is_none() {
                return None;
            }
            Some(ResultEnvelope {
                data: None,
                loading: false,
                network_status: None,
                ..current.clone()
            })
        })
        .await;
    }

    /// Return to the idle state once the last call has settled.
    pub async fn clear(&self) {
        self.clear_with(|current| (*current != ResultEnvelope::default()).then(ResultEnvelope::default))
            .await;
    }

    /// Apply `transition` once no call is outstanding.
    ///
    /// A call issued while waiting is waited for in turn, so a clear never resets
    /// the state of a call that is still in flight.
    async fn clear_with<F>(&self, transition: F)
    where
        F: Fn(&ResultEnvelope<D>) -> Option<ResultEnvelope<D>>,
    {
        loop {
            let awaited = self.inner.last_call.lock().clone();
            if let Some(call) = awaited.clone() {
                call.settled().await;
            }

            let mut superseded = false;
            self.inner.store.update_if(|current| {
                let latest = self.inner.last_call.lock();
                let unchanged = match (latest.as_ref(), awaited.as_ref()) {
                    (Some(latest), Some(awaited)) => latest.same_call(awaited),
                    (None, None) => true,
                    _ => false,
                };
                if !unchanged {
                    superseded = true;
                    return None;
                }
                transition(current)
            });
            if !superseded {
                return;
            }
        }
    }

    pub fn get(&self) -> ResultEnvelope<D> {
        self.inner.store.get()
    }

    pub fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&ResultEnvelope<D>) + Send + Sync + 'static,
    {
        self.inner.store.subscribe(listener)
    }

    pub fn store(&self) -> &Store<ResultEnvelope<D>> {
        &self.inner.store
    }

    pub fn operation(&self) -> &OperationDescriptor {
        &self.inner.operation
    }
}

impl<D: Payload> Readable<ResultEnvelope<D>> for LazyQuery<D> {
    fn get(&self) -> ResultEnvelope<D> {
        LazyQuery::get(self)
    }

    fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&ResultEnvelope<D>) + Send + Sync + 'static,
    {
        LazyQuery::subscribe(self, listener)
    }
}

impl<D> fmt::Debug for LazyQuery<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyQuery")
            .field("operation", &self.inner.operation)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

/// Turn a settled response into the published envelope according to `error_policy`.
fn settle_response<D: Payload>(response: FetchResult, error_policy: ErrorPolicy) -> Result<ResultEnvelope<D>, OperationError> {
    let response = response
        .decode::<D>()
        .map_err(|error| OperationError::client(format!("failed to decode response: {error}")))?;
    if !response.has_graph_errors() {
        return Ok(ResultEnvelope::ready(response.data));
    }

    match error_policy {
        ErrorPolicy::None => Err(OperationError::from_graph_errors(response.errors.unwrap_or_default())),
        ErrorPolicy::Ignore => Ok(ResultEnvelope::ready(response.data)),
        ErrorPolicy::All => {
            let errors = response.errors.unwrap_or_default();
            Ok(ResultEnvelope {
                error: Some(OperationError::from_graph_errors(errors.clone())),
                errors: Some(errors),
                ..ResultEnvelope::ready(response.data)
            })
        }
    }
}

impl Client {
    /// A query that runs on demand. The engine is resolved when the query is called.
    pub fn lazy_query<D: Payload>(&self, operations: impl Into<Operations>, options: LazyQueryOptions) -> Result<LazyQuery<D>, ClientError> {
        let operation = self.resolve_operation(operations.into(), options.operation_name.as_deref())?;
        let options = self.config().request_defaults().merged(&options);
        Ok(LazyQuery::new(self.clone(), operation, options))
    }
}
