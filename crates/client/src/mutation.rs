//! Mutations exposed as a store.
//!
//! Each call is tagged with a fresh token and only the most recent call may
//! publish its outcome, so overlapping calls never leave a stale result behind.

use std::fmt;
use std::sync::Arc;

use tracing::debug;
use watchstore_store::{Readable, Store, Unsubscribe};
use watchstore_types::{FetchResult, MutationOptions, OperationDescriptor, OperationError, ResultEnvelope};

use crate::call::{CallError, CallSequence, PendingCall, current_runtime};
use crate::client::{Client, ClientError, Operations, Payload, operation_label};

struct MutationInner<D> {
    client: Client,
    operation: OperationDescriptor,
    options: MutationOptions,
    store: Store<ResultEnvelope<D>>,
    calls: CallSequence,
}

/// A mutation that keeps the outcome of its most recent call.
///
/// The published state only uses `data`, `error` and `loading`.
pub struct Mutation<D> {
    inner: Arc<MutationInner<D>>,
}

impl<D> Clone for Mutation<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Payload> Mutation<D> {
    fn new(client: Client, operation: OperationDescriptor, options: MutationOptions) -> Self {
        Self {
            inner: Arc::new(MutationInner {
                client,
                operation,
                options,
                store: Store::new(ResultEnvelope::default()),
                calls: CallSequence::default(),
            }),
        }
    }

    /// Run the mutation with `overrides` layered over the container options.
    ///
    /// Unless overlap is allowed, calling while a previous call is loading is
    /// rejected. The returned handle yields the raw response even when a newer call
    /// has superseded this one. Outside a Tokio runtime the call is rejected with
    /// [`CallError::NoRuntime`] and state is left untouched.
    pub fn call(&self, overrides: MutationOptions) -> PendingCall<FetchResult<D>> {
        let inner = &self.inner;
        let engine = match inner.client.engine() {
            Ok(engine) => engine,
            Err(_) => return PendingCall::rejected(CallError::NotConfigured),
        };
        let runtime = match current_runtime() {
            Ok(runtime) => runtime,
            Err(error) => return PendingCall::rejected(error),
        };

        let options = inner.options.merged(&overrides);
        let allow_overlap = options.allow_overlap.unwrap_or(false);
        let token = inner.calls.issue();
        let claimed = inner.store.update_if(|current| {
            if current.loading && !allow_overlap {
                return None;
            }
            inner.calls.mark_latest(token);
            Some(ResultEnvelope {
                loading: true,
                ..ResultEnvelope::default()
            })
        });
        if !claimed {
            debug!(operation = %operation_label(&inner.operation), "mutation already loading, call suppressed");
            return PendingCall::rejected(CallError::Suppressed);
        }

        let execute_options = options.request.to_execute_options();
        let task_inner = Arc::clone(inner);
        debug!(operation = %operation_label(&inner.operation), ?token, "executing mutation");

        PendingCall::spawn_on(&runtime, async move {
            let inner = task_inner;
            let response = inner
                .decode_response(engine.execute(&inner.operation, &execute_options).await)
                .inspect_err(|error| debug!(operation = %operation_label(&inner.operation), error = %error, "mutation failed"));

            let settled = match &response {
                Ok(response) => settled_state(response.clone()),
                Err(error) => ResultEnvelope {
                    error: Some(error.clone()),
                    ..ResultEnvelope::default()
                },
            };
            let mut stale = false;
            inner.store.update_if(|current| {
                if !inner.calls.is_latest(token) {
                    stale = true;
                    return None;
                }
                (*current != settled).then_some(settled)
            });
            if stale {
                debug!(operation = %operation_label(&inner.operation), ?token, "discarding stale mutation result");
            }

            response.map_err(CallError::Operation)
        })
    }

    /// Remove `error` and `errors` from the current state.
    pub fn clear_error(&self) {
        self.inner.store.update_if(|current| {
            if current.error.is_none() && current.errors.is_none() {
                return None;
            }
            Some(ResultEnvelope {
                error: None,
                errors: None,
                ..current.clone()
            })
        });
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

impl<D: Payload> MutationInner<D> {
    fn decode_response(&self, response: Result<FetchResult, OperationError>) -> Result<FetchResult<D>, OperationError> {
        response?
            .decode::<D>()
            .map_err(|error| OperationError::client(format!("failed to decode mutation response: {error}")))
    }
}

/// The state published for a settled response. Graph errors are folded into one error.
fn settled_state<D>(response: FetchResult<D>) -> ResultEnvelope<D> {
    let error = response
        .has_graph_errors()
        .then(|| OperationError::from_graph_errors(response.graph_errors().to_vec()));
    ResultEnvelope {
        data: response.data,
        error,
        ..ResultEnvelope::default()
    }
}

impl<D: Payload> Readable<ResultEnvelope<D>> for Mutation<D> {
    fn get(&self) -> ResultEnvelope<D> {
        Mutation::get(self)
    }

    fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&ResultEnvelope<D>) + Send + Sync + 'static,
    {
        Mutation::subscribe(self, listener)
    }
}

impl<D> fmt::Debug for Mutation<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("operation", &self.inner.operation)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// A mutation container. The engine is resolved when the mutation is called.
    pub fn mutation<D: Payload>(&self, operations: impl Into<Operations>, options: MutationOptions) -> Result<Mutation<D>, ClientError> {
        let operation = self.resolve_operation(operations.into(), options.request.operation_name.as_deref())?;
        let options = self.config().mutation_defaults().merged(&options);
        Ok(Mutation::new(self.clone(), operation, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use watchstore_types::GraphError;

    #[test]
    fn graph_errors_are_aggregated() {
        let response = FetchResult::with_errors(
            Some(json!({"ok": false})),
            vec![GraphError::new("first"), GraphError::new("second")],
        );
        let state = settled_state(response);
        assert_eq!(state.data, Some(json!({"ok": false})));
        assert_eq!(state.error.map(|error| error.message), Some("first\nsecond".to_string()));
        assert!(!state.loading);
        assert!(state.network_status.is_none());
    }

    #[test]
    fn clean_responses_carry_no_error() {
        let state = settled_state(FetchResult::with_data(json!(1)));
        assert_eq!(state, ResultEnvelope::<Value> {
            data: Some(json!(1)),
            ..ResultEnvelope::default()
        });
    }

    #[tokio::test]
    async fn clear_error_is_idempotent() {
        let mutation: Mutation<Value> = Client::new()
            .mutation(OperationDescriptor::mutation().select("logout"), MutationOptions::default())
            .expect("mutation");
        let notified = Arc::new(parking_lot::Mutex::new(0));
        let _unsubscribe = {
            let notified = Arc::clone(&notified);
            mutation.subscribe(move |_| *notified.lock() += 1)
        };

        mutation.inner.store.set(ResultEnvelope {
            error: Some(OperationError::network("offline")),
            ..ResultEnvelope::default()
        });
        mutation.clear_error();
        mutation.clear_error();

        assert_eq!(*notified.lock(), 3);
        assert_eq!(mutation.get(), ResultEnvelope::default());
    }
}
