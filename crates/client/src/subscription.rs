//! Subscription operations exposed as a store of the latest pushed event.

use std::sync::Arc;

use anyhow::anyhow;
use tracing::debug;
use watchstore_store::{Readable, Store, Unsubscribe};
use watchstore_types::{FetchResult, OperationDescriptor, SubscriptionOptions};

use crate::client::{Client, ClientError, FaultHandler, Operations, Payload, operation_label};
use crate::engine::EventStream;

/// Wrap `stream` in a store holding the latest event. Repeated equal events are dropped.
///
/// Events that cannot be decoded into `D` go to `faults`.
pub fn readable_from_event_stream<D: Payload>(stream: Arc<dyn EventStream>, faults: FaultHandler) -> Store<FetchResult<D>> {
    Store::readable(FetchResult::default(), move |setter| {
        let faults = Arc::clone(&faults);
        let on_next: Arc<dyn Fn(FetchResult) + Send + Sync> = Arc::new(move |event: FetchResult| match event.decode::<D>() {
            Ok(event) => {
                setter.publish_if_ne(event);
            }
            Err(error) => faults(anyhow!(error).context("failed to decode subscription event")),
        });
        Some(stream.subscribe(on_next))
    })
}

/// A subscription operation exposed as a store, together with its event stream.
pub struct ReadableSubscription<D> {
    store: Store<FetchResult<D>>,
    stream: Arc<dyn EventStream>,
    operation: OperationDescriptor,
}

impl<D> Clone for ReadableSubscription<D> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            stream: Arc::clone(&self.stream),
            operation: self.operation.clone(),
        }
    }
}

impl<D: Payload> ReadableSubscription<D> {
    pub fn get(&self) -> FetchResult<D> {
        self.store.get()
    }

    pub fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&FetchResult<D>) + Send + Sync + 'static,
    {
        self.store.subscribe(listener)
    }

    pub fn store(&self) -> &Store<FetchResult<D>> {
        &self.store
    }

    pub fn stream(&self) -> Arc<dyn EventStream> {
        Arc::clone(&self.stream)
    }

    pub fn operation(&self) -> &OperationDescriptor {
        &self.operation
    }
}

impl<D: Payload> Readable<FetchResult<D>> for ReadableSubscription<D> {
    fn get(&self) -> FetchResult<D> {
        ReadableSubscription::get(self)
    }

    fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&FetchResult<D>) + Send + Sync + 'static,
    {
        ReadableSubscription::subscribe(self, listener)
    }
}

impl Client {
    /// Open a subscription operation and expose its events as a store.
    pub fn subscribe<D: Payload>(
        &self,
        operations: impl Into<Operations>,
        options: SubscriptionOptions,
    ) -> Result<ReadableSubscription<D>, ClientError> {
        let engine = self.engine()?;
        let operation = self.resolve_operation(operations.into(), options.operation_name.as_deref())?;
        let options = self.config().request_defaults().merged(&options);
        debug!(operation = %operation_label(&operation), "opening subscription");

        let stream = engine.subscribe_to_events(&operation, &options.to_execute_options());
        let store = readable_from_event_stream(Arc::clone(&stream), self.fault_handler());
        Ok(ReadableSubscription { store, stream, operation })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEventStream;
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    #[test]
    fn equal_events_are_delivered_once() {
        let stream = Arc::new(MemoryEventStream::new(OperationDescriptor::subscription().select("ticks")));
        let store = readable_from_event_stream::<Value>(stream.clone(), Arc::new(|_: anyhow::Error| {}));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let unsubscribe = {
            let seen = Arc::clone(&seen);
            store.subscribe(move |event: &FetchResult| seen.lock().push(event.clone()))
        };
        assert_eq!(stream.subscriber_count(), 1);

        stream.push(FetchResult::with_data(json!(1)));
        stream.push(FetchResult::with_data(json!(1)));
        stream.push(FetchResult::with_data(json!(2)));

        assert_eq!(
            *seen.lock(),
            vec![
                FetchResult::default(),
                FetchResult::with_data(json!(1)),
                FetchResult::with_data(json!(2)),
            ]
        );

        unsubscribe();
        assert_eq!(stream.subscriber_count(), 0);
    }

    #[test]
    fn undecodable_events_are_faults() {
        let faults = Arc::new(Mutex::new(0));
        let handler: FaultHandler = {
            let faults = Arc::clone(&faults);
            Arc::new(move |_: anyhow::Error| *faults.lock() += 1)
        };
        let stream = Arc::new(MemoryEventStream::new(OperationDescriptor::subscription().select("ticks")));
        let store = readable_from_event_stream::<u64>(stream.clone(), handler);
        let _unsubscribe = store.subscribe(|_| {});

        stream.push(FetchResult::with_data(json!("not a number")));
        assert_eq!(*faults.lock(), 1);
        assert_eq!(store.get(), FetchResult::default());
    }
}
