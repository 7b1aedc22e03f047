use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::{Value, json};
use watchstore::engine::DeferredExecution;
use watchstore::{
    CallError, Client, ClientConfig, ErrorPolicy, FetchPolicy, FetchResult, GraphError, LazyQueryOptions, MemoryEngine, MutationOptions,
    OperationDescriptor, OperationError, Readable, ResultEnvelope, Unsubscribe,
};

fn user() -> OperationDescriptor {
    OperationDescriptor::query().variable("id", "ID!").select("user(id: $id) { id name }")
}

fn rename() -> OperationDescriptor {
    OperationDescriptor::mutation().named("Rename").select("rename(label: $label) { label }")
}

fn setup() -> (Arc<MemoryEngine>, Client) {
    let engine = Arc::new(MemoryEngine::new());
    let client = Client::with_engine(engine.clone());
    (engine, client)
}

fn counter<T, R>(readable: &R) -> (Arc<AtomicUsize>, Unsubscribe)
where
    R: Readable<T>,
{
    let count = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&count);
    let unsubscribe = readable.subscribe(move |_: &T| {
        sink.fetch_add(1, Ordering::SeqCst);
    });
    (count, unsubscribe)
}

fn label_of(execution: &DeferredExecution) -> Option<String> {
    execution.record.options.variables.get("label").and_then(Value::as_str).map(str::to_string)
}

#[tokio::test]
async fn lazy_query_rejects_calls_while_loading() {
    let (engine, client) = setup();
    let lazy = client.lazy_query::<Value>(user(), LazyQueryOptions::default()).expect("lazy query");

    let first = lazy.call(LazyQueryOptions::default().with_variable("id", "u1"));
    let loading = lazy.get();
    assert!(loading.loading);

    let rejected = lazy.call(LazyQueryOptions::default().with_variable("id", "u2")).await;
    assert_eq!(rejected, Err(CallError::Suppressed));
    assert_eq!(lazy.get(), loading, "a rejected call leaves state untouched");

    let mut deferred = engine.next_deferred(1).await;
    deferred.remove(0).resolve(FetchResult::with_data(json!({"user": {"id": "u1", "name": "Ada"}})));
    let settled = first.await.expect("first call");
    assert_eq!(settled.data, Some(json!({"user": {"id": "u1", "name": "Ada"}})));
    assert_eq!(lazy.get(), settled);
    assert_eq!(engine.execution_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clear_racing_a_new_call_waits_for_it() {
    let (engine, client) = setup();
    let lazy = client.lazy_query::<Value>(user(), LazyQueryOptions::default()).expect("lazy query");

    for round in 0..20 {
        let clear = {
            let lazy = lazy.clone();
            tokio::spawn(async move { lazy.clear().await })
        };
        let call = lazy.call(LazyQueryOptions::default());
        let mut deferred = engine.next_deferred(1).await;
        assert!(lazy.get().loading, "round {round}: cleared while in flight");
        deferred.remove(0).resolve(FetchResult::with_data(json!({"user": {"id": round}})));

        call.await.expect("call");
        clear.await.expect("join");
        assert!(!lazy.get().loading, "round {round}: stuck loading");
        lazy.clear().await;
    }
}

#[test]
fn calls_outside_a_runtime_are_rejected_without_loading() {
    let (_engine, client) = setup();
    let lazy = client.lazy_query::<Value>(user(), LazyQueryOptions::default()).expect("lazy query");
    let mutation = client.mutation::<Value>(rename(), MutationOptions::default()).expect("mutation");

    let lazy_call = lazy.call(LazyQueryOptions::default());
    let mutation_call = mutation.call(MutationOptions::default());
    assert_eq!(lazy.get(), ResultEnvelope::default());
    assert_eq!(mutation.get(), ResultEnvelope::default());

    let runtime = tokio::runtime::Builder::new_current_thread().build().expect("runtime");
    runtime.block_on(async {
        assert_eq!(lazy_call.await, Err(CallError::NoRuntime));
        assert_eq!(mutation_call.await, Err(CallError::NoRuntime));
    });
}

#[test]
fn containers_recover_once_a_runtime_is_available() {
    let (engine, client) = setup();
    let lazy = client.lazy_query::<Value>(user(), LazyQueryOptions::default()).expect("lazy query");
    let mutation = client.mutation::<Value>(rename(), MutationOptions::default()).expect("mutation");
    drop(lazy.call(LazyQueryOptions::default()));
    drop(mutation.call(MutationOptions::default()));

    let runtime = tokio::runtime::Builder::new_current_thread().build().expect("runtime");
    runtime.block_on(async {
        engine.respond_with(Ok(FetchResult::with_data(json!({"user": {"id": "u1"}}))));
        let settled = lazy.call(LazyQueryOptions::default()).await.expect("lazy call");
        assert_eq!(settled.data, Some(json!({"user": {"id": "u1"}})));

        engine.respond_with(Ok(FetchResult::with_data(json!({"rename": {"label": "done"}}))));
        mutation.call(MutationOptions::default()).await.expect("mutation call");
        assert!(!mutation.get().loading);
    });
}

#[tokio::test]
async fn lazy_query_failures_are_published() {
    let (engine, client) = setup();
    let lazy = client.lazy_query::<Value>(user(), LazyQueryOptions::default()).expect("lazy query");
    engine.respond_with(Err(OperationError::network("offline")));

    let outcome = lazy.call(LazyQueryOptions::default()).await;
    assert_eq!(outcome, Err(CallError::Operation(OperationError::network("offline"))));
    assert_eq!(lazy.get(), ResultEnvelope::failed(OperationError::network("offline")));
}

#[tokio::test]
async fn lazy_query_clears_are_idempotent() {
    let (engine, client) = setup();
    let lazy = client
        .lazy_query::<Value>(user(), LazyQueryOptions::default().with_error_policy(ErrorPolicy::All))
        .expect("lazy query");
    engine.respond_with(Ok(FetchResult::with_errors(
        Some(json!({"user": null})),
        vec![GraphError::new("partial")],
    )));
    lazy.call(LazyQueryOptions::default()).await.expect("call");
    assert!(lazy.get().error.is_some());

    let (notified, _unsubscribe) = counter(&lazy);
    assert_eq!(notified.load(Ordering::SeqCst), 1);

    lazy.clear_error().await;
    lazy.clear_error().await;
    assert_eq!(notified.load(Ordering::SeqCst), 2);
    assert!(!lazy.get().has_error());

    lazy.clear_result().await;
    lazy.clear_result().await;
    assert_eq!(notified.load(Ordering::SeqCst), 3);
    assert_eq!(lazy.get(), ResultEnvelope::default());

    lazy.clear().await;
    assert_eq!(notified.load(Ordering::SeqCst), 3, "already in the default state");

    engine.respond_with(Ok(FetchResult::with_data(json!({"user": {"id": "u1"}}))));
    lazy.call(LazyQueryOptions::default()).await.expect("call");
    assert_eq!(notified.load(Ordering::SeqCst), 5);
    lazy.clear().await;
    lazy.clear().await;
    assert_eq!(notified.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn clears_wait_for_the_outstanding_call() {
    let (engine, client) = setup();
    let lazy = client.lazy_query::<Value>(user(), LazyQueryOptions::default()).expect("lazy query");
    let call = lazy.call(LazyQueryOptions::default());

    let clear = {
        let lazy = lazy.clone();
        tokio::spawn(async move { lazy.clear().await })
    };
    let mut deferred = engine.next_deferred(1).await;
    deferred.remove(0).resolve(FetchResult::with_data(json!({"user": {"id": "u1"}})));

    call.await.expect("call");
    clear.await.expect("join");
    assert_eq!(lazy.get(), ResultEnvelope::default());
}

#[tokio::test]
async fn overlapping_mutations_keep_the_latest_outcome() {
    let (engine, client) = setup();
    let mutation = client
        .mutation::<Value>(rename(), MutationOptions::default().with_allow_overlap(true))
        .expect("mutation");

    let call_a = mutation.call(MutationOptions::default().with_variable("label", "A"));
    let call_b = mutation.call(MutationOptions::default().with_variable("label", "B"));

    let deferred = engine.next_deferred(2).await;
    let (mut for_a, mut for_b) = (None, None);
    for execution in deferred {
        match label_of(&execution).as_deref() {
            Some("A") => for_a = Some(execution),
            Some("B") => for_b = Some(execution),
            other => panic!("unexpected execution {other:?}"),
        }
    }

    for_b.expect("B executed").resolve(FetchResult::with_data(json!({"rename": {"label": "B"}})));
    assert_eq!(call_b.await.expect("B").data, Some(json!({"rename": {"label": "B"}})));

    for_a.expect("A executed").resolve(FetchResult::with_data(json!({"rename": {"label": "A"}})));
    let raw_a = call_a.await.expect("A");
    assert_eq!(raw_a.data, Some(json!({"rename": {"label": "A"}})), "stale calls still return their response");

    let state = mutation.get();
    assert_eq!(state.data, Some(json!({"rename": {"label": "B"}})));
    assert!(!state.loading);
}

#[tokio::test]
async fn stale_mutation_failures_are_discarded() {
    let (engine, client) = setup();
    let mutation = client
        .mutation::<Value>(rename(), MutationOptions::default().with_allow_overlap(true))
        .expect("mutation");

    let call_a = mutation.call(MutationOptions::default().with_variable("label", "A"));
    let call_b = mutation.call(MutationOptions::default().with_variable("label", "B"));

    let deferred = engine.next_deferred(2).await;
    let (mut for_a, mut for_b) = (None, None);
    for execution in deferred {
        match label_of(&execution).as_deref() {
            Some("A") => for_a = Some(execution),
            Some("B") => for_b = Some(execution),
            other => panic!("unexpected execution {other:?}"),
        }
    }

    for_b.expect("B executed").resolve(FetchResult::with_data(json!({"rename": {"label": "B"}})));
    call_b.await.expect("B");

    for_a.expect("A executed").reject(OperationError::network("late"));
    assert_eq!(call_a.await, Err(CallError::Operation(OperationError::network("late"))));

    let state = mutation.get();
    assert_eq!(state.data, Some(json!({"rename": {"label": "B"}})));
    assert_eq!(state.error, None);
    assert!(!state.loading);
}

#[tokio::test]
async fn mutations_reject_overlap_by_default() {
    let (engine, client) = setup();
    let mutation = client.mutation::<Value>(rename(), MutationOptions::default()).expect("mutation");

    let first = mutation.call(MutationOptions::default());
    let second = mutation.call(MutationOptions::default()).await;
    assert!(second.unwrap_err().is_suppressed());

    let overlapping = mutation.call(MutationOptions::default().with_allow_overlap(true));
    let mut deferred = engine.next_deferred(2).await;
    for execution in deferred.drain(..) {
        execution.resolve(FetchResult::with_data(json!({"rename": {"label": "done"}})));
    }
    first.await.expect("first");
    overlapping.await.expect("overlapping");
    assert_eq!(mutation.get().data, Some(json!({"rename": {"label": "done"}})));
}

#[tokio::test]
async fn mutation_graph_errors_are_aggregated_and_cleared() {
    let (engine, client) = setup();
    let mutation = client.mutation::<Value>(rename(), MutationOptions::default()).expect("mutation");
    engine.respond_with(Ok(FetchResult::with_errors(
        Some(Value::Null),
        vec![GraphError::new("taken"), GraphError::new("too long")],
    )));

    let raw = mutation.call(MutationOptions::default()).await.expect("call");
    assert!(raw.data.is_none(), "null data is normalized to absent");
    assert_eq!(raw.graph_errors().len(), 2);

    let state = mutation.get();
    assert_eq!(state.error.as_ref().map(|error| error.message.as_str()), Some("taken\ntoo long"));
    assert!(state.data.is_none());

    let (notified, _unsubscribe) = counter(&mutation);
    mutation.clear_error();
    mutation.clear_error();
    assert_eq!(notified.load(Ordering::SeqCst), 2);
    assert_eq!(mutation.get(), ResultEnvelope::default());
}

#[tokio::test]
async fn combined_operations_execute_once() {
    let (engine, client) = setup();
    let settings = OperationDescriptor::query().select("settings { theme }");
    let lazy = client
        .lazy_query::<Value>(vec![user(), settings], LazyQueryOptions::default().with_operation_name("X"))
        .expect("lazy query");
    engine.respond_with(Ok(FetchResult::with_data(json!({"user": null, "settings": {"theme": "dark"}}))));

    lazy.call(LazyQueryOptions::default().with_variable("id", "u1")).await.expect("call");

    let executions = engine.executions();
    assert_eq!(executions.len(), 1);
    assert_eq!(
        executions[0].operation.to_document(),
        "query X($id: ID!) { user(id: $id) { id name } settings { theme } }"
    );
}

#[tokio::test]
async fn options_layer_config_container_and_call() {
    let engine = Arc::new(MemoryEngine::new());
    let client = Client::with_engine(engine.clone()).with_config(ClientConfig {
        fetch_policy: Some(FetchPolicy::NetworkOnly),
        ..ClientConfig::default()
    });
    let lazy = client
        .lazy_query::<Value>(user(), LazyQueryOptions::default().with_variable("id", "u1"))
        .expect("lazy query");

    engine.respond_with(Ok(FetchResult::default()));
    lazy.call(LazyQueryOptions::default()).await.expect("call");
    engine.respond_with(Ok(FetchResult::default()));
    lazy.call(LazyQueryOptions::default().with_fetch_policy(FetchPolicy::CacheOnly).with_variable("id", "u2"))
        .await
        .expect("call");

    let executions = engine.executions();
    assert_eq!(executions[0].options.fetch_policy, FetchPolicy::NetworkOnly);
    assert_eq!(executions[0].options.variables.get("id"), Some(&json!("u1")));
    assert_eq!(executions[1].options.fetch_policy, FetchPolicy::CacheOnly);
    assert_eq!(executions[1].options.variables.get("id"), Some(&json!("u2")));
}

#[tokio::test]
async fn calls_without_an_engine_are_not_configured() {
    let client = Client::new();
    let lazy = client.lazy_query::<Value>(user(), LazyQueryOptions::default()).expect("lazy query");
    let mutation = client.mutation::<Value>(rename(), MutationOptions::default()).expect("mutation");

    assert_eq!(lazy.call(LazyQueryOptions::default()).await, Err(CallError::NotConfigured));
    assert_eq!(mutation.call(MutationOptions::default()).await, Err(CallError::NotConfigured));
    assert!(!mutation.get().loading);
}
