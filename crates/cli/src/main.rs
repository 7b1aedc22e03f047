use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{Level, info, warn};
use watchstore::{
    Client, FetchResult, LazyQueryOptions, MemoryEngine, MutationOptions, OperationDescriptor, OperationError, QueryOptions,
    Readable, ResultEnvelope, SubscriptionOptions, Unsubscribe, load_config, load_config_from_path,
};

/// Drive the watchstore containers against the in-memory engine and print every state change.
#[derive(Parser, Debug)]
#[command(name = "watchstore-demo", version, about)]
struct Args {
    /// Scenario to run
    #[arg(value_enum, default_value_t = Scenario::Query)]
    scenario: Scenario,

    /// Configuration file (JSON or YAML); defaults to the standard location
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Scenario {
    Query,
    Lazy,
    Mutation,
    Subscription,
}

/// One printed state change.
#[derive(Serialize)]
struct StateLine<'a, T> {
    store: &'a str,
    state: &'a T,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let Args { scenario, config } = Args::parse();

    let config = match config {
        Some(path) => load_config_from_path(&path).with_context(|| format!("loading {}", path.display()))?,
        None => load_config()?,
    };
    let engine = Arc::new(MemoryEngine::new());
    let client = Client::with_engine(engine.clone()).with_config(config);
    info!(?scenario, "running scenario");

    match scenario {
        Scenario::Query => run_query(&engine, &client),
        Scenario::Lazy => run_lazy(&engine, &client).await,
        Scenario::Mutation => run_mutation(&engine, &client).await,
        Scenario::Subscription => run_subscription(&engine, &client),
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Print every value `readable` publishes as a JSON line on stdout.
fn print_states<T, R>(store: &'static str, readable: &R) -> Unsubscribe
where
    T: Serialize + 'static,
    R: Readable<T>,
{
    readable.subscribe(move |state: &T| match serde_json::to_string(&StateLine { store, state }) {
        Ok(line) => println!("{line}"),
        Err(error) => warn!(%error, "failed to serialize state"),
    })
}

fn run_query(engine: &MemoryEngine, client: &Client) -> Result<()> {
    let query = client.query::<Value>(
        OperationDescriptor::query().named("Viewer").select("viewer { id login }"),
        QueryOptions::default(),
    )?;
    let unsubscribe = print_states("query", &query);
    let watched = engine
        .watched_queries()
        .into_iter()
        .next()
        .context("engine did not open a watched query")?;

    let viewer = json!({"viewer": {"id": "v1", "login": "ada"}});
    watched.push_result(ResultEnvelope::ready(Some(viewer.clone())));
    // Same data again: suppressed.
    watched.push_result(ResultEnvelope::ready(Some(viewer)));
    watched.push_error(OperationError::network("connection reset"));
    watched.push_result(ResultEnvelope::ready(Some(json!({"viewer": {"id": "v1", "login": "ada.l"}}))));

    unsubscribe();
    Ok(())
}

async fn run_lazy(engine: &MemoryEngine, client: &Client) -> Result<()> {
    let lazy = client.lazy_query::<Value>(
        OperationDescriptor::query().variable("id", "ID!").select("user(id: $id) { id name }"),
        LazyQueryOptions::default(),
    )?;
    let unsubscribe = print_states("lazy", &lazy);

    let call = lazy.call(LazyQueryOptions::default().with_variable("id", "u1"));
    if let Err(error) = lazy.call(LazyQueryOptions::default().with_variable("id", "u2")).await {
        info!(%error, "second call rejected");
    }
    let mut deferred = engine.next_deferred(1).await;
    if let Some(execution) = deferred.pop() {
        execution.resolve(FetchResult::with_data(json!({"user": {"id": "u1", "name": "Ada"}})));
    }
    call.await?;

    lazy.clear().await;
    unsubscribe();
    Ok(())
}

async fn run_mutation(engine: &MemoryEngine, client: &Client) -> Result<()> {
    let mutation = client.mutation::<Value>(
        OperationDescriptor::mutation().named("Rename").select("rename(label: $label) { label }"),
        MutationOptions::default().with_allow_overlap(true),
    )?;
    let unsubscribe = print_states("mutation", &mutation);

    let first = mutation.call(MutationOptions::default().with_variable("label", "first"));
    let second = mutation.call(MutationOptions::default().with_variable("label", "second"));

    // Settle the newer call first. The older call's response is stale and only reaches its caller.
    let mut deferred = engine.next_deferred(2).await;
    deferred.sort_by_key(|execution| execution.record.options.variables.get("label").map(Value::to_string));
    for execution in deferred.into_iter().rev() {
        let label = execution.record.options.variables.get("label").cloned().unwrap_or(Value::Null);
        execution.resolve(FetchResult::with_data(json!({"rename": {"label": label}})));
    }
    let stale = first.await?;
    second.await?;
    info!(response = ?stale.data, "stale call settled");

    unsubscribe();
    Ok(())
}

fn run_subscription(engine: &MemoryEngine, client: &Client) -> Result<()> {
    let subscription = client.subscribe::<Value>(
        OperationDescriptor::subscription().select("ticks { count }"),
        SubscriptionOptions::default(),
    )?;
    let unsubscribe = print_states("subscription", &subscription);
    let stream = engine
        .event_streams()
        .into_iter()
        .next()
        .context("engine did not open an event stream")?;

    for count in [1, 1, 2, 3] {
        stream.push(FetchResult::with_data(json!({"ticks": {"count": count}})));
    }

    unsubscribe();
    Ok(())
}
