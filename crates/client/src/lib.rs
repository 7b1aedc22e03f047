//! Reactive stores over watched queries, lazy queries, mutations and subscriptions.
//!
//! A [`Client`] holds the [`OperationEngine`] that performs requests. Each
//! container it creates exposes a [`Store`] that UI code subscribes to:
//!
//! - [`Client::query`] bridges a watched query into a store that follows its results.
//! - [`Client::lazy_query`] runs a query on demand and rejects overlapping calls.
//! - [`Client::mutation`] runs mutations and only publishes the latest call's outcome.
//! - [`Client::subscribe`] keeps the latest event of a subscription operation.
//!
//! Passing several operations to any of these combines them into one request.

pub mod call;
pub mod client;
pub mod config;
pub mod engine;
pub mod lazy_query;
pub mod mutation;
pub mod query;
pub mod subscription;

pub use call::{CallError, CallToken, PendingCall};
pub use client::{Client, ClientError, FaultHandler, Operations, Payload};
pub use config::{CONFIG_PATH_ENV, ClientConfig, ConfigError, default_config_path, load_config, load_config_from_path, validate_config};
pub use engine::{EventStream, LastResult, MemoryEngine, OperationEngine, QueryObserver, WatchedQuery};
pub use lazy_query::LazyQuery;
pub use mutation::Mutation;
pub use query::{ReadableQuery, readable_from_watched_query};
pub use subscription::{ReadableSubscription, readable_from_event_stream};
pub use watchstore_store::{Readable, Setter, Store, Unsubscribe};
pub use watchstore_types::*;
