//! Shared types for watchstore: operation descriptors, result envelopes, errors and options.

pub mod envelope;
pub mod error;
pub mod operation;
pub mod options;

pub use envelope::{FetchResult, NetworkStatus, ResultEnvelope};
pub use error::{GraphError, OperationError, SourceError, SourceLocation};
pub use operation::{
    CombineError, OperationDescriptor, OperationKind, combine, generated_operation_name, is_valid_operation_name, random_id,
};
pub use options::{
    ErrorPolicy, ExecuteOptions, FetchPolicy, LazyQueryOptions, MutationOptions, OperationOptions, QueryOptions, SubscriptionOptions,
};
