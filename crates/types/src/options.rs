//! Per-container and per-call options.
//!
//! Options are layered: configuration defaults, then the options a container was
//! created with, then per-call overrides. At each layer a present value replaces the
//! one below it; `variables` and `context` are replaced as a whole, not merged key by
//! key.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

/// Where the executor may read results from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
    #[default]
    CacheFirst,
    CacheAndNetwork,
    NetworkOnly,
    CacheOnly,
    NoCache,
    Standby,
}

/// How graph errors in a response are surfaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// A response with graph errors is a failed call.
    #[default]
    None,
    /// Graph errors are dropped and the data is used as-is.
    Ignore,
    /// Data and graph errors are both kept.
    All,
}

/// Options shared by queries, lazy queries and subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOptions {
    /// Name used when several operations are combined into one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<JsonMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_policy: Option<FetchPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_policy: Option<ErrorPolicy>,
    /// Opaque values handed to the executor with the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<JsonMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

pub type QueryOptions = OperationOptions;
pub type LazyQueryOptions = OperationOptions;
pub type SubscriptionOptions = OperationOptions;

impl OperationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    pub fn with_variables(mut self, variables: JsonMap<String, Value>) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Set a single variable, creating the variable map if needed.
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.get_or_insert_with(JsonMap::new).insert(name.into(), value.into());
        self
    }

    pub fn with_fetch_policy(mut self, fetch_policy: FetchPolicy) -> Self {
        self.fetch_policy = Some(fetch_policy);
        self
    }

    pub fn with_error_policy(mut self, error_policy: ErrorPolicy) -> Self {
        self.error_policy = Some(error_policy);
        self
    }

    pub fn with_poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = Some(interval);
        self
    }

    /// Layer `overrides` on top of these options. Present override values win.
    pub fn merged(&self, overrides: &OperationOptions) -> OperationOptions {
        OperationOptions {
            operation_name: overrides.operation_name.clone().or_else(|| self.operation_name.clone()),
            variables: overrides.variables.clone().or_else(|| self.variables.clone()),
            fetch_policy: overrides.fetch_policy.or(self.fetch_policy),
            error_policy: overrides.error_policy.or(self.error_policy),
            context: overrides.context.clone().or_else(|| self.context.clone()),
            poll_interval_ms: overrides.poll_interval_ms.or(self.poll_interval_ms),
        }
    }

    /// Resolve the options handed to the executor, filling gaps with defaults.
    pub fn to_execute_options(&self) -> ExecuteOptions {
        ExecuteOptions {
            variables: self.variables.clone().unwrap_or_default(),
            fetch_policy: self.fetch_policy.unwrap_or_default(),
            error_policy: self.error_policy.unwrap_or_default(),
            context: self.context.clone().unwrap_or_default(),
            poll_interval_ms: self.poll_interval_ms,
        }
    }
}

/// Options for mutation containers and calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationOptions {
    #[serde(flatten)]
    pub request: OperationOptions,
    /// Whether a call may start while a previous one is still outstanding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_overlap: Option<bool>,
}

impl MutationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.request = self.request.with_variable(name, value);
        self
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.request = self.request.with_operation_name(name);
        self
    }

    pub fn with_allow_overlap(mut self, allow_overlap: bool) -> Self {
        self.allow_overlap = Some(allow_overlap);
        self
    }

    pub fn merged(&self, overrides: &MutationOptions) -> MutationOptions {
        MutationOptions {
            request: self.request.merged(&overrides.request),
            allow_overlap: overrides.allow_overlap.or(self.allow_overlap),
        }
    }
}

impl From<OperationOptions> for MutationOptions {
    fn from(request: OperationOptions) -> Self {
        Self {
            request,
            allow_overlap: None,
        }
    }
}

/// Fully resolved options handed to the executor with one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOptions {
    pub variables: JsonMap<String, Value>,
    pub fetch_policy: FetchPolicy,
    pub error_policy: ErrorPolicy,
    pub context: JsonMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overrides_win_per_key() {
        let base = OperationOptions::new()
            .with_variable("id", "u1")
            .with_fetch_policy(FetchPolicy::NetworkOnly)
            .with_poll_interval_ms(500);
        let overrides = OperationOptions::new().with_variable("id", "u2");

        let merged = base.merged(&overrides);
        assert_eq!(merged.variables.and_then(|vars| vars.get("id").cloned()), Some(json!("u2")));
        assert_eq!(merged.fetch_policy, Some(FetchPolicy::NetworkOnly));
        assert_eq!(merged.poll_interval_ms, Some(500));
    }

    #[test]
    fn variables_are_replaced_as_a_whole() {
        let base = OperationOptions::new().with_variable("id", "u1").with_variable("first", 10);
        let overrides = OperationOptions::new().with_variable("id", "u2");
        let execute = base.merged(&overrides).to_execute_options();
        assert_eq!(execute.variables.len(), 1);
    }

    #[test]
    fn execute_options_fill_defaults() {
        let execute = OperationOptions::new().to_execute_options();
        assert_eq!(execute.fetch_policy, FetchPolicy::CacheFirst);
        assert_eq!(execute.error_policy, ErrorPolicy::None);
        assert!(execute.variables.is_empty());
    }

    #[test]
    fn call_level_allow_overlap_wins() {
        let container = MutationOptions::new().with_allow_overlap(false);
        let call = MutationOptions::new().with_allow_overlap(true);
        assert_eq!(container.merged(&call).allow_overlap, Some(true));
        assert_eq!(container.merged(&MutationOptions::new()).allow_overlap, Some(false));
    }

    #[test]
    fn deserializes_flattened_mutation_options() {
        let raw = r#"
operationName: SaveUser
variables:
  id: u1
errorPolicy: all
allowOverlap: true
"#;
        let options: MutationOptions = serde_yaml::from_str(raw).expect("mutation options");
        assert_eq!(options.request.operation_name.as_deref(), Some("SaveUser"));
        assert_eq!(options.request.error_policy, Some(ErrorPolicy::All));
        assert_eq!(options.allow_overlap, Some(true));
    }
}
