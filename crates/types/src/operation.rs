//! Operation descriptors and the operation combiner.
//!
//! A descriptor is the immutable description of one remote operation: its kind,
//! an optional name, the variables it declares and the top-level selections it
//! requests. Several descriptors of the same kind can be folded into one so they
//! travel to the executor in a single round trip.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static OPERATION_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[_A-Za-z][_0-9A-Za-z]*$").expect("valid operation name pattern"));

static NAME_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Kind of remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn keyword(self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }

    /// Prefix used for generated operation names.
    pub fn name_prefix(self) -> &'static str {
        match self {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
            OperationKind::Subscription => "Subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Immutable description of a remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDescriptor {
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Declared variables keyed by name (without `$`), valued by their type, e.g. `ID!`.
    #[serde(default)]
    pub variable_definitions: IndexMap<String, String>,
    /// Top-level selections, each the source text of one field.
    #[serde(default)]
    pub selections: Vec<String>,
}

impl OperationDescriptor {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            name: None,
            variable_definitions: IndexMap::new(),
            selections: Vec::new(),
        }
    }

    pub fn query() -> Self {
        Self::new(OperationKind::Query)
    }

    pub fn mutation() -> Self {
        Self::new(OperationKind::Mutation)
    }

    pub fn subscription() -> Self {
        Self::new(OperationKind::Subscription)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn variable(mut self, name: impl Into<String>, r#type: impl Into<String>) -> Self {
        self.variable_definitions.insert(name.into(), r#type.into());
        self
    }

    pub fn select(mut self, selection: impl Into<String>) -> Self {
        self.selections.push(selection.into());
        self
    }

    /// Merge `other` into this descriptor under `name`.
    ///
    /// Kinds must agree. Variables declared by both sides must have the same type.
    /// Selections are appended in order, dropping exact duplicates.
    pub fn merge(&self, other: &OperationDescriptor, name: &str) -> Result<OperationDescriptor, CombineError> {
        validate_operation_name(name)?;
        if self.kind != other.kind {
            return Err(CombineError::KindMismatch {
                expected: self.kind,
                found: other.kind,
            });
        }

        let mut variable_definitions = self.variable_definitions.clone();
        for (variable, r#type) in &other.variable_definitions {
            match variable_definitions.get(variable) {
                Some(existing) if existing != r#type => {
                    return Err(CombineError::VariableConflict {
                        variable: variable.clone(),
                        left: existing.clone(),
                        right: r#type.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    variable_definitions.insert(variable.clone(), r#type.clone());
                }
            }
        }

        let mut selections = self.selections.clone();
        for selection in &other.selections {
            if !selections.contains(selection) {
                selections.push(selection.clone());
            }
        }

        Ok(OperationDescriptor {
            kind: self.kind,
            name: Some(name.to_string()),
            variable_definitions,
            selections,
        })
    }

    /// Render the descriptor as operation document text.
    pub fn to_document(&self) -> String {
        let mut document = String::from(self.kind.keyword());
        if let Some(name) = &self.name {
            document.push(' ');
            document.push_str(name);
        }
        if !self.variable_definitions.is_empty() {
            let variables = self
                .variable_definitions
                .iter()
                .map(|(variable, variable_type)| format!("${variable}: {variable_type}"))
                .collect::<Vec<_>>()
                .join(", ");
            document.push_str(&format!("({variables})"));
        }
        document.push_str(" { ");
        document.push_str(&self.selections.join(" "));
        document.push_str(" }");
        document
    }
}

impl fmt::Display for OperationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_document())
    }
}

/// Failures while folding descriptors together.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CombineError {
    #[error("cannot combine an empty list of operations")]
    Empty,
    #[error("cannot combine a {found} operation into a {expected} operation")]
    KindMismatch { expected: OperationKind, found: OperationKind },
    #[error("variable ${variable} is declared as both {left} and {right}")]
    VariableConflict { variable: String, left: String, right: String },
    #[error("invalid operation name '{name}'")]
    InvalidName { name: String },
}

/// Fold `operations` left to right into one descriptor named `name`.
///
/// The list must not be empty. A single operation is returned renamed.
pub fn combine(operations: &[OperationDescriptor], name: &str) -> Result<OperationDescriptor, CombineError> {
    let (first, rest) = operations.split_first().ok_or(CombineError::Empty)?;
    validate_operation_name(name)?;
    let mut combined = first.clone().named(name);
    for operation in rest {
        combined = combined.merge(operation, name)?;
    }
    Ok(combined)
}

/// Whether `name` is usable as an operation name.
pub fn is_valid_operation_name(name: &str) -> bool {
    OPERATION_NAME.is_match(name)
}

fn validate_operation_name(name: &str) -> Result<(), CombineError> {
    if is_valid_operation_name(name) {
        Ok(())
    } else {
        Err(CombineError::InvalidName { name: name.to_string() })
    }
}

/// Short hexadecimal id derived from the clock and a process-wide sequence.
pub fn random_id() -> String {
    let sequence = NAME_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let millis = Utc::now().timestamp_millis().unsigned_abs();
    format!("{:x}{:x}", millis, sequence)
}

/// Generate an operation name such as `Query18c2f0a1b3e0`.
pub fn generated_operation_name(prefix: &str) -> String {
    format!("{prefix}{}", random_id())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_query() -> OperationDescriptor {
        OperationDescriptor::query()
            .named("User")
            .variable("id", "ID!")
            .select("user(id: $id) { id name }")
    }

    fn settings_query() -> OperationDescriptor {
        OperationDescriptor::query().named("Settings").select("settings { theme }")
    }

    #[test]
    fn combines_queries_under_one_name() {
        let combined = combine(&[user_query(), settings_query()], "X").expect("combine");
        assert_eq!(combined.name.as_deref(), Some("X"));
        assert_eq!(combined.selections, vec!["user(id: $id) { id name }", "settings { theme }"]);
        assert_eq!(combined.variable_definitions.get("id").map(String::as_str), Some("ID!"));
        assert_eq!(
            combined.to_document(),
            "query X($id: ID!) { user(id: $id) { id name } settings { theme } }"
        );
    }

    #[test]
    fn single_operation_is_renamed() {
        let combined = combine(&[settings_query()], "Only").expect("combine");
        assert_eq!(combined.name.as_deref(), Some("Only"));
        assert_eq!(combined.selections, settings_query().selections);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert_eq!(combine(&[], "X"), Err(CombineError::Empty));
    }

    #[test]
    fn kinds_must_match() {
        let mutation = OperationDescriptor::mutation().select("logout");
        let error = combine(&[settings_query(), mutation], "X").unwrap_err();
        assert!(matches!(error, CombineError::KindMismatch { .. }));
    }

    #[test]
    fn conflicting_variable_types_are_rejected() {
        let other = OperationDescriptor::query().variable("id", "String").select("node(id: $id) { id }");
        let error = combine(&[user_query(), other], "X").unwrap_err();
        assert_eq!(
            error,
            CombineError::VariableConflict {
                variable: "id".into(),
                left: "ID!".into(),
                right: "String".into(),
            }
        );
    }

    #[test]
    fn shared_variables_and_duplicate_selections_collapse() {
        let combined = combine(&[user_query(), user_query()], "Twice").expect("combine");
        assert_eq!(combined.variable_definitions.len(), 1);
        assert_eq!(combined.selections.len(), 1);
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(matches!(combine(&[settings_query()], "1abc"), Err(CombineError::InvalidName { .. })));
        assert!(is_valid_operation_name("_Private9"));
    }

    #[test]
    fn generated_names_are_distinct_and_valid() {
        let first = generated_operation_name(OperationKind::Query.name_prefix());
        let second = generated_operation_name(OperationKind::Query.name_prefix());
        assert_ne!(first, second);
        assert!(first.starts_with("Query"));
        assert!(is_valid_operation_name(&first));
    }
}
