//! Result envelopes published by watched queries and call containers.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::{GraphError, OperationError};

/// Progress of the request backing a result.
///
/// The numeric codes follow the executor's wire values; an absent status is the idle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkStatus {
    Loading,
    SetVariables,
    FetchMore,
    Refetch,
    Poll,
    Ready,
    Error,
}

impl NetworkStatus {
    pub fn code(self) -> u8 {
        match self {
            NetworkStatus::Loading => 1,
            NetworkStatus::SetVariables => 2,
            NetworkStatus::FetchMore => 3,
            NetworkStatus::Refetch => 4,
            NetworkStatus::Poll => 6,
            NetworkStatus::Ready => 7,
            NetworkStatus::Error => 8,
        }
    }

    /// Whether a request is outstanding in this status.
    pub fn is_in_flight(self) -> bool {
        self.code() < 7
    }
}

/// Current known state of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope<D = Value> {
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub data: Option<D>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
    #[serde(default)]
    pub loading: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_status: Option<NetworkStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<GraphError>>,
}

impl<D> Default for ResultEnvelope<D> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            loading: false,
            network_status: None,
            errors: None,
        }
    }
}

impl<D> ResultEnvelope<D> {
    /// The state published while a call is outstanding.
    pub fn loading() -> Self {
        Self {
            loading: true,
            network_status: Some(NetworkStatus::Loading),
            ..Self::default()
        }
    }

    /// A settled, successful result.
    pub fn ready(data: Option<D>) -> Self {
        Self {
            data,
            network_status: Some(NetworkStatus::Ready),
            ..Self::default()
        }
    }

    /// A settled failure with no data.
    pub fn failed(error: OperationError) -> Self {
        Self {
            error: Some(error),
            network_status: Some(NetworkStatus::Error),
            ..Self::default()
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some() || self.errors.is_some()
    }
}

impl<D: PartialEq> ResultEnvelope<D> {
    /// Compares the fields a consumer renders from: `loading`, `network_status` and `data`.
    ///
    /// Two envelopes that agree on these are interchangeable for listeners even if
    /// other fields differ.
    pub fn same_observable_state(&self, other: &Self) -> bool {
        self.loading == other.loading && self.network_status == other.network_status && self.data == other.data
    }
}

impl ResultEnvelope<Value> {
    /// Convert the untyped payload into `D`. A JSON `null` payload becomes absent data.
    pub fn decode<D: DeserializeOwned>(self) -> Result<ResultEnvelope<D>, serde_json::Error> {
        Ok(ResultEnvelope {
            data: decode_payload(self.data)?,
            error: self.error,
            loading: self.loading,
            network_status: self.network_status,
            errors: self.errors,
        })
    }
}

/// Raw settled response of one execution or one pushed subscription event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult<D = Value> {
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub data: Option<D>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<GraphError>>,
}

impl<D> Default for FetchResult<D> {
    fn default() -> Self {
        Self { data: None, errors: None }
    }
}

impl<D> FetchResult<D> {
    pub fn with_data(data: D) -> Self {
        Self {
            data: Some(data),
            errors: None,
        }
    }

    pub fn with_errors(data: Option<D>, errors: Vec<GraphError>) -> Self {
        Self {
            data,
            errors: Some(errors),
        }
    }

    /// Graph errors carried by the response; empty when none were reported.
    pub fn graph_errors(&self) -> &[GraphError] {
        self.errors.as_deref().unwrap_or_default()
    }

    pub fn has_graph_errors(&self) -> bool {
        !self.graph_errors().is_empty()
    }
}

impl FetchResult<Value> {
    /// Convert the untyped payload into `D`. A JSON `null` payload becomes absent data.
    pub fn decode<D: DeserializeOwned>(self) -> Result<FetchResult<D>, serde_json::Error> {
        Ok(FetchResult {
            data: decode_payload(self.data)?,
            errors: self.errors,
        })
    }
}

fn decode_payload<D: DeserializeOwned>(data: Option<Value>) -> Result<Option<D>, serde_json::Error> {
    match data {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct User {
        id: String,
    }

    #[test]
    fn loading_and_ready_states() {
        let loading: ResultEnvelope = ResultEnvelope::loading();
        assert!(loading.loading);
        assert_eq!(loading.network_status, Some(NetworkStatus::Loading));
        assert!(loading.data.is_none());

        let ready = ResultEnvelope::ready(Some(json!({"ok": true})));
        assert!(!ready.loading);
        assert_eq!(ready.network_status, Some(NetworkStatus::Ready));
    }

    #[test]
    fn observable_state_ignores_error_fields() {
        let mut left = ResultEnvelope::ready(Some(json!({"n": 1})));
        let right = left.clone();
        left.errors = Some(vec![GraphError::new("ignored by comparison")]);
        assert!(left.same_observable_state(&right));

        let changed = ResultEnvelope::ready(Some(json!({"n": 2})));
        assert!(!left.same_observable_state(&changed));
    }

    #[test]
    fn decodes_typed_payloads() {
        let envelope = ResultEnvelope::ready(Some(json!({"id": "u1"})));
        let typed: ResultEnvelope<User> = envelope.decode().expect("decode");
        assert_eq!(typed.data, Some(User { id: "u1".into() }));

        let null_payload = FetchResult::with_data(Value::Null);
        let typed: FetchResult<User> = null_payload.decode().expect("decode");
        assert!(typed.data.is_none());
    }

    #[test]
    fn decode_failure_is_reported() {
        let envelope = ResultEnvelope::ready(Some(json!({"id": 7})));
        assert!(envelope.decode::<User>().is_err());
    }

    #[test]
    fn network_status_codes() {
        assert_eq!(NetworkStatus::Ready.code(), 7);
        assert!(NetworkStatus::Refetch.is_in_flight());
        assert!(!NetworkStatus::Error.is_in_flight());
    }

    #[test]
    fn serializes_without_absent_fields() {
        let envelope: ResultEnvelope = ResultEnvelope::default();
        assert_eq!(serde_json::to_value(&envelope).expect("serialize"), json!({"loading": false}));
    }
}
