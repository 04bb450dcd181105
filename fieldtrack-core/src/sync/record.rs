//! Wire format for the attendance service
//!
//! One [`SyncRecord`] is sent per request. The service answers with a
//! `status` field that may arrive bare or wrapped in a JSON-RPC `result`:
//!
//! ```text
//! {"status": "ok", "record_id": 881}
//! {"jsonrpc": "2.0", "id": 3, "result": {"status": "duplicate", "message": "Entry already exists"}}
//! ```
//!
//! Only a `status` the service chose for this record is a verdict on it. A
//! JSON-RPC `error` member (expired session, server exception) or a body with
//! no status says nothing about the record and is retried like a network
//! failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{LocationSample, SampleKind};

/// One sample as the attendance service expects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Capture time; also the local store key
    #[serde(rename = "timestamp")]
    pub captured_at: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(rename = "employee_id")]
    pub agent_id: String,
    pub attendance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(rename = "tracking_type")]
    pub kind: SampleKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub accuracy: f64,
}

impl SyncRecord {
    pub fn from_sample(sample: &LocationSample) -> Self {
        Self {
            captured_at: sample.captured_at,
            latitude: sample.latitude,
            longitude: sample.longitude,
            agent_id: sample.agent_id.clone(),
            attendance_id: sample.attendance_id.clone(),
            task_id: sample.task_id.clone(),
            kind: sample.kind,
            comment: sample.comment.clone(),
            accuracy: sample.accuracy,
        }
    }
}

/// Outcome of pushing one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushStatus {
    Accepted,
    /// The service already holds this record; treated as success
    Duplicate,
    /// Explicit refusal with the service's message
    Rejected(String),
}

/// JSON-RPC request envelope
#[derive(Debug, Serialize)]
pub struct RpcRequest<'a, P> {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: &'a P,
    pub id: u64,
}

impl<'a, P: Serialize> RpcRequest<'a, P> {
    pub fn call(params: &'a P, id: u64) -> Self {
        Self {
            jsonrpc: "2.0",
            method: "call",
            params,
            id,
        }
    }
}

/// Unwrap a JSON-RPC response down to its payload.
///
/// Bodies without a `result` are returned as-is; a JSON-RPC `error` member
/// becomes `Err` with the most specific message available.
pub fn unwrap_rpc(body: serde_json::Value) -> std::result::Result<serde_json::Value, String> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        let message = error
            .pointer("/data/message")
            .or_else(|| error.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("remote error")
            .to_string();
        return Err(message);
    }

    match body {
        serde_json::Value::Object(mut map) if map.contains_key("result") => {
            Ok(map.remove("result").unwrap_or(serde_json::Value::Null))
        }
        other => Ok(other),
    }
}

/// Interpret a push response body.
///
/// Errors are [`Error::SyncTransport`]: the record was not judged and should
/// be sent again.
pub fn parse_push_response(body: serde_json::Value) -> Result<PushStatus> {
    let payload = unwrap_rpc(body)
        .map_err(|message| Error::SyncTransport(format!("service error: {}", message)))?;

    let status = payload.get("status").and_then(|s| s.as_str());
    let message = payload
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string);

    match status {
        Some("ok") | Some("accepted") => Ok(PushStatus::Accepted),
        Some("duplicate") => Ok(PushStatus::Duplicate),
        Some(other) => Ok(PushStatus::Rejected(
            message.unwrap_or_else(|| other.to_string()),
        )),
        None => Err(Error::SyncTransport(
            "response carried no status".to_string(),
        )),
    }
}

/// Normalize an identifier that may arrive as a JSON number or string.
pub fn id_to_string(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> LocationSample {
        LocationSample {
            captured_at: DateTime::parse_from_rfc3339("2025-03-01T08:00:00.250Z")
                .unwrap()
                .with_timezone(&Utc),
            latitude: 24.7136,
            longitude: 46.6753,
            accuracy: 12.5,
            agent_id: "7".to_string(),
            attendance_id: "42".to_string(),
            session_id: "s-1".to_string(),
            task_id: None,
            kind: SampleKind::CustomerCheckIn,
            comment: Some("loading dock".to_string()),
            cluster_id: None,
            synced: false,
        }
    }

    #[test]
    fn test_record_wire_fields() {
        let record = SyncRecord::from_sample(&sample());
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["timestamp"], "2025-03-01T08:00:00.250Z");
        assert_eq!(value["employee_id"], "7");
        assert_eq!(value["attendance_id"], "42");
        assert_eq!(value["tracking_type"], "customer_check_in");
        assert_eq!(value["comment"], "loading dock");
        assert!(value.get("task_id").is_none());
        // Local-only fields never leave the device
        assert!(value.get("session_id").is_none());
        assert!(value.get("cluster_id").is_none());
    }

    #[test]
    fn test_rpc_envelope() {
        let record = SyncRecord::from_sample(&sample());
        let value = serde_json::to_value(RpcRequest::call(&record, 9)).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "call");
        assert_eq!(value["id"], 9);
        assert_eq!(value["params"]["latitude"], 24.7136);
    }

    #[test]
    fn test_parse_push_response_statuses() {
        assert_eq!(
            parse_push_response(json!({"status": "ok", "record_id": 1})).unwrap(),
            PushStatus::Accepted
        );
        assert_eq!(
            parse_push_response(json!({"status": "accepted"})).unwrap(),
            PushStatus::Accepted
        );
        assert_eq!(
            parse_push_response(json!({"jsonrpc": "2.0", "id": 1, "result": {"status": "duplicate"}}))
                .unwrap(),
            PushStatus::Duplicate
        );
        assert_eq!(
            parse_push_response(json!({"result": {"status": "error", "message": "Invalid latitude"}}))
                .unwrap(),
            PushStatus::Rejected("Invalid latitude".to_string())
        );
    }

    #[test]
    fn test_missing_status_is_retried() {
        let err = parse_push_response(json!({"result": null})).unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[test]
    fn test_rpc_error_member_is_retried() {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": 100, "message": "Odoo Session Expired", "data": {"message": "Session expired"}}
        });
        let err = parse_push_response(body).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "sync transport error: service error: Session expired");
    }

    #[test]
    fn test_id_normalization() {
        assert_eq!(id_to_string(Some(&json!(17))), Some("17".to_string()));
        assert_eq!(id_to_string(Some(&json!(" 17 "))), Some("17".to_string()));
        assert_eq!(id_to_string(Some(&json!(null))), None);
        assert_eq!(id_to_string(Some(&json!(false))), None);
        assert_eq!(id_to_string(None), None);
    }
}
