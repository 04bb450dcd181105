//! HTTP client for the attendance service
//!
//! Implements both the per-record sync endpoint and the identity lookup used
//! to restore a session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;

use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use crate::session::identity::{IdentityResolver, IdentityStatus};

use super::record::{id_to_string, parse_push_response, unwrap_rpc, PushStatus, RpcRequest, SyncRecord};
use super::RemoteEndpoint;

/// HTTP client for the attendance service
pub struct HttpRemote {
    http_client: reqwest::Client,
    base_url: String,
    next_id: AtomicU64,
}

impl HttpRemote {
    /// Create a new client from configuration
    ///
    /// Returns an error if the configuration is invalid or missing required fields.
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .server_url
            .clone()
            .ok_or_else(|| Error::Config("remote.server_url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = &config.api_key {
            let auth_value = format!("Bearer {}", api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
            next_id: AtomicU64::new(1),
        })
    }

    /// POST a JSON-RPC call and return the raw response body.
    ///
    /// Network failures, timeouts, 401/403, 5xx and unreadable bodies are
    /// [`Error::SyncTransport`]; any other non-success status is
    /// [`Error::Remote`].
    async fn call<P: Serialize + Sync>(&self, path: &str, params: &P) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let response = self
            .http_client
            .post(&url)
            .json(&RpcRequest::call(params, id))
            .send()
            .await
            .map_err(|e| Error::SyncTransport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::SyncTransport(format!("failed to parse response: {}", e)))
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            let message = format!("API error ({}): {}", status, error_text);
            let unauthorized = status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN;
            if status.is_server_error() || unauthorized {
                Err(Error::SyncTransport(message))
            } else {
                Err(Error::Remote(message))
            }
        }
    }

    /// Send one record.
    ///
    /// A client error other than 401/403 is a refusal of this record;
    /// everything that leaves the record unjudged is an error.
    pub async fn push_record(&self, record: &SyncRecord) -> Result<PushStatus> {
        match self.call("/live/gps/update", record).await {
            Ok(body) => parse_push_response(body),
            Err(Error::Remote(message)) => Ok(PushStatus::Rejected(message)),
            Err(e) => Err(e),
        }
    }

    /// Ask the service who the current user is and whether a work period is open.
    pub async fn fetch_identity(&self) -> IdentityStatus {
        let body = match self
            .call("/live/gps/get_employee_id", &serde_json::json!({}))
            .await
        {
            Ok(body) => body,
            Err(e) => return IdentityStatus::Error(e.to_string()),
        };

        match unwrap_rpc(body) {
            Ok(payload) => parse_identity(&payload),
            Err(message) => IdentityStatus::Error(message),
        }
    }

    /// Check if the service is reachable
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/web/health", self.base_url);

        match self.http_client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl RemoteEndpoint for HttpRemote {
    async fn push(&self, record: &SyncRecord) -> Result<PushStatus> {
        self.push_record(record).await
    }
}

impl IdentityResolver for HttpRemote {
    async fn resolve(&self) -> IdentityStatus {
        self.fetch_identity().await
    }
}

fn parse_identity(payload: &serde_json::Value) -> IdentityStatus {
    let error_message = || {
        payload
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("identity lookup failed")
            .to_string()
    };

    match payload.get("status").and_then(|s| s.as_str()) {
        Some("ok") => match id_to_string(payload.get("employee_id")) {
            Some(agent_id) => IdentityStatus::Ok {
                agent_id,
                attendance_id: id_to_string(payload.get("attendance_id")),
            },
            None => IdentityStatus::Error("response carried no employee_id".to_string()),
        },
        Some("disabled") => IdentityStatus::Disabled,
        _ => IdentityStatus::Error(error_message()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_requires_valid_config() {
        let config = RemoteConfig::default();
        assert!(HttpRemote::new(&config).is_err());
    }

    #[test]
    fn test_client_with_valid_config() {
        let config = RemoteConfig {
            enabled: true,
            server_url: Some("https://erp.example.com/".to_string()),
            api_key: Some("token".to_string()),
            ..Default::default()
        };
        let client = HttpRemote::new(&config).unwrap();
        assert_eq!(client.base_url(), "https://erp.example.com");
    }

    #[test]
    fn test_rejects_unprintable_api_key() {
        let config = RemoteConfig {
            enabled: true,
            server_url: Some("https://erp.example.com".to_string()),
            api_key: Some("bad\nkey".to_string()),
            ..Default::default()
        };
        assert!(matches!(HttpRemote::new(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_identity() {
        assert_eq!(
            parse_identity(&json!({"status": "ok", "employee_id": 7, "attendance_id": 42})),
            IdentityStatus::Ok {
                agent_id: "7".to_string(),
                attendance_id: Some("42".to_string()),
            }
        );
        assert_eq!(
            parse_identity(&json!({"status": "ok", "employee_id": 7, "attendance_id": null})),
            IdentityStatus::Ok {
                agent_id: "7".to_string(),
                attendance_id: None,
            }
        );
        assert_eq!(
            parse_identity(&json!({"status": "disabled", "employee_id": null})),
            IdentityStatus::Disabled
        );
        assert_eq!(
            parse_identity(&json!({"status": "error", "error": "No employee record found"})),
            IdentityStatus::Error("No employee record found".to_string())
        );
        assert!(matches!(
            parse_identity(&json!({"status": "ok"})),
            IdentityStatus::Error(_)
        ));
    }

    fn record() -> SyncRecord {
        serde_json::from_value(json!({
            "timestamp": "2025-03-01T08:00:00Z",
            "latitude": 1.0,
            "longitude": 2.0,
            "employee_id": "7",
            "attendance_id": "42",
            "tracking_type": "route_point",
            "accuracy": 5.0
        }))
        .unwrap()
    }

    /// Serve `status_line` and `body` to every request on a local port.
    async fn stub_server(status_line: &'static str, body: &'static str) -> HttpRemote {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                // Read headers, then as much body as Content-Length announces
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&request);
                    if let Some(end) = text.find("\r\n\r\n") {
                        let length = text[..end]
                            .lines()
                            .find_map(|l| {
                                let (name, value) = l.split_once(':')?;
                                name.eq_ignore_ascii_case("content-length")
                                    .then(|| value.trim().parse::<usize>().ok())?
                            })
                            .unwrap_or(0);
                        if request.len() >= end + 4 + length {
                            break;
                        }
                    }
                }

                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        HttpRemote::new(&RemoteConfig {
            enabled: true,
            server_url: Some(format!("http://{}", addr)),
            timeout_secs: 5,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_push_status_from_service() {
        let client = stub_server("200 OK", r#"{"jsonrpc":"2.0","id":1,"result":{"status":"duplicate"}}"#).await;
        assert_eq!(client.push_record(&record()).await.unwrap(), PushStatus::Duplicate);

        let client = stub_server(
            "200 OK",
            r#"{"jsonrpc":"2.0","id":1,"result":{"status":"error","message":"Invalid latitude"}}"#,
        )
        .await;
        assert_eq!(
            client.push_record(&record()).await.unwrap(),
            PushStatus::Rejected("Invalid latitude".to_string())
        );

        let client = stub_server("400 Bad Request", "missing employee_id").await;
        assert!(matches!(
            client.push_record(&record()).await.unwrap(),
            PushStatus::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn test_expired_session_is_retried_not_rejected() {
        let client = stub_server(
            "200 OK",
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":100,"message":"Odoo Session Expired","data":{"message":"Session expired"}}}"#,
        )
        .await;
        let err = client.push_record(&record()).await.unwrap_err();
        assert!(err.is_transient(), "{err}");

        let client = stub_server("401 Unauthorized", "token expired").await;
        let err = client.push_record(&record()).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[tokio::test]
    async fn test_unreadable_body_is_retried_not_rejected() {
        let client = stub_server("200 OK", "<html>gateway login</html>").await;
        let err = client.push_record(&record()).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        // Port 9 on localhost: connection refused
        let config = RemoteConfig {
            enabled: true,
            server_url: Some("http://127.0.0.1:9".to_string()),
            timeout_secs: 2,
            ..Default::default()
        };
        let client = HttpRemote::new(&config).unwrap();

        let err = client.push_record(&record()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!client.health_check().await.unwrap());
        assert!(matches!(client.fetch_identity().await, IdentityStatus::Error(_)));
    }
}
