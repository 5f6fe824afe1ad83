//! HTTP API client with bearer-token injection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devchat_shared::TransportError;
use reqwest::{Client, Method};
use serde_json::Value;

use crate::storage::{read_token, KeyValueStore};

/// Request/response seam the caches depend on.
///
/// Implementations attach credentials and normalize failures into
/// [`TransportError`]; they never touch cache state.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, TransportError>;
}

/// HTTP client for the devchat API.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    credentials: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Create a new API client reading its bearer token from `credentials`
    pub fn new(credentials: Arc<dyn KeyValueStore>) -> Self {
        Self {
            client: Client::new(),
            base_url: String::new(),
            credentials,
        }
    }

    /// Set the base URL for API requests
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Apply a per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        match Client::builder().timeout(timeout).build() {
            Ok(client) => self.client = client,
            Err(e) => tracing::warn!(error = %e, "keeping default HTTP client, timeout not applied"),
        }
        self
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if self.base_url.is_empty() {
            if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            }
        } else {
            let base = self.base_url.trim_end_matches('/');
            let path = path.trim_start_matches('/');
            format!("{base}/{path}")
        }
    }
}

#[async_trait]
impl Transport for ApiClient {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, TransportError> {
        let url = self.url(path);
        let mut rb = self.client.request(method.clone(), &url);

        // The token is read per request so a login/logout is picked up immediately.
        if let Some(token) = read_token(self.credentials.as_ref()) {
            rb = rb.bearer_auth(token);
        }
        if let Some(body) = body {
            rb = rb.json(&body);
        }

        let resp = rb
            .send()
            .await
            .map_err(|e| TransportError::network(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| TransportError::network(format!("failed to read body: {e}")))?;

        if !status.is_success() {
            let err = TransportError::from_response(status.as_u16(), &text);
            tracing::debug!(%method, %url, status = status.as_u16(), message = %err.message, "request failed");
            return Err(err);
        }

        tracing::trace!(%method, %url, status = status.as_u16(), "request ok");
        decode_body(status.as_u16(), &text)
    }
}

fn decode_body(status: u16, text: &str) -> Result<Value, TransportError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text)
        .map_err(|e| TransportError::http(status, format!("invalid response body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn client(base: &str) -> ApiClient {
        ApiClient::new(Arc::new(MemoryStore::new())).with_base_url(base)
    }

    /// Answer a single HTTP request with `status` and `body`; yields the
    /// lowercased request head.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (head_tx, head_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            let _ = head_tx.send(String::from_utf8_lossy(&received).to_lowercase());

            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
        });

        (base, head_rx)
    }

    #[test]
    fn joins_base_and_path() {
        let api = client("http://localhost:5000/api/");
        assert_eq!(
            api.url("/workspace/channels/W1"),
            "http://localhost:5000/api/workspace/channels/W1"
        );
        assert_eq!(api.url("https://other.dev/x"), "https://other.dev/x");
        assert_eq!(client("").url("friends"), "/friends");
    }

    #[test]
    fn empty_success_body_is_null() {
        assert_eq!(decode_body(204, "").unwrap(), Value::Null);
        assert_eq!(decode_body(200, r#"{"success":true}"#).unwrap()["success"], true);
    }

    #[test]
    fn garbage_success_body_is_a_transport_error() {
        let err = decode_body(200, "<html>").unwrap_err();
        assert_eq!(err.status, Some(200));
        assert!(err.message.starts_with("invalid response body"));
    }

    #[tokio::test]
    async fn stored_token_is_sent_as_bearer() {
        let (base, head) = serve_once("200 OK", r#"{"channels":[]}"#).await;
        let api = ApiClient::new(Arc::new(MemoryStore::with_token("secret"))).with_base_url(base);

        let body = api.request(Method::GET, "/workspace/channels/W1", None).await.unwrap();

        assert_eq!(body["channels"], serde_json::json!([]));
        let head = head.await.unwrap();
        assert!(head.starts_with("get /workspace/channels/w1 http/1.1"));
        assert!(head.contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn no_token_means_no_authorization_header() {
        let (base, head) = serve_once("200 OK", "").await;
        let api = client(&base);

        let body = api.request(Method::DELETE, "/friends/u2", None).await.unwrap();

        assert_eq!(body, Value::Null);
        assert!(!head.await.unwrap().contains("authorization:"));
    }

    #[tokio::test]
    async fn error_status_carries_server_message() {
        let (base, _head) = serve_once("403 Forbidden", r#"{"message":"Not an admin"}"#).await;
        let api = client(&base);

        let err = api
            .request(Method::POST, "/workspace/channels", None)
            .await
            .unwrap_err();

        assert_eq!(err, TransportError::http(403, "Not an admin"));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = client(&base).request(Method::GET, "/friends", None).await.unwrap_err();

        assert_eq!(err.status, None);
        assert!(!err.message.is_empty());
    }
}
