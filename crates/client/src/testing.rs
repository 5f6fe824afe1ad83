//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use devchat_shared::TransportError;
use reqwest::Method;
use serde_json::Value;

use crate::api_client::Transport;

/// Scripted transport: answers by `(method, path)` and records every call.
#[derive(Default)]
pub(crate) struct MockTransport {
    calls: Mutex<Vec<(Method, String, Option<Value>)>>,
    routes: Mutex<HashMap<(Method, String), Result<Value, TransportError>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, method: Method, path: &str, response: Result<Value, TransportError>) {
        self.routes
            .lock()
            .unwrap()
            .insert((method, path.to_string()), response);
    }

    pub fn calls_to(&self, method: &Method, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, p, _)| m == method && p == path)
            .count()
    }

    pub fn last_body(&self) -> Option<Value> {
        self.calls.lock().unwrap().last().and_then(|(_, _, body)| body.clone())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.clone(), path.to_string(), body));
        // Suspend like a real network call would.
        tokio::task::yield_now().await;
        self.routes
            .lock()
            .unwrap()
            .get(&(method, path.to_string()))
            .cloned()
            .unwrap_or_else(|| Err(TransportError::http(404, "no route")))
    }
}
