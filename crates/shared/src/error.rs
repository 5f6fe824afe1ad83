//! Shared error types for the request/response surface.

use serde::Deserialize;

/// Message used when the server gives no usable `message` field.
pub const FALLBACK_ERROR_MESSAGE: &str = "Request failed";

/// Failure of a request/response call.
///
/// `status` is `None` when no HTTP status applies: the request never got a
/// response, or a 2xx payload could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub status: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// A 2xx response whose payload does not mean what the caller needs.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// Build the error for a non-2xx response from its raw body.
    pub fn from_response(status: u16, body: &str) -> Self {
        let message =
            message_from_body(body).unwrap_or_else(|| FALLBACK_ERROR_MESSAGE.to_string());
        Self::http(status, message)
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {}: {}", status, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for TransportError {}

#[derive(Deserialize)]
struct MessageOnly {
    message: Option<String>,
}

/// Pull the `message` field out of a JSON error payload, if there is a non-blank one.
pub fn message_from_body(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<MessageOnly>(body).ok()?;
    parsed.message.filter(|m| !m.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_server_message_when_present() {
        let err = TransportError::from_response(403, r#"{"success":false,"message":"Not an admin"}"#);
        assert_eq!(err.status, Some(403));
        assert_eq!(err.message, "Not an admin");
        assert_eq!(err.to_string(), "HTTP 403: Not an admin");
    }

    #[test]
    fn falls_back_on_blank_or_non_json_bodies() {
        assert_eq!(
            TransportError::from_response(500, r#"{"message":"  "}"#).message,
            FALLBACK_ERROR_MESSAGE
        );
        assert_eq!(
            TransportError::from_response(502, "<html>bad gateway</html>").message,
            FALLBACK_ERROR_MESSAGE
        );
    }

    #[test]
    fn network_errors_have_no_status() {
        let err = TransportError::network("connection refused");
        assert_eq!(err.status, None);
        assert_eq!(err.to_string(), "connection refused");
    }
}
