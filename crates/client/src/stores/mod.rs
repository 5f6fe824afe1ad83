//! Entity caches for application state.
//!
//! Each store wraps an [`EntityCache`] for one entity family and owns the
//! mutations that change that family on the server. Mutations never patch a
//! cached list: on success they invalidate the owning scope so the next read
//! sees the server-computed result.

pub mod cache;
pub mod channels;
pub mod friends;
pub mod roles;

use devchat_shared::{ApiEnvelope, TransportError};
use reqwest::Method;
use serde_json::Value;

use crate::api_client::Transport;

pub use cache::{CacheEntry, EntityCache, EntryState, Snapshot};
pub use channels::ChannelStore;
pub use friends::FriendStore;
pub use roles::RoleStore;

/// Interpret a 2xx payload as an envelope, rejecting `success: false`.
pub(crate) fn parse_envelope(value: Value, fallback: &str) -> Result<ApiEnvelope, TransportError> {
    let envelope: ApiEnvelope = serde_json::from_value(value)
        .map_err(|e| TransportError::rejected(format!("{fallback}: unexpected response ({e})")))?;

    if !envelope.success {
        let message = envelope
            .message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| fallback.to_string());
        return Err(TransportError::rejected(message));
    }
    Ok(envelope)
}

pub(crate) async fn call(
    transport: &dyn Transport,
    method: Method,
    path: &str,
    body: Option<Value>,
    fallback: &str,
) -> Result<ApiEnvelope, TransportError> {
    let value = transport.request(method, path, body).await?;
    parse_envelope(value, fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unsuccessful_envelope_uses_server_message_or_fallback() {
        let err = parse_envelope(json!({"success": false, "message": "Channel exists"}), "Failed to create channel")
            .unwrap_err();
        assert_eq!(err.message, "Channel exists");

        let err = parse_envelope(json!({"success": false}), "Failed to create channel").unwrap_err();
        assert_eq!(err.message, "Failed to create channel");
        assert_eq!(err.status, None);
    }

    #[test]
    fn null_payload_is_rejected() {
        let err = parse_envelope(Value::Null, "Failed to fetch channels").unwrap_err();
        assert!(err.message.starts_with("Failed to fetch channels: unexpected response"));
    }
}
