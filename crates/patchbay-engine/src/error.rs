//! Engine error taxonomy.

use crate::transport::TransportError;
use patchbay_proto::{CodecError, ProtocolError};

/// Surface text of call and fetch timeouts.
pub const TIMEOUT_MESSAGE: &str = "communication timeout";

/// Surface text of push-stream idle timeouts.
pub const PUSH_TIMEOUT_MESSAGE: &str = "push stream timeout";

/// Everything that can go wrong inside the engine.
///
/// Per-call failures come back through the awaited result; failures seen
/// while processing inbound traffic are surfaced on the peer's error
/// channel ([`crate::Peer::errors`]) so the engine never crashes the
/// dispatch loop.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OverlayError {
    /// Payload failed to encode or decode
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Decoded payload is not a well-formed envelope
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Failure propagated from the MQTT client
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A local handler for this event already exists
    #[error("already subscribed to event: {0}")]
    AlreadySubscribed(String),
    /// A local handler for this service already exists
    #[error("already registered service: {0}")]
    AlreadyRegistered(String),
    /// A local handler for this resource already exists
    #[error("already provisioned resource: {0}")]
    AlreadyProvisioned(String),
    /// Teardown called on a stale subscription handle
    #[error("not subscribed")]
    NotSubscribed,
    /// Teardown called on a stale registration handle
    #[error("not registered")]
    NotRegistered,
    /// Teardown called on a stale provision handle
    #[error("not provisioned")]
    NotProvisioned,
    /// Deadline elapsed before a response was seen
    #[error("{0}")]
    Timeout(String),
    /// Remote registrant reported failure
    #[error("{0}")]
    Service(String),
    /// Remote provisioner reported failure
    #[error("{0}")]
    Resource(String),
    /// Provisioner handler settled without supplying a data source
    #[error("handler did not provide data via info.resource/buffer/stream")]
    MissingData,
    /// Inbound request carried no sender id, so no response can be routed
    #[error("invalid request: missing sender")]
    MissingSender,
    /// A local handler failed while processing an inbound message
    #[error("handler error: {0}")]
    Handler(String),
    /// Operation needs a transport but the peer was built without one
    #[error("peer has no transport")]
    NoTransport,
}

impl OverlayError {
    /// The call/fetch timeout error.
    #[must_use]
    pub fn timeout() -> Self {
        OverlayError::Timeout(TIMEOUT_MESSAGE.to_string())
    }

    /// The push-stream idle timeout error.
    #[must_use]
    pub fn push_timeout() -> Self {
        OverlayError::Timeout(PUSH_TIMEOUT_MESSAGE.to_string())
    }
}

/// Derive the wire error string from a failed handler.
///
/// An empty rendering becomes `"undefined error"` so the remote side never
/// sees a blank failure.
pub(crate) fn error_text(error: anyhow::Error) -> String {
    let text = error.to_string();
    if text.is_empty() {
        "undefined error".to_string()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_surface_texts() {
        assert_eq!(OverlayError::timeout().to_string(), "communication timeout");
        assert_eq!(
            OverlayError::push_timeout().to_string(),
            "push stream timeout"
        );
    }

    #[test]
    fn empty_handler_error_becomes_undefined() {
        assert_eq!(error_text(anyhow::anyhow!("")), "undefined error");
        assert_eq!(error_text(anyhow::anyhow!("boom")), "boom");
    }

    #[test]
    fn missing_data_text() {
        assert_eq!(
            OverlayError::MissingData.to_string(),
            "handler did not provide data via info.resource/buffer/stream"
        );
    }
}
