//! Topic scheme: mapping named endpoints to MQTT topics and back.
//!
//! Default structure: `{name}/{operation}/{peer-id}` where the last segment
//! is a concrete peer id for directed delivery or `"any"` for broadcast.
//! Endpoint names may themselves contain `/`, so matching works from the
//! right-hand end of the topic.

use std::fmt;

/// Final topic segment marking a broadcast topic.
pub const BROADCAST_SEGMENT: &str = "any";

/// The protocol operation encoded in a topic's second-to-last segment.
///
/// The labels double as the envelope `type` tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Fire-and-forget event
    EventEmission,
    /// Service request
    ServiceCallRequest,
    /// Service response
    ServiceCallResponse,
    /// Resource fetch request
    ResourceTransferRequest,
    /// Resource chunk (fetch response or push)
    ResourceTransferResponse,
}

impl Operation {
    /// All five operations.
    pub const ALL: [Operation; 5] = [
        Operation::EventEmission,
        Operation::ServiceCallRequest,
        Operation::ServiceCallResponse,
        Operation::ResourceTransferRequest,
        Operation::ResourceTransferResponse,
    ];

    /// The wire label for this operation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::EventEmission => "event-emission",
            Operation::ServiceCallRequest => "service-call-request",
            Operation::ServiceCallResponse => "service-call-response",
            Operation::ResourceTransferRequest => "resource-transfer-request",
            Operation::ResourceTransferResponse => "resource-transfer-response",
        }
    }

    /// Parse a wire label.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        Operation::ALL.into_iter().find(|op| op.as_str() == label)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parsed components of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicAddress {
    /// Endpoint name (may contain `/`)
    pub name: String,
    /// Protocol operation
    pub operation: Operation,
    /// Target peer id; `None` for broadcast topics
    pub peer_id: Option<String>,
}

/// A replaceable mapping between endpoints and topic strings.
///
/// The engine never parses topic strings itself; everything goes through
/// the peer's scheme, so callers can substitute their own layout.
pub trait TopicScheme: Send + Sync {
    /// Build the topic for an endpoint, operation and optional target peer.
    fn make(&self, name: &str, operation: Operation, peer_id: Option<&str>) -> String;

    /// Parse a topic back into its components, or `None` when the topic
    /// does not belong to this scheme.
    fn matches(&self, topic: &str) -> Option<TopicAddress>;
}

/// The default slash-separated scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlashScheme;

impl TopicScheme for SlashScheme {
    fn make(&self, name: &str, operation: Operation, peer_id: Option<&str>) -> String {
        format!(
            "{name}/{operation}/{}",
            peer_id.unwrap_or(BROADCAST_SEGMENT)
        )
    }

    fn matches(&self, topic: &str) -> Option<TopicAddress> {
        // Split from the right so the name keeps its own slashes.
        let mut segments = topic.rsplitn(3, '/');
        let peer = segments.next()?;
        let label = segments.next()?;
        let name = segments.next()?;
        if name.is_empty() || peer.is_empty() {
            return None;
        }
        let operation = Operation::parse(label)?;
        let peer_id = (peer != BROADCAST_SEGMENT).then(|| peer.to_string());
        Some(TopicAddress {
            name: name.to_string(),
            operation,
            peer_id,
        })
    }
}
