//! Transport contract consumed by the engine.
//!
//! The engine never talks to an MQTT client directly; everything goes
//! through this trait so the broker glue stays replaceable (and tests can
//! run against an in-process loopback).

use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Delivery guarantee requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QosLevel {
    /// QoS 0: at most once
    #[default]
    AtMostOnce,
    /// QoS 1: at least once
    AtLeastOnce,
    /// QoS 2: exactly once
    ExactlyOnce,
}

/// Per-publish options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    /// Requested delivery guarantee
    pub qos: QosLevel,
    /// Broker-side retain flag
    pub retain: bool,
}

impl PublishOptions {
    /// Options with the given QoS and no retain.
    #[must_use]
    pub fn qos(qos: QosLevel) -> Self {
        Self { qos, retain: false }
    }
}

/// Topic, payload and options of a publish that was built but not sent.
///
/// Produced by dry-run emission; the MQTT adapter turns it into a broker
/// last-will.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTuple {
    /// Destination topic
    pub topic: String,
    /// Encoded envelope
    pub payload: Vec<u8>,
    /// Publish options
    pub options: PublishOptions,
}

/// Callback the engine installs for inbound messages.
///
/// The transport invokes it sequentially, one message at a time, and
/// awaits each invocation before delivering the next.
pub type InboundHandler = Arc<dyn Fn(String, Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// Broker-facing operations the engine needs.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to a topic, resolving once the broker acknowledges.
    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), TransportError>;

    /// Remove a subscription.
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Publish a payload.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: &PublishOptions,
    ) -> Result<(), TransportError>;

    /// Install the inbound message callback.
    fn attach(&self, handler: InboundHandler) -> Result<(), TransportError>;

    /// Remove the inbound message callback.
    fn detach(&self);
}

/// Failures reported by the transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Subscribe failed
    #[error("subscribe error: {0}")]
    Subscribe(String),
    /// Unsubscribe failed
    #[error("unsubscribe error: {0}")]
    Unsubscribe(String),
    /// Publish failed
    #[error("publish error: {0}")]
    Publish(String),
    /// Connection-level failure
    #[error("connection error: {0}")]
    Connection(String),
    /// A message callback is already installed
    #[error("a message handler is already attached")]
    HandlerAttached,
}
