//! In-process loopback transport standing in for an MQTT broker.
//!
//! Exact-match topic routing, per-node subscription sets and a subscribe
//! operation counter so tests can observe refcounting behavior.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use patchbay_engine::{
    InboundHandler, Peer, PeerConfig, PublishOptions, QosLevel, Transport, TransportError,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct NodeSlot {
    topics: HashSet<String>,
    handler: Option<InboundHandler>,
}

#[derive(Default)]
struct BusState {
    nodes: Vec<NodeSlot>,
    subscribe_ops: HashMap<String, usize>,
}

/// A tiny in-memory broker connecting loopback transports.
#[derive(Default)]
pub struct LoopbackBus {
    state: Mutex<BusState>,
}

impl LoopbackBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new node to the bus.
    pub fn transport(self: &Arc<Self>) -> Arc<LoopbackTransport> {
        let mut state = self.state.lock().unwrap();
        state.nodes.push(NodeSlot::default());
        Arc::new(LoopbackTransport {
            bus: Arc::clone(self),
            index: state.nodes.len() - 1,
        })
    }

    /// How many nodes currently hold a subscription on the topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .iter()
            .filter(|node| node.topics.contains(topic))
            .count()
    }

    /// How many subscribe operations the bus has seen for the topic.
    pub fn subscribe_ops(&self, topic: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.subscribe_ops.get(topic).copied().unwrap_or(0)
    }
}

/// One node's handle onto the bus.
pub struct LoopbackTransport {
    bus: Arc<LoopbackBus>,
    index: usize,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn subscribe(&self, topic: &str, _qos: QosLevel) -> Result<(), TransportError> {
        let mut state = self.bus.state.lock().unwrap();
        state.nodes[self.index].topics.insert(topic.to_string());
        *state.subscribe_ops.entry(topic.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.bus.state.lock().unwrap();
        state.nodes[self.index].topics.remove(topic);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        _options: &PublishOptions,
    ) -> Result<(), TransportError> {
        let handlers: Vec<InboundHandler> = {
            let state = self.bus.state.lock().unwrap();
            state
                .nodes
                .iter()
                .filter(|node| node.topics.contains(topic))
                .filter_map(|node| node.handler.clone())
                .collect()
        };
        let payload = Bytes::from(payload);
        // Deliver sequentially, like a broker feeding one client callback.
        for handler in handlers {
            handler(topic.to_string(), payload.clone()).await;
        }
        Ok(())
    }

    fn attach(&self, handler: InboundHandler) -> Result<(), TransportError> {
        let mut state = self.bus.state.lock().unwrap();
        let slot = &mut state.nodes[self.index];
        if slot.handler.is_some() {
            return Err(TransportError::HandlerAttached);
        }
        slot.handler = Some(handler);
        Ok(())
    }

    fn detach(&self) {
        let mut state = self.bus.state.lock().unwrap();
        state.nodes[self.index].handler = None;
    }
}

/// A peer on the bus with default configuration.
pub fn peer(bus: &Arc<LoopbackBus>) -> Peer {
    peer_with(bus, PeerConfig::default())
}

/// A peer on the bus with custom configuration.
pub fn peer_with(bus: &Arc<LoopbackBus>, config: PeerConfig) -> Peer {
    Peer::new(bus.transport(), config).expect("attach loopback transport")
}

/// A raw bus node for hand-crafted traffic, capturing inbound messages.
pub fn raw_node(
    bus: &Arc<LoopbackBus>,
) -> (
    Arc<LoopbackTransport>,
    tokio::sync::mpsc::UnboundedReceiver<(String, Bytes)>,
) {
    let transport = bus.transport();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let handler: InboundHandler = Arc::new(move |topic: String, payload: Bytes| -> BoxFuture<'static, ()> {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send((topic, payload));
        })
    });
    transport.attach(handler).expect("attach raw handler");
    (transport, rx)
}
