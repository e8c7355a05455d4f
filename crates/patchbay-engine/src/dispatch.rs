//! Inbound message pipeline.
//!
//! Every message coming off the transport runs through the same stages:
//! decode, envelope parse, topic match, peer-id filter, subsystem route.
//! Decode and parse failures land on the peer's error channel; everything
//! else that does not concern this peer is dropped quietly.

use crate::peer::PeerInner;
use crate::transport::InboundHandler;
use bytes::Bytes;
use patchbay_proto::{Envelope, Operation};
use std::sync::{Arc, Weak};

impl PeerInner {
    /// Install the inbound handler on the transport.
    ///
    /// The handler holds only a weak reference so a forgotten `destroy`
    /// cannot keep the peer alive through the transport.
    pub(crate) fn attach(self: &Arc<Self>) -> Result<(), crate::OverlayError> {
        let transport = self.transport()?;
        let weak: Weak<PeerInner> = Arc::downgrade(self);
        let handler: InboundHandler = Arc::new(move |topic, payload| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_inbound(topic, payload).await;
                }
            })
        });
        transport.attach(handler)?;
        Ok(())
    }

    pub(crate) async fn handle_inbound(self: Arc<Self>, topic: String, payload: Bytes) {
        let value = match self.codec.decode(&payload) {
            Ok(value) => value,
            Err(error) => {
                self.report(error.into());
                return;
            }
        };
        let envelope = match Envelope::parse(value) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.report(error.into());
                return;
            }
        };
        let Some(address) = self.scheme.matches(&topic) else {
            tracing::trace!(topic, "topic outside the scheme, dropping");
            return;
        };
        // Directed topics for somebody else are not ours to handle.
        if let Some(peer_id) = &address.peer_id {
            if !peer_id.is_empty() && *peer_id != self.peer_id {
                tracing::trace!(topic, addressee = %peer_id, "directed at another peer, dropping");
                return;
            }
        }
        match (envelope, address.operation) {
            (Envelope::Event(event), Operation::EventEmission) => self.on_event(event),
            (Envelope::ServiceRequest(request), Operation::ServiceCallRequest) => {
                self.on_service_request(request);
            }
            (Envelope::ServiceResponse(response), Operation::ServiceCallResponse) => {
                self.on_service_response(response).await;
            }
            (Envelope::ResourceRequest(request), Operation::ResourceTransferRequest) => {
                self.on_resource_request(request);
            }
            (Envelope::ResourceResponse(response), Operation::ResourceTransferResponse) => {
                self.on_resource_response(response).await;
            }
            (envelope, operation) => {
                tracing::trace!(
                    kind = %envelope.operation(),
                    topic_operation = %operation,
                    "envelope kind does not match topic operation, dropping"
                );
            }
        }
    }
}
