//! Event subsystem: subscribe and fire-and-forget emission.

use crate::error::{error_text, OverlayError};
use crate::ids;
use crate::options::{CallInfo, Emission};
use crate::peer::{EventHandler, Peer, PeerInner, Subscription};
use crate::transport::{PublishOptions, PublishTuple, QosLevel};
use futures::FutureExt;
use patchbay_proto::{Envelope, EventEmission, Operation, Value};
use std::future::Future;
use std::sync::Arc;

impl Peer {
    /// Subscribe to an event with the default QoS (0).
    ///
    /// The handler receives the emission's positional parameters followed
    /// by a [`CallInfo`] naming the sender.
    ///
    /// # Errors
    ///
    /// Fails with `AlreadySubscribed` when this peer already handles the
    /// event, or with a transport error when a broker subscribe fails.
    pub async fn subscribe<F, Fut>(
        &self,
        event: &str,
        handler: F,
    ) -> Result<Subscription, OverlayError>
    where
        F: Fn(Vec<Value>, CallInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_with(event, QosLevel::AtMostOnce, handler).await
    }

    /// Subscribe to an event with an explicit QoS.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Peer::subscribe`].
    pub async fn subscribe_with<F, Fut>(
        &self,
        event: &str,
        qos: QosLevel,
        handler: F,
    ) -> Result<Subscription, OverlayError>
    where
        F: Fn(Vec<Value>, CallInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let inner = &self.inner;
        inner.transport()?;

        let boxed: EventHandler = Arc::new(move |params, info| handler(params, info).boxed());
        {
            let mut events = inner.events.lock().unwrap();
            if events.contains_key(event) {
                return Err(OverlayError::AlreadySubscribed(event.to_string()));
            }
            events.insert(event.to_string(), boxed);
        }

        // Broadcast form plus the directed form for this peer.
        let topics = vec![
            inner.topic(event, Operation::EventEmission, None),
            inner.topic(event, Operation::EventEmission, Some(&inner.peer_id)),
        ];
        if let Err(error) = subscribe_all(inner, &topics, qos).await {
            inner.events.lock().unwrap().remove(event);
            return Err(error);
        }

        tracing::debug!(event, peer_id = %inner.peer_id, "event subscribed");
        Ok(Subscription {
            inner: Arc::clone(inner),
            event: event.to_string(),
            topics,
            torn_down: false,
        })
    }

    /// Publish an event emission.
    ///
    /// # Errors
    ///
    /// Returns encode or transport failures; there is no response to wait
    /// for.
    pub async fn emit(&self, emission: Emission) -> Result<(), OverlayError> {
        let transport = self.inner.transport()?;
        let tuple = self.inner.emission_tuple(emission)?;
        tracing::debug!(topic = %tuple.topic, peer_id = %self.inner.peer_id, "emitting event");
        transport
            .publish(&tuple.topic, tuple.payload, &tuple.options)
            .await?;
        Ok(())
    }

    /// Build the publish tuple for an emission without touching the
    /// transport.
    ///
    /// This is the dry-run path used to produce an MQTT last-will payload;
    /// it works on a [`Peer::detached`] peer.
    ///
    /// # Errors
    ///
    /// Returns encode failures.
    pub fn emit_dry(&self, emission: Emission) -> Result<PublishTuple, OverlayError> {
        self.inner.emission_tuple(emission)
    }
}

/// Subscribe every topic, rolling back the ones already added when a
/// later subscribe fails.
pub(crate) async fn subscribe_all(
    inner: &Arc<PeerInner>,
    topics: &[String],
    qos: QosLevel,
) -> Result<(), OverlayError> {
    for (index, topic) in topics.iter().enumerate() {
        if let Err(error) = inner.subscribe_topic(topic, qos).await {
            for added in &topics[..index] {
                if let Err(rollback) = inner.unsubscribe_topic(added).await {
                    inner.report(rollback);
                }
            }
            return Err(error);
        }
    }
    Ok(())
}

impl PeerInner {
    pub(crate) fn emission_tuple(
        &self,
        emission: Emission,
    ) -> Result<PublishTuple, OverlayError> {
        let Emission {
            event,
            params,
            receiver,
            options,
        } = emission;
        let envelope = Envelope::Event(EventEmission {
            id: ids::random_id(),
            sender: Some(self.peer_id.clone()),
            receiver: receiver.clone(),
            event: event.clone(),
            params,
        });
        let payload = self.encode(&envelope)?;
        let topic = self.topic(&event, Operation::EventEmission, receiver.as_deref());
        let options = options.unwrap_or_else(|| PublishOptions::qos(QosLevel::AtMostOnce));
        Ok(PublishTuple {
            topic,
            payload,
            options,
        })
    }

    /// Deliver an inbound emission to the local subscriber, if any.
    pub(crate) fn on_event(self: &Arc<Self>, envelope: EventEmission) {
        let handler = self.events.lock().unwrap().get(&envelope.event).cloned();
        let Some(handler) = handler else {
            tracing::trace!(event = %envelope.event, "no local subscriber, dropping");
            return;
        };
        let info = CallInfo {
            sender: envelope.sender,
            receiver: envelope.receiver,
        };
        let params = envelope.params.unwrap_or_default();
        let inner = Arc::clone(self);
        let event = envelope.event;
        // Handler failures do not tear down the subscription.
        tokio::spawn(async move {
            if let Err(error) = handler(params, info).await {
                tracing::warn!(event = %event, "event handler failed");
                inner.report(OverlayError::Handler(error_text(error)));
            }
        });
    }
}
