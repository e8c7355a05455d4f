//! The peer: composition root owning the dispatch tables and the
//! transport handle.

use crate::error::OverlayError;
use crate::ids;
use crate::options::CallInfo;
use crate::resources::ResourceContext;
use crate::stream::StreamWriter;
use crate::transport::{PublishOptions, QosLevel, Transport};
use futures::future::BoxFuture;
use patchbay_proto::{Codec, Envelope, MetaMap, Operation, SlashScheme, TopicScheme, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Peer construction options.
#[derive(Clone)]
pub struct PeerConfig {
    /// This peer's id segment in directed topics; random when unset
    pub id: Option<String>,
    /// Wire format
    pub codec: Codec,
    /// Deadline for calls, fetches and push-stream idleness
    pub timeout: Duration,
    /// Maximum payload bytes per chunk envelope
    pub chunk_size: usize,
    /// Topic naming scheme
    pub scheme: Arc<dyn TopicScheme>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            id: None,
            codec: Codec::Cbor,
            timeout: Duration::from_millis(10_000),
            chunk_size: 16 * 1024,
            scheme: Arc::new(SlashScheme),
        }
    }
}

impl fmt::Debug for PeerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConfig")
            .field("id", &self.id)
            .field("codec", &self.codec)
            .field("timeout", &self.timeout)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

pub(crate) type EventHandler =
    Arc<dyn Fn(Vec<Value>, CallInfo) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub(crate) type ServiceHandler =
    Arc<dyn Fn(Vec<Value>, CallInfo) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
pub(crate) type ResourceHandler = Arc<
    dyn Fn(Vec<Value>, Arc<ResourceContext>) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// A call waiting for its response envelope.
pub(crate) struct PendingCall {
    pub(crate) service: String,
    pub(crate) response_topic: String,
    pub(crate) tx: oneshot::Sender<Result<Value, OverlayError>>,
}

/// An outstanding fetch and its chunk sink.
pub(crate) struct FetchEntry {
    pub(crate) resource: String,
    pub(crate) response_topic: String,
    pub(crate) chunks: StreamWriter,
    pub(crate) meta: Option<oneshot::Sender<Option<MetaMap>>>,
    pub(crate) timer: JoinHandle<()>,
}

/// An inbound push stream being assembled on the provisioner side.
pub(crate) struct PushEntry {
    pub(crate) chunks: StreamWriter,
    pub(crate) timer: JoinHandle<()>,
}

pub(crate) struct PeerInner {
    pub(crate) peer_id: String,
    pub(crate) codec: Codec,
    pub(crate) scheme: Arc<dyn TopicScheme>,
    pub(crate) timeout: Duration,
    pub(crate) chunk_size: usize,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) events: Mutex<HashMap<String, EventHandler>>,
    pub(crate) services: Mutex<HashMap<String, ServiceHandler>>,
    pub(crate) resources: Mutex<HashMap<String, ResourceHandler>>,
    pub(crate) pending_calls: Mutex<HashMap<String, PendingCall>>,
    pub(crate) fetches: Mutex<HashMap<String, FetchEntry>>,
    pub(crate) pushes: Mutex<HashMap<String, PushEntry>>,
    response_refs: Mutex<HashMap<String, usize>>,
    error_tx: mpsc::UnboundedSender<OverlayError>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<OverlayError>>>,
}

impl PeerInner {
    /// The transport, or `NoTransport` on a dry-run peer.
    pub(crate) fn transport(&self) -> Result<&Arc<dyn Transport>, OverlayError> {
        self.transport.as_ref().ok_or(OverlayError::NoTransport)
    }

    /// Surface a dispatch-side failure on the error channel.
    pub(crate) fn report(&self, error: OverlayError) {
        tracing::warn!(error = %error, peer_id = %self.peer_id, "engine error");
        let _ = self.error_tx.send(error);
    }

    pub(crate) fn topic(
        &self,
        name: &str,
        operation: Operation,
        peer_id: Option<&str>,
    ) -> String {
        self.scheme.make(name, operation, peer_id)
    }

    pub(crate) async fn subscribe_topic(
        &self,
        topic: &str,
        qos: QosLevel,
    ) -> Result<(), OverlayError> {
        tracing::debug!(topic, ?qos, peer_id = %self.peer_id, "subscribing");
        self.transport()?.subscribe(topic, qos).await?;
        Ok(())
    }

    pub(crate) async fn unsubscribe_topic(&self, topic: &str) -> Result<(), OverlayError> {
        tracing::debug!(topic, peer_id = %self.peer_id, "unsubscribing");
        self.transport()?.unsubscribe(topic).await?;
        Ok(())
    }

    /// Refcounted subscribe: only the first holder touches the broker.
    pub(crate) async fn retain_response_topic(
        &self,
        topic: &str,
        qos: QosLevel,
    ) -> Result<(), OverlayError> {
        let first = {
            let mut refs = self.response_refs.lock().unwrap();
            let count = refs.entry(topic.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            if let Err(error) = self.subscribe_topic(topic, qos).await {
                let mut refs = self.response_refs.lock().unwrap();
                if let Some(count) = refs.get_mut(topic) {
                    *count -= 1;
                    if *count == 0 {
                        refs.remove(topic);
                    }
                }
                return Err(error);
            }
        }
        Ok(())
    }

    /// Refcounted unsubscribe: the broker subscription goes away with the
    /// last holder.
    pub(crate) async fn release_response_topic(
        &self,
        topic: &str,
    ) -> Result<(), OverlayError> {
        let last = {
            let mut refs = self.response_refs.lock().unwrap();
            match refs.get_mut(topic) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        refs.remove(topic);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if last {
            self.unsubscribe_topic(topic).await?;
        }
        Ok(())
    }

    pub(crate) fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, OverlayError> {
        Ok(self.codec.encode(&envelope.to_value())?)
    }

    pub(crate) async fn publish_envelope(
        &self,
        topic: &str,
        envelope: &Envelope,
        options: &PublishOptions,
    ) -> Result<(), OverlayError> {
        let payload = self.encode(envelope)?;
        tracing::trace!(
            topic,
            kind = %envelope.operation(),
            rid = %envelope.id(),
            payload_len = payload.len(),
            "publishing envelope"
        );
        self.transport()?.publish(topic, payload, options).await?;
        Ok(())
    }
}

/// One process-side instance of the engine, bound to one transport.
///
/// All four pattern subsystems hang off this type; see the crate docs for
/// the overall picture. Dropping the peer does not touch the broker; call
/// [`Peer::destroy`] to detach the inbound handler.
pub struct Peer {
    pub(crate) inner: Arc<PeerInner>,
}

impl Peer {
    /// Create a peer bound to a transport and install its inbound handler.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport already has a handler attached.
    pub fn new(transport: Arc<dyn Transport>, config: PeerConfig) -> Result<Self, OverlayError> {
        let peer = Self::build(Some(transport), config);
        peer.inner.attach()?;
        tracing::info!(peer_id = %peer.inner.peer_id, "peer created");
        Ok(peer)
    }

    /// Create a transport-less peer usable only for dry-run emission.
    ///
    /// Such a peer produces publish tuples (for broker last-will wiring)
    /// and must never be handed real traffic.
    #[must_use]
    pub fn detached(config: PeerConfig) -> Self {
        Self::build(None, config)
    }

    fn build(transport: Option<Arc<dyn Transport>>, config: PeerConfig) -> Self {
        let (error_tx, errors_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PeerInner {
            peer_id: config.id.unwrap_or_else(ids::random_id),
            codec: config.codec,
            scheme: config.scheme,
            timeout: config.timeout,
            chunk_size: config.chunk_size,
            transport,
            events: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            resources: Mutex::new(HashMap::new()),
            pending_calls: Mutex::new(HashMap::new()),
            fetches: Mutex::new(HashMap::new()),
            pushes: Mutex::new(HashMap::new()),
            response_refs: Mutex::new(HashMap::new()),
            error_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
        });
        Self { inner }
    }

    /// This peer's id segment in directed topics.
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// Take the error channel receiver.
    ///
    /// Dispatch-side failures (decode, parse, handler errors, response
    /// publishing) arrive here instead of crashing the engine. Returns
    /// `None` after the first take.
    pub fn errors(&self) -> Option<mpsc::UnboundedReceiver<OverlayError>> {
        self.inner.errors_rx.lock().unwrap().take()
    }

    /// Detach the inbound handler from the transport.
    ///
    /// In-flight requests are not failed retroactively; they run into
    /// their timeouts.
    pub fn destroy(&self) {
        if let Some(transport) = &self.inner.transport {
            transport.detach();
        }
        tracing::info!(peer_id = %self.inner.peer_id, "peer destroyed");
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("peer_id", &self.inner.peer_id)
            .field("codec", &self.inner.codec)
            .finish_non_exhaustive()
    }
}

/// Handle for an event subscription; tear down with
/// [`Subscription::unsubscribe`].
pub struct Subscription {
    pub(crate) inner: Arc<PeerInner>,
    pub(crate) event: String,
    pub(crate) topics: Vec<String>,
    pub(crate) torn_down: bool,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("topics", &self.topics)
            .field("torn_down", &self.torn_down)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Remove the local handler and both broker subscriptions.
    ///
    /// # Errors
    ///
    /// Fails with `NotSubscribed` on a second teardown. A broker failure
    /// is returned to the caller, but the local handler entry is removed
    /// regardless.
    pub async fn unsubscribe(&mut self) -> Result<(), OverlayError> {
        if self.torn_down {
            return Err(OverlayError::NotSubscribed);
        }
        self.torn_down = true;
        self.inner.events.lock().unwrap().remove(&self.event);
        remove_topics(&self.inner, &self.topics).await
    }
}

/// Handle for a service registration; tear down with
/// [`Registration::unregister`].
pub struct Registration {
    pub(crate) inner: Arc<PeerInner>,
    pub(crate) service: String,
    pub(crate) topics: Vec<String>,
    pub(crate) torn_down: bool,
}

impl Registration {
    /// Remove the local handler and both broker subscriptions.
    ///
    /// # Errors
    ///
    /// Fails with `NotRegistered` on a second teardown. A broker failure
    /// is returned to the caller, but the local handler entry is removed
    /// regardless.
    pub async fn unregister(&mut self) -> Result<(), OverlayError> {
        if self.torn_down {
            return Err(OverlayError::NotRegistered);
        }
        self.torn_down = true;
        self.inner.services.lock().unwrap().remove(&self.service);
        remove_topics(&self.inner, &self.topics).await
    }
}

/// Handle for a resource provisioning; tear down with
/// [`Provision::unprovision`].
pub struct Provision {
    pub(crate) inner: Arc<PeerInner>,
    pub(crate) resource: String,
    pub(crate) topics: Vec<String>,
    /// The directed response topic is shared with in-flight fetches, so it
    /// is held through the refcount table rather than subscribed twice.
    pub(crate) refcounted_topic: String,
    pub(crate) torn_down: bool,
}

impl Provision {
    /// Remove the local handler and all four broker subscriptions.
    ///
    /// # Errors
    ///
    /// Fails with `NotProvisioned` on a second teardown. A broker failure
    /// is returned to the caller, but the local handler entry is removed
    /// regardless.
    pub async fn unprovision(&mut self) -> Result<(), OverlayError> {
        if self.torn_down {
            return Err(OverlayError::NotProvisioned);
        }
        self.torn_down = true;
        self.inner.resources.lock().unwrap().remove(&self.resource);
        let mut failure = remove_topics(&self.inner, &self.topics).await.err();
        if let Err(error) = self
            .inner
            .release_response_topic(&self.refcounted_topic)
            .await
        {
            failure.get_or_insert(error);
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Unsubscribe every topic, keeping the first failure.
async fn remove_topics(inner: &PeerInner, topics: &[String]) -> Result<(), OverlayError> {
    let mut failure = None;
    for topic in topics {
        if let Err(error) = inner.unsubscribe_topic(topic).await {
            failure.get_or_insert(error);
        }
    }
    match failure {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
