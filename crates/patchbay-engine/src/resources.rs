//! Resource subsystem: provision, fetch (pull) and push of chunked byte
//! streams.
//!
//! One provisioning serves both directions. Fetch responses and push
//! traffic share the `resource-transfer-response` envelope kind; an
//! envelope whose correlation id matches an outstanding fetch belongs to
//! that fetch, otherwise a present `resource` field marks it as push
//! traffic for the local provisioner.

use crate::error::{error_text, OverlayError};
use crate::events::subscribe_all;
use crate::ids;
use crate::options::{Fetch, Push};
use crate::peer::{FetchEntry, Peer, PeerInner, Provision, PushEntry, ResourceHandler};
use crate::stream::{chunk_spans, split_chunk, ByteSource, ByteStream};
use crate::transport::{PublishOptions, QosLevel};
use bytes::Bytes;
use futures::FutureExt;
use patchbay_proto::{Envelope, MetaMap, Operation, ResourceRequest, ResourceResponse, Value};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// The reply data source a provisioner handler may set for fetch traffic.
enum ReplySource {
    Unset,
    Buffer(Vec<u8>),
    Stream(ByteStream),
    Deferred(oneshot::Receiver<anyhow::Result<Vec<u8>>>),
}

/// Per-invocation context handed to a provisioner handler.
///
/// For fetch traffic the handler supplies the payload through one of the
/// `reply_*` slots before settling. For push traffic the inbound chunk
/// stream is available via [`ResourceContext::take_stream`] or aggregated
/// with [`ResourceContext::collect`].
pub struct ResourceContext {
    /// Peer id of the requester or pusher
    pub sender: Option<String>,
    /// Directed-delivery target carried by the envelope
    pub receiver: Option<String>,
    /// First-chunk metadata of a push; `None` for fetch traffic
    pub meta: Option<MetaMap>,
    inbound: Mutex<Option<ByteStream>>,
    reply: Mutex<ReplySource>,
    reply_meta: Mutex<Option<MetaMap>>,
}

impl ResourceContext {
    fn for_fetch(sender: String, receiver: Option<String>) -> Self {
        Self {
            sender: Some(sender),
            receiver,
            meta: None,
            inbound: Mutex::new(None),
            reply: Mutex::new(ReplySource::Unset),
            reply_meta: Mutex::new(None),
        }
    }

    fn for_push(
        sender: Option<String>,
        receiver: Option<String>,
        meta: Option<MetaMap>,
        stream: ByteStream,
    ) -> Self {
        Self {
            sender,
            receiver,
            meta,
            inbound: Mutex::new(Some(stream)),
            reply: Mutex::new(ReplySource::Unset),
            reply_meta: Mutex::new(None),
        }
    }

    /// Take the inbound push stream. `None` for fetch traffic or after the
    /// stream has already been taken.
    pub fn take_stream(&self) -> Option<ByteStream> {
        self.inbound.lock().unwrap().take()
    }

    /// Aggregate the whole inbound push stream into one buffer.
    ///
    /// `None` when there is no inbound stream to aggregate.
    pub async fn collect(&self) -> Option<Result<Vec<u8>, OverlayError>> {
        let stream = self.take_stream()?;
        Some(stream.collect().await)
    }

    /// Reply to a fetch with a ready-made buffer.
    pub fn reply_buffer(&self, data: impl Into<Vec<u8>>) {
        *self.reply.lock().unwrap() = ReplySource::Buffer(data.into());
    }

    /// Reply to a fetch with a lazy chunk stream.
    pub fn reply_stream(&self, stream: ByteStream) {
        *self.reply.lock().unwrap() = ReplySource::Stream(stream);
    }

    /// Reply to a fetch with a buffer produced after the handler settles.
    ///
    /// The transfer starts once the returned handle is fulfilled (or
    /// failed) from wherever the data eventually materialises.
    pub fn reply_later(&self) -> DeferredReply {
        let (tx, rx) = oneshot::channel();
        *self.reply.lock().unwrap() = ReplySource::Deferred(rx);
        DeferredReply(tx)
    }

    /// Attach metadata to the reply, carried on its first chunk.
    pub fn reply_meta(&self, meta: crate::Meta) {
        *self.reply_meta.lock().unwrap() = Some(meta.into_map());
    }

    fn take_reply(&self) -> ReplySource {
        std::mem::replace(&mut *self.reply.lock().unwrap(), ReplySource::Unset)
    }

    fn take_reply_meta(&self) -> Option<MetaMap> {
        self.reply_meta.lock().unwrap().take()
    }
}

impl std::fmt::Debug for ResourceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceContext")
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .finish_non_exhaustive()
    }
}

/// Fulfilment handle of a deferred fetch reply.
pub struct DeferredReply(oneshot::Sender<anyhow::Result<Vec<u8>>>);

impl DeferredReply {
    /// Deliver the payload.
    pub fn fulfill(self, data: impl Into<Vec<u8>>) {
        let _ = self.0.send(Ok(data.into()));
    }

    /// Fail the transfer; the fetcher sees the error text.
    pub fn fail(self, error: anyhow::Error) {
        let _ = self.0.send(Err(error));
    }
}

/// The result of a [`Peer::fetch`].
pub struct Fetched {
    /// Lazy in-order chunk stream
    pub stream: ByteStream,
    meta: Option<oneshot::Receiver<Option<MetaMap>>>,
}

impl Fetched {
    /// Metadata from the first response chunk; `None` when the provisioner
    /// attached none (or the transfer failed before the first chunk).
    ///
    /// Resolves once; later invocations return `None` immediately.
    pub async fn meta(&mut self) -> Option<MetaMap> {
        match self.meta.take() {
            Some(rx) => rx.await.unwrap_or(None),
            None => None,
        }
    }

    /// Aggregate the full content, consuming the stream.
    ///
    /// # Errors
    ///
    /// Returns the transfer's terminating error (`Resource` or `Timeout`).
    pub async fn buffer(self) -> Result<Vec<u8>, OverlayError> {
        self.stream.collect().await
    }
}

/// Routing fields shared by all chunks of one transfer.
struct TransferHeader {
    rid: String,
    resource: Option<String>,
    params: Option<Vec<Value>>,
}

impl Peer {
    /// Provision a resource handler, serving both fetch and push traffic,
    /// with the default QoS (2).
    ///
    /// # Errors
    ///
    /// Fails with `AlreadyProvisioned` when this peer already serves the
    /// resource, or with a transport error when a broker subscribe fails.
    pub async fn provision<F, Fut>(
        &self,
        resource: &str,
        handler: F,
    ) -> Result<Provision, OverlayError>
    where
        F: Fn(Vec<Value>, Arc<ResourceContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.provision_with(resource, QosLevel::ExactlyOnce, handler)
            .await
    }

    /// Provision a resource handler with an explicit QoS.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Peer::provision`].
    pub async fn provision_with<F, Fut>(
        &self,
        resource: &str,
        qos: QosLevel,
        handler: F,
    ) -> Result<Provision, OverlayError>
    where
        F: Fn(Vec<Value>, Arc<ResourceContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let inner = &self.inner;
        inner.transport()?;

        let boxed: ResourceHandler =
            Arc::new(move |params, context| handler(params, context).boxed());
        {
            let mut resources = inner.resources.lock().unwrap();
            if resources.contains_key(resource) {
                return Err(OverlayError::AlreadyProvisioned(resource.to_string()));
            }
            resources.insert(resource.to_string(), boxed);
        }

        // Request and response topics, broadcast and directed. The
        // directed response topic is shared with this peer's own fetches,
        // so it goes through the refcount table.
        let topics = vec![
            inner.topic(resource, Operation::ResourceTransferRequest, None),
            inner.topic(resource, Operation::ResourceTransferRequest, Some(&inner.peer_id)),
            inner.topic(resource, Operation::ResourceTransferResponse, None),
        ];
        let refcounted_topic = inner.topic(
            resource,
            Operation::ResourceTransferResponse,
            Some(&inner.peer_id),
        );
        if let Err(error) = subscribe_all(inner, &topics, qos).await {
            inner.resources.lock().unwrap().remove(resource);
            return Err(error);
        }
        if let Err(error) = inner.retain_response_topic(&refcounted_topic, qos).await {
            inner.resources.lock().unwrap().remove(resource);
            for topic in &topics {
                if let Err(rollback) = inner.unsubscribe_topic(topic).await {
                    inner.report(rollback);
                }
            }
            return Err(error);
        }

        tracing::debug!(resource, peer_id = %inner.peer_id, "resource provisioned");
        Ok(Provision {
            inner: Arc::clone(inner),
            resource: resource.to_string(),
            topics,
            refcounted_topic,
            torn_down: false,
        })
    }

    /// Fetch a resource as a chunked byte stream.
    ///
    /// Returns immediately after the request publish; chunks, metadata and
    /// errors arrive through the returned [`Fetched`].
    ///
    /// # Errors
    ///
    /// Returns subscribe, encode or publish failures; transfer failures
    /// and the timeout surface on the stream.
    pub async fn fetch(&self, fetch: Fetch) -> Result<Fetched, OverlayError> {
        self.inner.fetch(fetch).await
    }

    /// Push a chunked byte stream to a resource's provisioners.
    ///
    /// Suspends until the whole source has been published; the final chunk
    /// has been handed to the broker when this resolves.
    ///
    /// # Errors
    ///
    /// Returns encode/publish failures, or the source stream's own error
    /// after the terminating error chunk has been published.
    pub async fn push(&self, push: Push) -> Result<(), OverlayError> {
        self.inner.push(push).await
    }
}

impl PeerInner {
    pub(crate) async fn fetch(self: &Arc<Self>, fetch: Fetch) -> Result<Fetched, OverlayError> {
        let Fetch {
            resource,
            params,
            receiver,
            options,
        } = fetch;
        self.transport()?;

        let rid = ids::random_id();
        let options = options.unwrap_or_else(|| PublishOptions::qos(QosLevel::ExactlyOnce));

        // Pre-subscribe the directed response topic, shared with other
        // in-flight transfers through the refcount.
        let response_topic = self.topic(
            &resource,
            Operation::ResourceTransferResponse,
            Some(&self.peer_id),
        );
        self.retain_response_topic(&response_topic, options.qos).await?;

        let (writer, stream) = ByteStream::pipe();
        let (meta_tx, meta_rx) = oneshot::channel();
        let timer = self.spawn_fetch_timer(rid.clone());
        self.fetches.lock().unwrap().insert(
            rid.clone(),
            FetchEntry {
                resource: resource.clone(),
                response_topic: response_topic.clone(),
                chunks: writer,
                meta: Some(meta_tx),
                timer,
            },
        );

        let envelope = Envelope::ResourceRequest(ResourceRequest {
            id: rid.clone(),
            sender: Some(self.peer_id.clone()),
            receiver: receiver.clone(),
            resource: resource.clone(),
            params,
        });
        let request_topic = self.topic(
            &resource,
            Operation::ResourceTransferRequest,
            receiver.as_deref(),
        );
        tracing::debug!(resource = %resource, rid = %rid, topic = %request_topic, "fetching resource");

        if let Err(error) = self.publish_envelope(&request_topic, &envelope, &options).await {
            if let Some(entry) = self.fetches.lock().unwrap().remove(&rid) {
                entry.timer.abort();
            }
            if let Err(release) = self.release_response_topic(&response_topic).await {
                self.report(release);
            }
            return Err(error);
        }

        Ok(Fetched {
            stream,
            meta: Some(meta_rx),
        })
    }

    /// Single-shot transfer deadline, armed at fetch start.
    fn spawn_fetch_timer(self: &Arc<Self>, rid: String) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(inner.timeout).await;
            let entry = inner.fetches.lock().unwrap().remove(&rid);
            if let Some(mut entry) = entry {
                tracing::debug!(resource = %entry.resource, rid = %rid, "fetch timed out");
                if let Some(meta) = entry.meta.take() {
                    let _ = meta.send(None);
                }
                entry.chunks.send_err(OverlayError::timeout());
                if let Err(error) = inner.release_response_topic(&entry.response_topic).await {
                    inner.report(error);
                }
            }
        })
    }

    pub(crate) async fn push(&self, push: Push) -> Result<(), OverlayError> {
        let Push {
            resource,
            source,
            params,
            meta,
            receiver,
            options,
        } = push;
        self.transport()?;

        let rid = ids::random_id();
        let options = options.unwrap_or_else(|| PublishOptions::qos(QosLevel::ExactlyOnce));
        let topic = self.topic(
            &resource,
            Operation::ResourceTransferResponse,
            receiver.as_deref(),
        );
        let header = TransferHeader {
            rid,
            resource: Some(resource.clone()),
            params,
        };
        tracing::debug!(resource = %resource, rid = %header.rid, topic = %topic, "pushing resource data");

        match source {
            ByteSource::Buffer(data) => {
                self.send_chunked_buffer(&topic, &header, data, meta, &options)
                    .await
            }
            ByteSource::Stream(stream) => {
                self.send_chunked_stream(&topic, &header, stream, meta, &options)
                    .await
            }
        }
    }

    /// Serve an inbound fetch request: run the handler, then transmit
    /// whichever data source it provided.
    pub(crate) fn on_resource_request(self: &Arc<Self>, request: ResourceRequest) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let ResourceRequest {
                id,
                sender,
                receiver,
                resource,
                params,
            } = request;
            let Some(requester) = sender else {
                inner.report(OverlayError::MissingSender);
                return;
            };

            let response_topic = inner.topic(
                &resource,
                Operation::ResourceTransferResponse,
                Some(&requester),
            );
            let options = PublishOptions::qos(QosLevel::ExactlyOnce);
            let header = TransferHeader {
                rid: id,
                resource: None,
                params: None,
            };

            let handler = inner.resources.lock().unwrap().get(&resource).cloned();
            let Some(handler) = handler else {
                inner
                    .finish_with_error(&response_topic, &header, format!("method not found: {resource}"), &options)
                    .await;
                return;
            };

            let context = Arc::new(ResourceContext::for_fetch(requester, receiver));
            let outcome = handler(params.unwrap_or_default(), Arc::clone(&context)).await;
            if let Err(error) = outcome {
                inner
                    .finish_with_error(&response_topic, &header, error_text(error), &options)
                    .await;
                return;
            }

            let meta = context.take_reply_meta();
            let sent = match context.take_reply() {
                ReplySource::Buffer(data) => {
                    inner
                        .send_chunked_buffer(&response_topic, &header, data, meta, &options)
                        .await
                }
                ReplySource::Stream(stream) => {
                    inner
                        .send_chunked_stream(&response_topic, &header, stream, meta, &options)
                        .await
                }
                ReplySource::Deferred(rx) => match rx.await {
                    Ok(Ok(data)) => {
                        inner
                            .send_chunked_buffer(&response_topic, &header, data, meta, &options)
                            .await
                    }
                    Ok(Err(error)) => {
                        inner
                            .finish_with_error(&response_topic, &header, error_text(error), &options)
                            .await;
                        return;
                    }
                    Err(_) => {
                        inner
                            .finish_with_error(
                                &response_topic,
                                &header,
                                OverlayError::MissingData.to_string(),
                                &options,
                            )
                            .await;
                        return;
                    }
                },
                ReplySource::Unset => {
                    inner
                        .finish_with_error(
                            &response_topic,
                            &header,
                            OverlayError::MissingData.to_string(),
                            &options,
                        )
                        .await;
                    return;
                }
            };
            if let Err(error) = sent {
                inner.report(error);
            }
        });
    }

    /// Route an inbound transfer chunk: an outstanding fetch wins, then a
    /// present `resource` field marks push traffic.
    pub(crate) async fn on_resource_response(self: &Arc<Self>, response: ResourceResponse) {
        let outstanding = self.fetches.lock().unwrap().contains_key(&response.id);
        if outstanding {
            self.on_fetch_chunk(response).await;
        } else if response.resource.is_some() {
            self.on_push_chunk(response);
        } else {
            tracing::trace!(rid = %response.id, "transfer chunk for no outstanding fetch, dropping");
        }
    }

    async fn on_fetch_chunk(&self, response: ResourceResponse) {
        let mut finished = None;
        {
            let mut fetches = self.fetches.lock().unwrap();
            let Some(entry) = fetches.get_mut(&response.id) else {
                return;
            };
            // First chunk resolves the metadata slot, with nothing on an
            // error chunk.
            if let Some(meta_tx) = entry.meta.take() {
                let meta = if response.error.is_some() {
                    None
                } else {
                    response.meta.clone()
                };
                let _ = meta_tx.send(meta);
            }
            if let Some(message) = response.error {
                entry.chunks.send_err(OverlayError::Resource(message));
                finished = fetches.remove(&response.id);
            } else {
                if let Some(chunk) = response.chunk {
                    if !chunk.is_empty() {
                        entry.chunks.write(Bytes::from(chunk));
                    }
                }
                if response.last {
                    finished = fetches.remove(&response.id);
                }
            }
        }
        if let Some(entry) = finished {
            tracing::debug!(resource = %entry.resource, rid = %response.id, "fetch finished");
            entry.timer.abort();
            if let Err(error) = self.release_response_topic(&entry.response_topic).await {
                self.report(error);
            }
            // Dropping the entry closes the stream.
        }
    }

    fn on_push_chunk(self: &Arc<Self>, response: ResourceResponse) {
        let ResourceResponse {
            id: rid,
            sender,
            receiver,
            resource,
            params,
            chunk,
            meta,
            error,
            last,
        } = response;
        let Some(resource) = resource else {
            return;
        };
        let done = last || error.is_some();

        {
            let mut pushes = self.pushes.lock().unwrap();
            if let Some(mut entry) = pushes.remove(&rid) {
                if let Some(message) = error {
                    entry.chunks.send_err(OverlayError::Resource(message));
                } else if let Some(chunk) = chunk {
                    if !chunk.is_empty() {
                        entry.chunks.write(Bytes::from(chunk));
                    }
                }
                entry.timer.abort();
                if done {
                    tracing::debug!(resource = %resource, rid = %rid, "push stream finished");
                } else {
                    // Idle deadline: re-armed on every chunk.
                    entry.timer = self.spawn_push_timer(rid.clone());
                    pushes.insert(rid, entry);
                }
                return;
            }
        }

        // First chunk of a new push stream.
        let handler = self.resources.lock().unwrap().get(&resource).cloned();
        let Some(handler) = handler else {
            tracing::trace!(resource = %resource, rid = %rid, "push for unprovisioned resource, dropping");
            return;
        };
        let (writer, stream) = ByteStream::pipe();
        if let Some(message) = error {
            writer.send_err(OverlayError::Resource(message));
        } else if let Some(chunk) = chunk {
            if !chunk.is_empty() {
                writer.write(Bytes::from(chunk));
            }
        }
        if !done {
            let timer = self.spawn_push_timer(rid.clone());
            self.pushes.lock().unwrap().insert(
                rid.clone(),
                PushEntry {
                    chunks: writer,
                    timer,
                },
            );
        }
        tracing::debug!(resource = %resource, rid = %rid, "push stream opened");

        let context = Arc::new(ResourceContext::for_push(sender, receiver, meta, stream));
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = handler(params.unwrap_or_default(), context).await {
                inner.report(OverlayError::Handler(error_text(err)));
            }
        });
    }

    /// Idle deadline for an assembling push stream.
    fn spawn_push_timer(self: &Arc<Self>, rid: String) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(inner.timeout).await;
            let entry = inner.pushes.lock().unwrap().remove(&rid);
            if let Some(entry) = entry {
                tracing::debug!(rid = %rid, "push stream timed out");
                entry.chunks.send_err(OverlayError::push_timeout());
            }
        })
    }

    /// Transmit a buffer as `max(1, ceil(len/chunk_size))` chunks, the
    /// last one final.
    async fn send_chunked_buffer(
        &self,
        topic: &str,
        header: &TransferHeader,
        data: Vec<u8>,
        mut meta: Option<MetaMap>,
        options: &PublishOptions,
    ) -> Result<(), OverlayError> {
        if data.is_empty() {
            return self
                .send_transfer_chunk(topic, header, None, meta.take(), None, true, options)
                .await;
        }
        let spans = chunk_spans(data.len(), self.chunk_size);
        let count = spans.len();
        for (index, span) in spans.into_iter().enumerate() {
            let last = index + 1 == count;
            self.send_transfer_chunk(
                topic,
                header,
                Some(data[span].to_vec()),
                meta.take(),
                None,
                last,
                options,
            )
            .await?;
        }
        Ok(())
    }

    /// Pump a stream source: one non-final chunk per slice, then an empty
    /// final chunk at stream end, or a final error chunk on stream failure
    /// (which is also handed back to the caller).
    async fn send_chunked_stream(
        &self,
        topic: &str,
        header: &TransferHeader,
        mut stream: ByteStream,
        mut meta: Option<MetaMap>,
        options: &PublishOptions,
    ) -> Result<(), OverlayError> {
        loop {
            match stream.next().await {
                Some(Ok(bytes)) => {
                    for piece in split_chunk(bytes, self.chunk_size) {
                        self.send_transfer_chunk(
                            topic,
                            header,
                            Some(piece.to_vec()),
                            meta.take(),
                            None,
                            false,
                            options,
                        )
                        .await?;
                    }
                }
                Some(Err(error)) => {
                    self.send_transfer_chunk(
                        topic,
                        header,
                        None,
                        meta.take(),
                        Some(error.to_string()),
                        true,
                        options,
                    )
                    .await?;
                    return Err(error);
                }
                None => {
                    return self
                        .send_transfer_chunk(topic, header, None, meta.take(), None, true, options)
                        .await;
                }
            }
        }
    }

    async fn finish_with_error(
        &self,
        topic: &str,
        header: &TransferHeader,
        message: String,
        options: &PublishOptions,
    ) {
        if let Err(error) = self
            .send_transfer_chunk(topic, header, None, None, Some(message), true, options)
            .await
        {
            self.report(error);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_transfer_chunk(
        &self,
        topic: &str,
        header: &TransferHeader,
        chunk: Option<Vec<u8>>,
        meta: Option<MetaMap>,
        error: Option<String>,
        last: bool,
        options: &PublishOptions,
    ) -> Result<(), OverlayError> {
        let envelope = Envelope::ResourceResponse(ResourceResponse {
            id: header.rid.clone(),
            sender: Some(self.peer_id.clone()),
            receiver: None,
            resource: header.resource.clone(),
            params: header.params.clone(),
            chunk,
            meta,
            error,
            last,
        });
        self.publish_envelope(topic, &envelope, options).await
    }
}
