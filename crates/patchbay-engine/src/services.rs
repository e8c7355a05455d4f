//! Service subsystem: register/call with per-request correlation.
//!
//! Every call pre-subscribes the caller's directed response topic (through
//! the refcount table, so concurrent calls to one service share a single
//! broker subscription), registers a pending entry keyed by the
//! correlation id, publishes the request and waits for the response or the
//! timeout.

use crate::error::{error_text, OverlayError};
use crate::events::subscribe_all;
use crate::ids;
use crate::options::{Call, CallInfo};
use crate::peer::{Peer, PeerInner, PendingCall, Registration, ServiceHandler};
use futures::FutureExt;
use patchbay_proto::{Envelope, Operation, ServiceRequest, ServiceResponse, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

impl Peer {
    /// Register a service handler with the default QoS (2).
    ///
    /// The handler receives the call's positional parameters plus a
    /// [`CallInfo`]; its return value travels back to the caller, its
    /// error text becomes the remote `ServiceError`.
    ///
    /// # Errors
    ///
    /// Fails with `AlreadyRegistered` when this peer already serves the
    /// service, or with a transport error when a broker subscribe fails.
    pub async fn register<F, Fut>(
        &self,
        service: &str,
        handler: F,
    ) -> Result<Registration, OverlayError>
    where
        F: Fn(Vec<Value>, CallInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register_with(service, crate::QosLevel::ExactlyOnce, handler)
            .await
    }

    /// Register a service handler with an explicit QoS.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Peer::register`].
    pub async fn register_with<F, Fut>(
        &self,
        service: &str,
        qos: crate::QosLevel,
        handler: F,
    ) -> Result<Registration, OverlayError>
    where
        F: Fn(Vec<Value>, CallInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let inner = &self.inner;
        inner.transport()?;

        let boxed: ServiceHandler = Arc::new(move |params, info| handler(params, info).boxed());
        {
            let mut services = inner.services.lock().unwrap();
            if services.contains_key(service) {
                return Err(OverlayError::AlreadyRegistered(service.to_string()));
            }
            services.insert(service.to_string(), boxed);
        }

        let topics = vec![
            inner.topic(service, Operation::ServiceCallRequest, None),
            inner.topic(service, Operation::ServiceCallRequest, Some(&inner.peer_id)),
        ];
        if let Err(error) = subscribe_all(inner, &topics, qos).await {
            inner.services.lock().unwrap().remove(service);
            return Err(error);
        }

        tracing::debug!(service, peer_id = %inner.peer_id, "service registered");
        Ok(Registration {
            inner: Arc::clone(inner),
            service: service.to_string(),
            topics,
            torn_down: false,
        })
    }

    /// Call a service and wait for its single response.
    ///
    /// # Errors
    ///
    /// - `Service(message)` when the remote registrant failed
    /// - `Timeout("communication timeout")` when no response arrived
    /// - encode/transport failures from the request publish
    pub async fn call(&self, call: Call) -> Result<Value, OverlayError> {
        self.inner.call(call).await
    }
}

impl PeerInner {
    pub(crate) async fn call(&self, call: Call) -> Result<Value, OverlayError> {
        let Call {
            service,
            params,
            receiver,
            options,
        } = call;
        self.transport()?;

        let rid = ids::random_id();
        let options = options.unwrap_or_else(|| {
            crate::PublishOptions::qos(crate::QosLevel::ExactlyOnce)
        });

        // Subscribe the response topic before publishing the request, so
        // a fast registrant cannot answer into the void.
        let response_topic = self.topic(
            &service,
            Operation::ServiceCallResponse,
            Some(&self.peer_id),
        );
        self.retain_response_topic(&response_topic, options.qos).await?;

        let (tx, rx) = oneshot::channel();
        self.pending_calls.lock().unwrap().insert(
            rid.clone(),
            PendingCall {
                service: service.clone(),
                response_topic: response_topic.clone(),
                tx,
            },
        );

        let envelope = Envelope::ServiceRequest(ServiceRequest {
            id: rid.clone(),
            sender: Some(self.peer_id.clone()),
            receiver: receiver.clone(),
            service: service.clone(),
            params,
        });
        let request_topic = self.topic(&service, Operation::ServiceCallRequest, receiver.as_deref());
        tracing::debug!(service = %service, rid = %rid, topic = %request_topic, "calling service");

        if let Err(error) = self.publish_envelope(&request_topic, &envelope, &options).await {
            self.abort_call(&rid).await;
            return Err(error);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // The sender half only disappears with its pending entry, so
            // treat a closed channel like an elapsed deadline.
            Ok(Err(_)) => Err(OverlayError::timeout()),
            Err(_) => {
                tracing::debug!(service = %service, rid = %rid, "call timed out");
                self.abort_call(&rid).await;
                Err(OverlayError::timeout())
            }
        }
    }

    /// Drop a pending call and its refcount contribution, if still there.
    async fn abort_call(&self, rid: &str) {
        let entry = self.pending_calls.lock().unwrap().remove(rid);
        if let Some(entry) = entry {
            if let Err(error) = self.release_response_topic(&entry.response_topic).await {
                self.report(error);
            }
        }
    }

    /// Serve an inbound service request.
    pub(crate) fn on_service_request(self: &Arc<Self>, request: ServiceRequest) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let ServiceRequest {
                id,
                sender,
                receiver,
                service,
                params,
            } = request;
            // Without a sender id there is nowhere to publish the response.
            let Some(requester) = sender else {
                inner.report(OverlayError::MissingSender);
                return;
            };

            let handler = inner.services.lock().unwrap().get(&service).cloned();
            let outcome: Result<Value, String> = match handler {
                None => Err(format!("method not found: {service}")),
                Some(handler) => {
                    let info = CallInfo {
                        sender: Some(requester.clone()),
                        receiver,
                    };
                    handler(params.unwrap_or_default(), info)
                        .await
                        .map_err(error_text)
                }
            };

            let (result, error) = match outcome {
                Ok(value) => (Some(value), None),
                Err(message) => (None, Some(message)),
            };
            let envelope = Envelope::ServiceResponse(ServiceResponse {
                id,
                sender: Some(inner.peer_id.clone()),
                receiver: None,
                result,
                error,
            });
            let topic = inner.topic(&service, Operation::ServiceCallResponse, Some(&requester));
            let options = crate::PublishOptions::qos(crate::QosLevel::ExactlyOnce);
            if let Err(error) = inner.publish_envelope(&topic, &envelope, &options).await {
                inner.report(error);
            }
        });
    }

    /// Complete the pending call matching an inbound response.
    pub(crate) async fn on_service_response(&self, response: ServiceResponse) {
        let entry = self.pending_calls.lock().unwrap().remove(&response.id);
        let Some(entry) = entry else {
            tracing::trace!(rid = %response.id, "response for no pending call, dropping");
            return;
        };
        tracing::debug!(service = %entry.service, rid = %response.id, "service response received");
        let outcome = match response.error {
            Some(message) => Err(OverlayError::Service(message)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = entry.tx.send(outcome);
        if let Err(error) = self.release_response_topic(&entry.response_topic).await {
            self.report(error);
        }
    }
}
