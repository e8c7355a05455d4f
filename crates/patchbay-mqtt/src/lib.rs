//! # patchbay-mqtt
//!
//! rumqttc-backed implementation of the engine's [`Transport`] contract.
//!
//! The adapter owns the MQTT client and its event loop task: inbound
//! `Publish` packets are handed to the attached engine handler one at a
//! time, connection errors are logged and retried after a delay. A
//! dry-run [`PublishTuple`] from the engine can be wired up as the
//! broker last-will at connect time.

use patchbay_engine::{InboundHandler, PublishOptions, PublishTuple, QosLevel, Transport, TransportError};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Connection options for [`MqttTransport`].
#[derive(Debug, Clone)]
pub struct MqttTransportConfig {
    /// Broker URL, e.g. `tcp://localhost:1883`
    pub broker_url: String,
    /// MQTT client id; must be unique per broker session
    pub client_id: String,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// Request channel capacity of the underlying client
    pub channel_capacity: usize,
    /// Disconnect notice the broker publishes on unclean disconnect,
    /// usually produced by a dry-run emission
    pub last_will: Option<PublishTuple>,
}

impl Default for MqttTransportConfig {
    fn default() -> Self {
        Self {
            broker_url: "tcp://localhost:1883".to_string(),
            client_id: "patchbay".to_string(),
            keep_alive: Duration::from_secs(30),
            channel_capacity: 100,
            last_will: None,
        }
    }
}

/// MQTT transport backed by `rumqttc::AsyncClient`.
pub struct MqttTransport {
    client: AsyncClient,
    handler: Arc<Mutex<Option<InboundHandler>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Connect to the broker and start the event loop task.
    ///
    /// # Errors
    ///
    /// Returns error when the broker URL cannot be parsed.
    pub fn connect(config: MqttTransportConfig) -> Result<Self, MqttError> {
        let (host, port) = parse_broker_url(&config.broker_url)?;

        let mut options = MqttOptions::new(&config.client_id, host, port);
        options.set_keep_alive(config.keep_alive);
        if let Some(will) = &config.last_will {
            options.set_last_will(LastWill::new(
                &will.topic,
                will.payload.clone(),
                map_qos(will.options.qos),
                will.options.retain,
            ));
        }

        let (client, mut eventloop) = AsyncClient::new(options, config.channel_capacity);
        let handler: Arc<Mutex<Option<InboundHandler>>> = Arc::new(Mutex::new(None));

        let loop_handler = Arc::clone(&handler);
        let event_loop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        tracing::trace!(
                            topic = %publish.topic,
                            payload_len = publish.payload.len(),
                            "inbound message"
                        );
                        let current = loop_handler.lock().unwrap().clone();
                        if let Some(current) = current {
                            // Messages are delivered one at a time; the
                            // engine spawns its own handler work.
                            current(publish.topic.clone(), publish.payload.clone()).await;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("connected to MQTT broker");
                    }
                    Ok(_) => {}
                    Err(error) => {
                        tracing::error!(error = %error, "MQTT error");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            handler,
            event_loop: Mutex::new(Some(event_loop)),
        })
    }

    /// Drop the connection without sending a DISCONNECT packet.
    ///
    /// The broker sees an unclean disconnect and publishes the configured
    /// last-will, if any.
    pub fn abort(&self) {
        if let Some(task) = self.event_loop.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Stop the event loop task and disconnect from the broker.
    pub async fn shutdown(&self) {
        if let Some(task) = self.event_loop.lock().unwrap().take() {
            task.abort();
        }
        if let Err(error) = self.client.disconnect().await {
            tracing::warn!(error = %error, "disconnect failed");
        }
    }
}

#[async_trait::async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), TransportError> {
        self.client
            .subscribe(topic, map_qos(qos))
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::Unsubscribe(e.to_string()))
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: &PublishOptions,
    ) -> Result<(), TransportError> {
        self.client
            .publish(topic, map_qos(options.qos), options.retain, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    fn attach(&self, handler: InboundHandler) -> Result<(), TransportError> {
        let mut slot = self.handler.lock().unwrap();
        if slot.is_some() {
            return Err(TransportError::HandlerAttached);
        }
        *slot = Some(handler);
        Ok(())
    }

    fn detach(&self) {
        self.handler.lock().unwrap().take();
    }
}

/// Map the engine's QoS levels onto rumqttc's.
fn map_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Split a broker URL into host and port, defaulting the port to 1883.
fn parse_broker_url(url: &str) -> Result<(String, u16), MqttError> {
    let trimmed = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("mqtt://"))
        .unwrap_or(url);
    if trimmed.is_empty() {
        return Err(MqttError::InvalidUrl(url.to_string()));
    }
    match trimmed.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| MqttError::InvalidUrl(url.to_string()))?;
            Ok((host.to_string(), port))
        }
        None => Ok((trimmed.to_string(), 1883)),
    }
}

/// Errors raised by the MQTT adapter itself.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MqttError {
    /// The broker URL could not be parsed
    #[error("invalid MQTT URL: {0}")]
    InvalidUrl(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_broker_url_tcp() {
        let (host, port) = parse_broker_url("tcp://localhost:1883").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 1883);
    }

    #[test]
    fn parse_broker_url_default_port() {
        let (host, port) = parse_broker_url("mqtt://broker.example.com").unwrap();
        assert_eq!(host, "broker.example.com");
        assert_eq!(port, 1883);
    }

    #[test]
    fn parse_broker_url_no_scheme() {
        let (host, port) = parse_broker_url("localhost:2883").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 2883);
    }

    #[test]
    fn parse_broker_url_rejects_garbage() {
        assert!(parse_broker_url("tcp://host:notaport").is_err());
        assert!(parse_broker_url("").is_err());
    }

    #[test]
    fn qos_mapping() {
        assert_eq!(map_qos(QosLevel::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(map_qos(QosLevel::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(map_qos(QosLevel::ExactlyOnce), QoS::ExactlyOnce);
    }
}
