//! Round-trip against a real MQTT broker.
//!
//! Skipped unless `PATCHBAY_INTEGRATION=1`; the broker defaults to
//! `tcp://localhost:1883` and can be overridden with
//! `PATCHBAY_MQTT_BROKER`.

use patchbay_engine::proto::Value;
use patchbay_engine::{Call, Emission, Peer, PeerConfig};
use patchbay_mqtt::{MqttTransport, MqttTransportConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

fn broker_url() -> String {
    std::env::var("PATCHBAY_MQTT_BROKER").unwrap_or_else(|_| "tcp://localhost:1883".to_string())
}

fn transport(client_id: &str) -> Arc<MqttTransport> {
    let config = MqttTransportConfig {
        broker_url: broker_url(),
        client_id: client_id.to_string(),
        keep_alive: Duration::from_secs(5),
        ..MqttTransportConfig::default()
    };
    Arc::new(MqttTransport::connect(config).expect("connect to broker"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn event_and_service_round_trip() {
    if std::env::var("PATCHBAY_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set PATCHBAY_INTEGRATION=1 to run");
        return;
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .ok();

    let transport_a = transport(&format!("patchbay-test-a-{}", std::process::id()));
    let transport_b = transport(&format!("patchbay-test-b-{}", std::process::id()));
    let a = Peer::new(transport_a.clone(), PeerConfig::default()).unwrap();
    let b = Peer::new(transport_b.clone(), PeerConfig::default()).unwrap();

    // Give both clients a moment to finish their CONNECT exchange.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (event_tx, event_rx) = oneshot::channel();
    let event_tx = std::sync::Mutex::new(Some(event_tx));
    let _sub = a
        .subscribe("patchbay/test/sample", move |params, _info| {
            if let Some(tx) = event_tx.lock().unwrap().take() {
                let _ = tx.send(params);
            }
            async move { Ok(()) }
        })
        .await
        .unwrap();

    let _reg = a
        .register("patchbay/test/hello", |params, _info| async move {
            let name = params
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(Value::from(format!("hello {name}")))
        })
        .await
        .unwrap();

    b.emit(Emission::new("patchbay/test/sample").param("world"))
        .await
        .unwrap();
    let params = timeout(Duration::from_secs(5), event_rx)
        .await
        .expect("timeout waiting for event")
        .expect("subscriber dropped");
    assert_eq!(params, vec![Value::from("world")]);

    let result = timeout(
        Duration::from_secs(5),
        b.call(Call::new("patchbay/test/hello").param("broker")),
    )
    .await
    .expect("timeout waiting for call")
    .unwrap();
    assert_eq!(result, Value::from("hello broker"));

    a.destroy();
    b.destroy();
    transport_a.shutdown().await;
    transport_b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn last_will_fires_on_unclean_disconnect() {
    if std::env::var("PATCHBAY_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set PATCHBAY_INTEGRATION=1 to run");
        return;
    }

    // The will payload comes from a dry-run peer that never connects.
    let dry = Peer::detached(PeerConfig {
        id: Some("will-peer".to_string()),
        ..PeerConfig::default()
    });
    let will = dry
        .emit_dry(Emission::new("patchbay/test/connection").param("close"))
        .unwrap();

    let watcher_transport = transport(&format!("patchbay-test-w-{}", std::process::id()));
    let watcher = Peer::new(watcher_transport.clone(), PeerConfig::default()).unwrap();

    let (tx, rx) = oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    let _sub = watcher
        .subscribe("patchbay/test/connection", move |params, _info| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(params);
            }
            async move { Ok(()) }
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Connect a doomed client carrying the will, then kill it without a
    // DISCONNECT packet by aborting its event loop.
    let doomed = MqttTransport::connect(MqttTransportConfig {
        broker_url: broker_url(),
        client_id: format!("patchbay-test-d-{}", std::process::id()),
        keep_alive: Duration::from_secs(1),
        last_will: Some(will),
        ..MqttTransportConfig::default()
    })
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    doomed.abort();

    let params = timeout(Duration::from_secs(10), rx)
        .await
        .expect("timeout waiting for will")
        .expect("subscriber dropped");
    assert_eq!(params, vec![Value::from("close")]);

    watcher.destroy();
    watcher_transport.shutdown().await;
}
