//! Resource fetch and push scenarios over the loopback transport.

mod common;

use common::{peer, peer_with, LoopbackBus};
use patchbay_engine::proto::{Operation, SlashScheme, TopicScheme, Value};
use patchbay_engine::{
    ByteStream, Fetch, Meta, OverlayError, PeerConfig, Push,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn small_chunks() -> PeerConfig {
    PeerConfig {
        chunk_size: 4,
        ..PeerConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn fetch_aggregates_chunked_buffer() {
    let bus = LoopbackBus::new();
    // The provisioner chunks replies at 4 bytes, so this transfer takes
    // ceil(15/4) = 4 data chunks.
    let a = peer_with(&bus, small_chunks());
    let b = peer(&bus);

    let _prov = a
        .provision("example/download", |params, ctx| async move {
            match params.first().and_then(Value::as_str) {
                Some("foo") => {
                    ctx.reply_buffer(&b"the foo content"[..]);
                    Ok(())
                }
                _ => Err(anyhow::anyhow!("invalid resource")),
            }
        })
        .await
        .unwrap();

    let fetched = b
        .fetch(Fetch::new("example/download").param("foo"))
        .await
        .unwrap();
    let buffer = timeout(WAIT, fetched.buffer()).await.unwrap().unwrap();
    assert_eq!(buffer, b"the foo content");

    // The response topic refcount went back to zero.
    let response_topic = SlashScheme.make(
        "example/download",
        Operation::ResourceTransferResponse,
        Some(b.peer_id()),
    );
    assert_eq!(bus.subscriber_count(&response_topic), 0);
}

#[tokio::test(start_paused = true)]
async fn fetch_streams_in_order_chunks() {
    let bus = LoopbackBus::new();
    let a = peer_with(&bus, small_chunks());
    let b = peer(&bus);

    let _prov = a
        .provision("example/download", |_params, ctx| async move {
            ctx.reply_buffer(&b"abcdefgh"[..]);
            Ok(())
        })
        .await
        .unwrap();

    let mut fetched = b
        .fetch(Fetch::new("example/download"))
        .await
        .unwrap();
    let mut chunks = Vec::new();
    while let Some(item) = timeout(WAIT, fetched.stream.next()).await.unwrap() {
        chunks.push(item.unwrap());
    }
    assert_eq!(chunks.len(), 2);
    assert_eq!(&chunks[0][..], b"abcd");
    assert_eq!(&chunks[1][..], b"efgh");
}

#[tokio::test(start_paused = true)]
async fn fetch_error_reaches_the_buffer() {
    let bus = LoopbackBus::new();
    let a = peer(&bus);
    let b = peer(&bus);

    let _prov = a
        .provision("example/download", |params, ctx| async move {
            match params.first().and_then(Value::as_str) {
                Some("foo") => {
                    ctx.reply_buffer(&b"the foo content"[..]);
                    Ok(())
                }
                _ => Err(anyhow::anyhow!("invalid resource")),
            }
        })
        .await
        .unwrap();

    let fetched = b
        .fetch(Fetch::new("example/download").param("bar"))
        .await
        .unwrap();
    let error = timeout(WAIT, fetched.buffer()).await.unwrap().unwrap_err();
    assert!(matches!(error, OverlayError::Resource(m) if m == "invalid resource"));
}

#[tokio::test(start_paused = true)]
async fn fetch_without_provisioner_times_out() {
    let bus = LoopbackBus::new();
    let b = peer(&bus);

    let mut fetched = b
        .fetch(Fetch::new("example/nothing"))
        .await
        .unwrap();
    assert_eq!(fetched.meta().await, None);
    let error = fetched.buffer().await.unwrap_err();
    assert!(matches!(error, OverlayError::Timeout(m) if m == "communication timeout"));

    let response_topic = SlashScheme.make(
        "example/nothing",
        Operation::ResourceTransferResponse,
        Some(b.peer_id()),
    );
    assert_eq!(bus.subscriber_count(&response_topic), 0);
}

#[tokio::test(start_paused = true)]
async fn fetch_meta_arrives_with_first_chunk() {
    let bus = LoopbackBus::new();
    let a = peer(&bus);
    let b = peer(&bus);

    let _prov = a
        .provision("example/download", |_params, ctx| async move {
            ctx.reply_meta(Meta::new().entry("name", "file.bin").entry("size", 5));
            ctx.reply_buffer(&b"hello"[..]);
            Ok(())
        })
        .await
        .unwrap();

    let mut fetched = b
        .fetch(Fetch::new("example/download"))
        .await
        .unwrap();
    let meta = timeout(WAIT, fetched.meta()).await.unwrap().unwrap();
    assert_eq!(meta.get("name"), Some(&Value::from("file.bin")));
    assert_eq!(meta.get("size"), Some(&Value::from(5)));
    assert_eq!(fetched.buffer().await.unwrap(), b"hello");
}

#[tokio::test(start_paused = true)]
async fn fetch_deferred_reply() {
    let bus = LoopbackBus::new();
    let a = peer(&bus);
    let b = peer(&bus);

    let _prov = a
        .provision("example/download", |_params, ctx| async move {
            let reply = ctx.reply_later();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                reply.fulfill(&b"eventually"[..]);
            });
            Ok(())
        })
        .await
        .unwrap();

    let fetched = b
        .fetch(Fetch::new("example/download"))
        .await
        .unwrap();
    assert_eq!(
        timeout(WAIT, fetched.buffer()).await.unwrap().unwrap(),
        b"eventually"
    );
}

#[tokio::test(start_paused = true)]
async fn fetch_handler_without_data_reports_missing_source() {
    let bus = LoopbackBus::new();
    let a = peer(&bus);
    let b = peer(&bus);

    let _prov = a
        .provision("example/download", |_params, _ctx| async move { Ok(()) })
        .await
        .unwrap();

    let fetched = b
        .fetch(Fetch::new("example/download"))
        .await
        .unwrap();
    let error = timeout(WAIT, fetched.buffer()).await.unwrap().unwrap_err();
    assert!(matches!(
        error,
        OverlayError::Resource(m)
            if m == "handler did not provide data via info.resource/buffer/stream"
    ));
}

#[tokio::test(start_paused = true)]
async fn push_round_trip_preserves_bytes_and_meta() {
    let bus = LoopbackBus::new();
    let a = peer(&bus);
    let b = peer_with(
        &bus,
        PeerConfig {
            chunk_size: 4096,
            ..PeerConfig::default()
        },
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _prov = a
        .provision("example/upload", move |params, ctx| {
            let tx = tx.clone();
            async move {
                let data = ctx.collect().await.transpose()?;
                tx.send((params, ctx.meta.clone(), data)).ok();
                Ok(())
            }
        })
        .await
        .unwrap();

    let payload: Vec<u8> = (0..16 * 1024).map(|_| rand::random::<u8>()).collect();
    let (writer, stream) = ByteStream::pipe();
    {
        let payload = payload.clone();
        tokio::spawn(async move {
            // Uneven writes; the engine re-slices to its chunk size.
            for piece in payload.chunks(1000) {
                writer.write(piece.to_vec());
            }
        });
    }

    b.push(
        Push::new("example/upload", stream)
            .param("blob")
            .meta(Meta::new().entry("name", "blob.bin")),
    )
    .await
    .unwrap();

    let (params, meta, data) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(params, vec![Value::from("blob")]);
    assert_eq!(
        meta.unwrap().get("name"),
        Some(&Value::from("blob.bin"))
    );
    assert_eq!(data.unwrap(), payload);
}

#[tokio::test(start_paused = true)]
async fn push_empty_buffer_closes_the_stream() {
    let bus = LoopbackBus::new();
    let a = peer(&bus);
    let b = peer(&bus);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _prov = a
        .provision("example/upload", move |_params, ctx| {
            let tx = tx.clone();
            async move {
                tx.send(ctx.collect().await.transpose()?).ok();
                Ok(())
            }
        })
        .await
        .unwrap();

    b.push(Push::new("example/upload", Vec::<u8>::new()))
        .await
        .unwrap();

    let data = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(data.unwrap(), Vec::<u8>::new());
}

#[tokio::test(start_paused = true)]
async fn push_stream_failure_terminates_both_sides() {
    let bus = LoopbackBus::new();
    let a = peer(&bus);
    let b = peer(&bus);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _prov = a
        .provision("example/upload", move |_params, ctx| {
            let tx = tx.clone();
            async move {
                tx.send(ctx.collect().await).ok();
                Ok(())
            }
        })
        .await
        .unwrap();

    let (writer, stream) = ByteStream::pipe();
    writer.write(&b"partial"[..]);
    writer.fail("disk vanished");
    drop(writer);

    let error = b
        .push(Push::new("example/upload", stream))
        .await
        .unwrap_err();
    assert!(matches!(error, OverlayError::Resource(ref m) if m == "disk vanished"));

    let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    let error = received.unwrap().unwrap_err();
    assert!(matches!(error, OverlayError::Resource(m) if m == "disk vanished"));
}

#[tokio::test(start_paused = true)]
async fn stalled_push_stream_times_out() {
    let bus = LoopbackBus::new();
    let a = peer(&bus);
    let b = peer(&bus);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _prov = a
        .provision("example/upload", move |_params, ctx| {
            let tx = tx.clone();
            async move {
                tx.send(ctx.collect().await).ok();
                Ok(())
            }
        })
        .await
        .unwrap();

    // One chunk, then silence: the writer stays open so no final chunk is
    // ever published.
    let (writer, stream) = ByteStream::pipe();
    writer.write(&b"first"[..]);
    let _push = tokio::spawn(async move {
        let _ = b.push(Push::new("example/upload", stream)).await;
    });

    let received = timeout(Duration::from_secs(30), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let error = received.unwrap().unwrap_err();
    assert!(matches!(error, OverlayError::Timeout(m) if m == "push stream timeout"));
    drop(writer);
}

#[tokio::test(start_paused = true)]
async fn provision_teardown_clears_all_topics() {
    let bus = LoopbackBus::new();
    let a = peer(&bus);

    let mut prov = a
        .provision("example/download", |_params, _ctx| async move { Ok(()) })
        .await
        .unwrap();

    let topics = [
        SlashScheme.make("example/download", Operation::ResourceTransferRequest, None),
        SlashScheme.make(
            "example/download",
            Operation::ResourceTransferRequest,
            Some(a.peer_id()),
        ),
        SlashScheme.make("example/download", Operation::ResourceTransferResponse, None),
        SlashScheme.make(
            "example/download",
            Operation::ResourceTransferResponse,
            Some(a.peer_id()),
        ),
    ];
    for topic in &topics {
        assert_eq!(bus.subscriber_count(topic), 1, "{topic}");
    }

    prov.unprovision().await.unwrap();
    for topic in &topics {
        assert_eq!(bus.subscriber_count(topic), 0, "{topic}");
    }
    assert!(matches!(
        prov.unprovision().await.unwrap_err(),
        OverlayError::NotProvisioned
    ));
}

#[tokio::test(start_paused = true)]
async fn directed_fetch_reaches_only_the_addressed_provisioner() {
    let bus = LoopbackBus::new();
    let a = peer(&bus);
    let c = peer(&bus);
    let b = peer(&bus);

    let provision = |label: &'static str| {
        move |_params: Vec<Value>, ctx: std::sync::Arc<patchbay_engine::ResourceContext>| async move {
            ctx.reply_buffer(label.as_bytes().to_vec());
            Ok(())
        }
    };
    let _prov_a = a.provision("example/download", provision("from-a")).await.unwrap();
    let _prov_c = c.provision("example/download", provision("from-c")).await.unwrap();

    let fetched = b
        .fetch(Fetch::new("example/download").receiver(a.peer_id()))
        .await
        .unwrap();
    assert_eq!(
        timeout(WAIT, fetched.buffer()).await.unwrap().unwrap(),
        b"from-a"
    );
}
