//! Write-queue capacity semantics: non-blocking enqueue fails fast at
//! capacity, blocking enqueue suspends until the pump drains an entry.

use async_trait::async_trait;
use bytes::Bytes;
use flume::{Receiver, Sender};
use riptide_core::inproc;
use riptide_core::prelude::*;
use std::collections::HashMap;
use std::time::Duration;

/// Sink whose every send blocks until the test releases a token, so the
/// write pump can be parked mid-frame deterministically.
struct GatedSink {
    gate: Receiver<()>,
    sent: Sender<Bytes>,
}

#[async_trait]
impl WireSink for GatedSink {
    async fn send(&mut self, frame: WireFrame) -> Result<()> {
        self.gate
            .recv_async()
            .await
            .map_err(|_| RiptideError::Closed)?;
        let _ = self.sent.send(frame.into_bytes());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn queue_full_then_blocking_enqueue_resumes() {
    let (gate_tx, gate_rx) = flume::unbounded::<()>();
    let (sent_tx, sent_rx) = flume::unbounded::<Bytes>();

    // Long write timeout so the parked frame is never dropped mid-test.
    let conf = RouterConf::new("/gated")
        .with_buckets(1)
        .with_write_queue_cap(4)
        .with_write_timeout(Duration::from_secs(60));
    let router = Router::new(conf).unwrap();

    // Keep the remote end alive so the read pump sits idle.
    let (local, _remote) = inproc::pair();
    let (_unused_sink, stream) = local.split();
    let bucket = router.bucket(0).unwrap();
    let conn = bucket
        .add_conn(
            1,
            Box::new(GatedSink {
                gate: gate_rx,
                sent: sent_tx,
            }),
            Box::new(stream),
            HashMap::new(),
            HashMap::new(),
        )
        .unwrap();

    // First frame is pulled by the pump and parks on the gate.
    conn.queue_write(Bytes::from_static(b"f0")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Now fill the queue itself to capacity.
    for i in 1..=4u8 {
        conn.queue_write(Bytes::from(vec![b'f', b'0' + i])).unwrap();
    }

    // Capacity reached: the non-blocking enqueue fails fast.
    assert!(matches!(
        conn.queue_write(Bytes::from_static(b"f5")),
        Err(RiptideError::QueueFull)
    ));

    // The blocking variant suspends instead.
    let waiter = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.queue_write_wait(Bytes::from_static(b"f5")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "blocking enqueue must suspend on a full queue");

    // Release one frame: the pump drains an entry and the waiter gets in.
    gate_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("blocking enqueue must resume once the pump drains")
        .unwrap()
        .unwrap();

    // Drain the rest and check wire order matches enqueue order.
    for _ in 0..5 {
        gate_tx.send(()).unwrap();
    }
    let expected: &[&[u8]] = &[b"f0", b"f1", b"f2", b"f3", b"f4", b"f5"];
    for want in expected {
        let got = tokio::time::timeout(Duration::from_secs(1), sent_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got[..], *want);
    }

    router.quit().await;
}
