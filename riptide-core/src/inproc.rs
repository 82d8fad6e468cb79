//! In-process wire transport.
//!
//! Sessions inside one process (the test suite, or a host embedding both
//! ends) can join a router or group without TCP or the WebSocket handshake:
//! an inproc pipe pair implements the same [`WireSink`]/[`WireStream`]
//! contract as a real upgraded socket, over channels.
//!
//! Two ways in:
//! - [`pair`] builds two cross-wired pipes directly.
//! - [`bind`]/[`connect`] rendezvous through a global endpoint registry
//!   under the `inproc://` scheme, so the two sides don't need to share a
//!   variable.
//!
//! # Usage
//!
//! ```
//! use riptide_core::inproc;
//! use riptide_core::wire::{WireFrame, WireSink, WireStream};
//!
//! # async fn example() -> riptide_core::error::Result<()> {
//! let (a, b) = inproc::pair();
//! let (mut a_sink, _a_stream) = a.split();
//! let (_b_sink, mut b_stream) = b.split();
//!
//! a_sink.send(WireFrame::Text("hello".into())).await?;
//! assert_eq!(b_stream.recv().await?, Some(WireFrame::Text("hello".into())));
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, RiptideError};
use crate::wire::{WireFrame, WireSink, WireStream};
use async_trait::async_trait;
use dashmap::DashMap;
use flume::{Receiver, Sender};
use once_cell::sync::Lazy;

const SCHEME: &str = "inproc://";

/// Global registry of bound inproc endpoints.
static INPROC_REGISTRY: Lazy<DashMap<String, Sender<InprocPipe>>> = Lazy::new(DashMap::new);

/// One end of an in-process session. Split into halves before handing to a
/// registry entry point.
#[derive(Debug)]
pub struct InprocPipe {
    sink: InprocSink,
    stream: InprocStream,
}

impl InprocPipe {
    /// Split into the boxed-trait-compatible halves.
    #[must_use]
    pub fn split(self) -> (InprocSink, InprocStream) {
        (self.sink, self.stream)
    }
}

/// Outbound half of an inproc pipe.
#[derive(Debug)]
pub struct InprocSink {
    tx: Option<Sender<WireFrame>>,
}

/// Inbound half of an inproc pipe.
#[derive(Debug)]
pub struct InprocStream {
    rx: Receiver<WireFrame>,
}

#[async_trait]
impl WireSink for InprocSink {
    async fn send(&mut self, frame: WireFrame) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(RiptideError::Closed)?;
        tx.send_async(frame)
            .await
            .map_err(|_| RiptideError::Closed)
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the sender is the close signal: the peer's recv returns
        // end-of-stream once the queue drains.
        self.tx.take();
        Ok(())
    }
}

#[async_trait]
impl WireStream for InprocStream {
    async fn recv(&mut self) -> Result<Option<WireFrame>> {
        match self.rx.recv_async().await {
            Ok(frame) => Ok(Some(frame)),
            Err(_) => Ok(None),
        }
    }
}

/// Build two cross-wired pipes. Frames sent on one side arrive on the other.
#[must_use]
pub fn pair() -> (InprocPipe, InprocPipe) {
    let (a_tx, b_rx) = flume::unbounded();
    let (b_tx, a_rx) = flume::unbounded();
    (
        InprocPipe {
            sink: InprocSink { tx: Some(a_tx) },
            stream: InprocStream { rx: a_rx },
        },
        InprocPipe {
            sink: InprocSink { tx: Some(b_tx) },
            stream: InprocStream { rx: b_rx },
        },
    )
}

/// Listener half of a bound inproc endpoint. Unbinds on drop.
#[derive(Debug)]
pub struct InprocListener {
    name: String,
    rx: Receiver<InprocPipe>,
}

impl InprocListener {
    /// Wait for the next connecting peer.
    pub async fn accept(&self) -> Result<InprocPipe> {
        self.rx.recv_async().await.map_err(|_| RiptideError::Closed)
    }
}

impl Drop for InprocListener {
    fn drop(&mut self) {
        INPROC_REGISTRY.remove(&self.name);
    }
}

/// Bind an `inproc://name` endpoint.
pub fn bind(endpoint: &str) -> Result<InprocListener> {
    let name = parse_endpoint(endpoint)?;
    let (tx, rx) = flume::unbounded();

    if INPROC_REGISTRY.insert(name.to_owned(), tx).is_some() {
        return Err(RiptideError::already_exists(endpoint));
    }

    Ok(InprocListener {
        name: name.to_owned(),
        rx,
    })
}

/// Connect to a bound endpoint, handing the listener the peer pipe.
pub fn connect(endpoint: &str) -> Result<InprocPipe> {
    let name = parse_endpoint(endpoint)?;
    let entry = INPROC_REGISTRY
        .get(name)
        .ok_or_else(|| RiptideError::not_found(endpoint))?;

    let (local, remote) = pair();
    entry
        .value()
        .send(remote)
        .map_err(|_| RiptideError::not_found(endpoint))?;
    Ok(local)
}

fn parse_endpoint(endpoint: &str) -> Result<&str> {
    let name = endpoint
        .strip_prefix(SCHEME)
        .ok_or(RiptideError::InvalidParameter(
            "inproc endpoint must start with 'inproc://'",
        ))?;
    if name.is_empty() {
        return Err(RiptideError::InvalidParameter(
            "inproc endpoint name cannot be empty",
        ));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_validation() {
        assert_eq!(parse_endpoint("inproc://test").unwrap(), "test");
        assert!(parse_endpoint("tcp://test").is_err());
        assert!(parse_endpoint("inproc://").is_err());
        assert!(parse_endpoint("").is_err());
    }

    #[tokio::test]
    async fn pair_delivers_in_order() {
        let (a, b) = pair();
        let (mut a_sink, _a_stream) = a.split();
        let (_b_sink, mut b_stream) = b.split();

        for i in 0..4u8 {
            a_sink
                .send(WireFrame::Binary(bytes::Bytes::copy_from_slice(&[i])))
                .await
                .unwrap();
        }
        for i in 0..4u8 {
            let frame = b_stream.recv().await.unwrap().unwrap();
            assert_eq!(frame, WireFrame::Binary(bytes::Bytes::copy_from_slice(&[i])));
        }
    }

    #[tokio::test]
    async fn close_signals_eof() {
        let (a, b) = pair();
        let (mut a_sink, _a_stream) = a.split();
        let (_b_sink, mut b_stream) = b.split();

        a_sink.send(WireFrame::Text("bye".into())).await.unwrap();
        a_sink.close().await.unwrap();

        assert_eq!(
            b_stream.recv().await.unwrap(),
            Some(WireFrame::Text("bye".into()))
        );
        assert_eq!(b_stream.recv().await.unwrap(), None);
        assert!(matches!(
            a_sink.send(WireFrame::Text("late".into())).await,
            Err(RiptideError::Closed)
        ));
    }

    #[tokio::test]
    async fn bind_connect_rendezvous() {
        let listener = bind("inproc://rendezvous").unwrap();
        assert!(bind("inproc://rendezvous").is_err());

        let client = connect("inproc://rendezvous").unwrap();
        let server = listener.accept().await.unwrap();

        let (mut c_sink, _) = client.split();
        let (_, mut s_stream) = server.split();
        c_sink.send(WireFrame::Text("hi".into())).await.unwrap();
        assert_eq!(
            s_stream.recv().await.unwrap(),
            Some(WireFrame::Text("hi".into()))
        );

        drop(listener);
        assert!(connect("inproc://rendezvous").is_err());
    }
}
