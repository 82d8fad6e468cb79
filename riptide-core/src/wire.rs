//! Wire abstraction between the core and the WebSocket library.
//!
//! The core never touches a socket directly: a connector owns one boxed
//! [`WireSink`] and one boxed [`WireStream`], produced either by the
//! `riptide` facade (tungstenite split halves) or by [`crate::inproc`]
//! (in-process pipes for tests and same-process sessions). The traits model
//! the post-handshake frame stream only; upgrade and frame codec live in the
//! transport layer above.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// One WebSocket data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// UTF-8 text frame
    Text(String),
    /// Binary frame
    Binary(Bytes),
}

impl WireFrame {
    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Binary(b) => b.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten to raw bytes, discarding the text/binary distinction.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Text(t) => Bytes::from(t),
            Self::Binary(b) => b,
        }
    }
}

/// Outbound half of a session. Implementations must be cancel-safe: a
/// `send` future dropped mid-flight may corrupt at most its own frame,
/// never the connection state held by the core.
#[async_trait]
pub trait WireSink: Send + 'static {
    /// Write one frame.
    async fn send(&mut self, frame: WireFrame) -> Result<()>;

    /// Flush and close the outbound half. Idempotence is the caller's
    /// business; the core calls this at most once.
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a session.
#[async_trait]
pub trait WireStream: Send + 'static {
    /// Read the next data frame. `Ok(None)` signals clean end-of-stream.
    async fn recv(&mut self) -> Result<Option<WireFrame>>;
}

/// Boxed sink half, as stored by a connector.
pub type BoxWireSink = Box<dyn WireSink>;

/// Boxed stream half, as stored by a connector.
pub type BoxWireStream = Box<dyn WireStream>;
