//! tungstenite adapters: wrap the split halves of an upgraded
//! `WebSocketStream` in the core wire traits.
//!
//! Control frames are handled here so the core only ever sees data frames:
//! pings are answered by the library on the next flush, pongs are dropped,
//! and a close frame (or a closed-connection error) surfaces as clean
//! end-of-stream.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use riptide_core::error::{Result, RiptideError};
use riptide_core::wire::{WireFrame, WireSink, WireStream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

/// Outbound half of an upgraded socket.
pub struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

/// Inbound half of an upgraded socket.
pub struct WsStream<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

/// Split an upgraded stream into core-compatible halves.
pub fn split_ws<S>(ws: WebSocketStream<S>) -> (WsSink<S>, WsStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    (WsSink { inner: sink }, WsStream { inner: stream })
}

#[async_trait]
impl<S> WireSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: WireFrame) -> Result<()> {
        let msg = match frame {
            WireFrame::Text(t) => Message::Text(t.into()),
            WireFrame::Binary(b) => Message::Binary(b.into()),
        };
        self.inner.send(msg).await.map_err(map_ws_error)
    }

    async fn close(&mut self) -> Result<()> {
        match self.inner.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(map_ws_error(e)),
        }
    }
}

#[async_trait]
impl<S> WireStream for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<WireFrame>> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Ok(Message::Text(t))) => {
                    return Ok(Some(WireFrame::Text(t.as_str().to_owned())))
                }
                Some(Ok(Message::Binary(b))) => {
                    return Ok(Some(WireFrame::Binary(Bytes::from(b))))
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Pings are auto-answered by tungstenite; pongs and raw
                // frames carry nothing for the application.
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    return Ok(None)
                }
                Some(Err(e)) => return Err(map_ws_error(e)),
            }
        }
    }
}

pub(crate) fn map_ws_error(err: WsError) -> RiptideError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => RiptideError::Closed,
        WsError::Io(e) => RiptideError::Io(e),
        other => RiptideError::transport(other.to_string()),
    }
}
