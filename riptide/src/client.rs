//! Dialer client with heartbeat and bounded-backoff reconnect.
//!
//! A symmetric capability for tests and inter-server links: connect to a
//! riptide (or any WebSocket) endpoint, pump frames both ways, emit a
//! heartbeat on a fixed cadence, and on transport failure redial with
//! exponential backoff until `reconnect_max_tries` is spent.

use crate::ws::{map_ws_error, split_ws};
use bytes::Bytes;
use flume::{Receiver, Sender};
use riptide_core::backoff::BackoffState;
use riptide_core::error::{Result, RiptideError};
use riptide_core::wire::{WireFrame, WireSink, WireStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, warn};

/// Outbound queue depth between `send_*` callers and the session loop.
const CLIENT_WRITE_QUEUE_CAP: usize = 1024;

type EventFn = dyn Fn() + Send + Sync;
type MessageFn = dyn Fn(WireFrame) + Send + Sync;
type ErrorFn = dyn Fn(&RiptideError) + Send + Sync;

/// Client configuration with chained builders over the defaults:
/// 30 s heartbeat, reconnect from a 2 s base, at most 10 tries.
#[derive(Clone)]
pub struct ClientConf {
    pub url: String,
    /// Heartbeat cadence; `Duration::ZERO` disables the heartbeat.
    pub heartbeat: Duration,
    pub heartbeat_text: String,
    pub write_timeout: Duration,
    pub reconnect: bool,
    pub reconnect_base: Duration,
    pub reconnect_max_interval: Duration,
    pub reconnect_max_tries: u32,
    pub on_connect: Option<Arc<EventFn>>,
    pub on_message: Option<Arc<MessageFn>>,
    pub on_error: Option<Arc<ErrorFn>>,
    pub on_close: Option<Arc<EventFn>>,
}

impl ClientConf {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat: Duration::from_secs(30),
            heartbeat_text: "ping".to_owned(),
            write_timeout: Duration::from_secs(10),
            reconnect: true,
            reconnect_base: Duration::from_secs(2),
            reconnect_max_interval: Duration::from_secs(60),
            reconnect_max_tries: 10,
            on_connect: None,
            on_message: None,
            on_error: None,
            on_close: None,
        }
    }

    #[must_use]
    pub fn with_heartbeat(mut self, period: Duration) -> Self {
        self.heartbeat = period;
        self
    }

    #[must_use]
    pub fn with_heartbeat_text(mut self, text: impl Into<String>) -> Self {
        self.heartbeat_text = text.into();
        self
    }

    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub fn with_reconnect_base(mut self, base: Duration) -> Self {
        self.reconnect_base = base;
        self
    }

    #[must_use]
    pub fn with_reconnect_max_interval(mut self, max: Duration) -> Self {
        self.reconnect_max_interval = max;
        self
    }

    #[must_use]
    pub fn with_reconnect_max_tries(mut self, tries: u32) -> Self {
        self.reconnect_max_tries = tries;
        self
    }

    #[must_use]
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_message(mut self, f: impl Fn(WireFrame) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&RiptideError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for ClientConf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConf")
            .field("url", &self.url)
            .field("heartbeat", &self.heartbeat)
            .field("reconnect", &self.reconnect)
            .field("reconnect_max_tries", &self.reconnect_max_tries)
            .finish_non_exhaustive()
    }
}

/// WebSocket dialer.
pub struct Client {
    conf: Arc<ClientConf>,
    weak_self: std::sync::Weak<Client>,
    write_tx: Sender<WireFrame>,
    write_rx: Receiver<WireFrame>,
    closed: AtomicBool,
    close_notified: AtomicBool,
    close_tx: parking_lot::Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
}

impl Client {
    #[must_use]
    pub fn new(conf: ClientConf) -> Arc<Self> {
        let (write_tx, write_rx) = flume::bounded(CLIENT_WRITE_QUEUE_CAP);
        let (close_tx, close_rx) = flume::bounded(1);
        Arc::new_cyclic(|weak| Self {
            conf: Arc::new(conf),
            weak_self: weak.clone(),
            write_tx,
            write_rx,
            closed: AtomicBool::new(false),
            close_notified: AtomicBool::new(false),
            close_tx: parking_lot::Mutex::new(Some(close_tx)),
            close_rx,
        })
    }

    /// Dial the endpoint and start the session loop. A dial failure is
    /// returned directly; reconnection applies only to failures after a
    /// session was established.
    pub async fn connect(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RiptideError::Closed);
        }
        let (ws, _response) = connect_async(self.conf.url.as_str())
            .await
            .map_err(map_ws_error)?;
        self.emit_connect();

        let client = self.weak_self.upgrade().ok_or(RiptideError::Closed)?;
        tokio::spawn(run_session(client, ws));
        Ok(())
    }

    /// Enqueue a text frame.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.enqueue(WireFrame::Text(text.into()))
    }

    /// Enqueue a binary frame.
    pub fn send_binary(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.enqueue(WireFrame::Binary(bytes.into()))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Idempotent teardown: the session loop exits and `on_close` fires
    /// exactly once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_tx.lock().take();
        self.emit_close();
    }

    fn enqueue(&self, frame: WireFrame) -> Result<()> {
        if self.is_closed() {
            return Err(RiptideError::Closed);
        }
        self.write_tx.try_send(frame).map_err(|e| match e {
            flume::TrySendError::Full(_) => RiptideError::QueueFull,
            flume::TrySendError::Disconnected(_) => RiptideError::Closed,
        })
    }

    /// Terminal transition taken by the session loop itself (reconnect
    /// disabled or exhausted).
    fn finish(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_tx.lock().take();
        self.emit_close();
    }

    fn emit_connect(&self) {
        if let Some(cb) = self.conf.on_connect.clone() {
            guard(|| cb());
        }
    }

    fn emit_message(&self, frame: WireFrame) {
        if let Some(cb) = self.conf.on_message.clone() {
            guard(move || cb(frame));
        }
    }

    fn emit_error(&self, err: &RiptideError) {
        if let Some(cb) = self.conf.on_error.clone() {
            guard(|| cb(err));
        }
    }

    fn emit_close(&self) {
        if self.close_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(cb) = self.conf.on_close.clone() {
            guard(|| cb());
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.conf.url)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn guard(f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("client callback panicked");
    }
}

/// Session loop: pump frames, heartbeat, and on transport failure walk the
/// backoff schedule until a redial succeeds or the tries are spent.
async fn run_session(
    client: Arc<Client>,
    ws: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) {
    let mut backoff = BackoffState::new(
        client.conf.reconnect_base,
        client.conf.reconnect_max_interval,
        client.conf.reconnect_max_tries,
    );
    let heartbeat_enabled = !client.conf.heartbeat.is_zero();
    let heartbeat_period = if heartbeat_enabled {
        client.conf.heartbeat
    } else {
        Duration::from_secs(3600)
    };

    let mut current = ws;
    'session: loop {
        let (mut sink, mut stream) = split_ws(current);
        let mut heartbeat = tokio::time::interval(heartbeat_period);
        heartbeat.tick().await; // the first tick completes immediately

        let session_err: RiptideError = loop {
            tokio::select! {
                _ = client.close_rx.recv_async() => {
                    let _ = sink.close().await;
                    return;
                }
                res = stream.recv() => match res {
                    Ok(Some(frame)) => client.emit_message(frame),
                    Ok(None) => break RiptideError::Closed,
                    Err(e) => {
                        client.emit_error(&e);
                        if e.is_fatal() {
                            break e;
                        }
                    }
                },
                msg = client.write_rx.recv_async() => {
                    let Ok(frame) = msg else { return };
                    match tokio::time::timeout(client.conf.write_timeout, sink.send(frame)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            client.emit_error(&e);
                            if e.is_fatal() {
                                break e;
                            }
                        }
                        Err(_) => {
                            let e = RiptideError::Timeout(client.conf.write_timeout);
                            client.emit_error(&e);
                        }
                    }
                }
                _ = heartbeat.tick(), if heartbeat_enabled => {
                    let frame = WireFrame::Text(client.conf.heartbeat_text.clone());
                    if let Err(e) = sink.send(frame).await {
                        client.emit_error(&e);
                        if e.is_fatal() {
                            break e;
                        }
                    }
                }
            }
        };

        let _ = sink.close().await;
        debug!(url = %client.conf.url, error = %session_err, "client session ended");
        if client.is_closed() {
            return;
        }
        if !client.conf.reconnect {
            client.finish();
            return;
        }

        loop {
            let Some(delay) = backoff.next_delay() else {
                warn!(url = %client.conf.url, "reconnect attempts exhausted");
                client.finish();
                return;
            };
            tokio::select! {
                _ = client.close_rx.recv_async() => return,
                () = tokio::time::sleep(delay) => {}
            }
            match connect_async(client.conf.url.as_str()).await {
                Ok((ws, _response)) => {
                    backoff.reset();
                    client.emit_connect();
                    current = ws;
                    continue 'session;
                }
                Err(e) => {
                    let e = map_ws_error(e);
                    debug!(url = %client.conf.url, attempt = backoff.attempt(), error = %e, "redial failed");
                    client.emit_error(&e);
                }
            }
        }
    }
}
