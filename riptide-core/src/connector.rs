//! Connector (per-session core)
//!
//! One connector == one live WebSocket session.
//!
//! Responsibilities:
//! - Own the sink/stream halves of the upgraded socket
//! - Drive read + write pumps (split-pump design)
//! - Decouple socket backpressure from handler latency via a bounded
//!   dispatch channel drained by an async worker
//! - Emit a single down event to its container on EOF or fatal error
//! - Never contain routing logic (buckets and groups fan out)
//!
//! Lock discipline: the sink is behind an async mutex taken per frame; the
//! close path takes the same mutex, closes, and nulls the half inside the
//! critical section. Deadlines wrap the awaited I/O call itself
//! (`tokio::time::timeout`), never the lock acquisition.

use crate::error::{Result, RiptideError};
use crate::message::{MessageType, Payload};
use crate::props::{PropBag, PropValue};
use crate::wire::{BoxWireSink, BoxWireStream, WireFrame};

use bytes::Bytes;
use flume::{Receiver, Sender};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Read handler installed by the owning bucket or group. Invoked on the
/// dispatch worker, panic-guarded.
pub(crate) type DispatchFn = dyn Fn(u64, MessageType, Payload) + Send + Sync;

/// Run a host callback under the panic guard every core-spawned task uses:
/// a panicking host must never take a pump or registry down with it.
pub(crate) fn run_guarded(what: &'static str, id: u64, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(id, "host {what} callback panicked");
    }
}

/// Lifecycle events from connector pumps to the owning container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnEvent {
    /// Read EOF or fatal transport error; the container must remove and
    /// close the connector.
    Down { conn_id: u64 },
}

/// Per-connector slice of the registry configuration.
#[derive(Debug, Clone)]
pub(crate) struct ConnSettings {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub message_type: MessageType,
    pub write_queue_cap: usize,
    pub dispatch_queue_cap: usize,
}

/// The runtime handle for one session.
pub struct Connector {
    conn_id: u64,
    /// 0 = unset. Owner index maintenance is the group's business.
    owner_id: AtomicU64,
    message_type: MessageType,
    read_timeout: Duration,
    write_timeout: Duration,

    last_active: parking_lot::Mutex<Instant>,

    sink: async_lock::Mutex<Option<BoxWireSink>>,
    stream: async_lock::Mutex<Option<BoxWireStream>>,

    write_tx: Sender<Bytes>,

    closed: AtomicBool,
    /// Holding slot for the close signal: taking (and dropping) the sender
    /// disconnects `close_rx`, which wakes every pump and entry waiter.
    close_tx: parking_lot::Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,

    props: PropBag,
    uri_paras: HashMap<String, String>,
    query_paras: HashMap<String, String>,
}

impl Connector {
    /// Build a connector and spawn its read pump, write pump and dispatch
    /// worker. Exactly one of each runs until close.
    pub(crate) fn spawn(
        conn_id: u64,
        sink: BoxWireSink,
        stream: BoxWireStream,
        settings: ConnSettings,
        uri_paras: HashMap<String, String>,
        query_paras: HashMap<String, String>,
        events: Sender<ConnEvent>,
        on_read: Option<Arc<DispatchFn>>,
    ) -> Arc<Self> {
        let (write_tx, write_rx) = flume::bounded(settings.write_queue_cap);
        let (close_tx, close_rx) = flume::bounded(1);
        let (dispatch_tx, dispatch_rx) = flume::bounded(settings.dispatch_queue_cap);

        let conn = Arc::new(Self {
            conn_id,
            owner_id: AtomicU64::new(0),
            message_type: settings.message_type,
            read_timeout: settings.read_timeout,
            write_timeout: settings.write_timeout,
            last_active: parking_lot::Mutex::new(Instant::now()),
            sink: async_lock::Mutex::new(Some(sink)),
            stream: async_lock::Mutex::new(Some(stream)),
            write_tx,
            closed: AtomicBool::new(false),
            close_tx: parking_lot::Mutex::new(Some(close_tx)),
            close_rx,
            props: PropBag::new(),
            uri_paras,
            query_paras,
        });

        tokio::spawn(write_pump(conn.clone(), write_rx, events.clone()));
        tokio::spawn(read_pump(conn.clone(), dispatch_tx, events));
        tokio::spawn(dispatch_worker(conn.clone(), dispatch_rx, on_read));

        conn
    }

    #[must_use]
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Host-assigned identity; 0 when unset.
    #[must_use]
    pub fn owner_id(&self) -> u64 {
        self.owner_id.load(Ordering::Acquire)
    }

    /// Bare accessor. Inside a group, use `Group::set_owner` so the owner
    /// index stays consistent with the member map.
    pub fn set_owner_id(&self, owner_id: u64) {
        self.owner_id.store(owner_id, Ordering::Release);
    }

    /// Instant of the last successful read or write.
    #[must_use]
    pub fn active_time(&self) -> Instant {
        *self.last_active.lock()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Path variables captured from the registered pattern.
    #[must_use]
    pub fn uri_paras(&self) -> &HashMap<String, String> {
        &self.uri_paras
    }

    /// Query-string parameters of the upgrade request.
    #[must_use]
    pub fn query_paras(&self) -> &HashMap<String, String> {
        &self.query_paras
    }

    pub fn get_prop(&self, key: &str) -> Result<PropValue> {
        self.props
            .get(key)
            .ok_or_else(|| RiptideError::not_found(format!("property '{key}'")))
    }

    pub fn set_prop(&self, key: impl Into<String>, value: impl Into<PropValue>) {
        self.props.set(key, value);
    }

    pub fn remove_prop(&self, key: &str) -> Option<PropValue> {
        self.props.remove(key)
    }

    /// Synchronously send one payload through the socket under the write
    /// deadline, encoded per the registry's message type.
    pub async fn write(&self, payload: impl Into<Payload>) -> Result<()> {
        let frame = payload.into().encode(self.message_type)?;
        self.send_frame(frame).await
    }

    /// Enqueue raw bytes into the bounded write queue without blocking.
    ///
    /// The write pump frames them per the registry's message type and sends
    /// in enqueue order.
    pub fn queue_write(&self, bytes: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(RiptideError::QueueClosed);
        }
        self.write_tx.try_send(bytes).map_err(|e| match e {
            flume::TrySendError::Full(_) => RiptideError::QueueFull,
            flume::TrySendError::Disconnected(_) => RiptideError::QueueClosed,
        })
    }

    /// Enqueue raw bytes, suspending while the queue is at capacity.
    pub async fn queue_write_wait(&self, bytes: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(RiptideError::QueueClosed);
        }
        self.write_tx
            .send_async(bytes)
            .await
            .map_err(|_| RiptideError::QueueClosed)
    }

    /// Blocking single-frame read under the read deadline.
    ///
    /// The standard read pump calls this in a loop; direct callers compete
    /// with it for frames and should only be used on connectors without an
    /// installed read callback.
    pub async fn read(&self) -> Result<Option<WireFrame>> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(RiptideError::Closed)?;
        match tokio::time::timeout(self.read_timeout, stream.recv()).await {
            Ok(Ok(Some(frame))) => {
                self.touch();
                Ok(Some(frame))
            }
            Ok(res) => res,
            Err(_) => Err(RiptideError::Timeout(self.read_timeout)),
        }
    }

    /// Idempotent teardown: signal the pumps, close and null the sink.
    /// Safe to call from any task at any time, including concurrently with
    /// `write`/`queue_write`/`read`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Wake pumps and entry waiters by dropping the close sender.
        self.close_tx.lock().take();

        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            if tokio::time::timeout(self.write_timeout, sink.close())
                .await
                .is_err()
            {
                debug!(conn_id = self.conn_id, "sink close timed out");
            }
        }
        drop(guard);

        // Release the stream half if no read is in flight; an in-flight
        // pump read is cancelled by the close signal and drops it then.
        if let Some(mut guard) = self.stream.try_lock() {
            guard.take();
        }
    }

    /// Best-effort text frame, then close.
    pub async fn close_with_message(&self, text: impl Into<String>) -> Result<()> {
        let _ = self.send_frame(WireFrame::Text(text.into())).await;
        self.close().await;
        Ok(())
    }

    /// Resolves once close has been signalled. Entry handlers suspend here
    /// so the upgraded socket outlives the HTTP handler frame.
    pub async fn wait_closed(&self) {
        let _ = self.close_rx.recv_async().await;
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    async fn send_frame(&self, frame: WireFrame) -> Result<()> {
        if self.is_closed() {
            return Err(RiptideError::Closed);
        }
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(RiptideError::Closed)?;
        match tokio::time::timeout(self.write_timeout, sink.send(frame)).await {
            Ok(res) => {
                res?;
                self.touch();
                Ok(())
            }
            Err(_) => Err(RiptideError::Timeout(self.write_timeout)),
        }
    }

    /// Frame queued raw bytes per the registry's message type.
    fn frame_queued(&self, bytes: Bytes) -> Result<WireFrame> {
        Payload::Octet(bytes).encode(self.message_type)
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("conn_id", &self.conn_id)
            .field("owner_id", &self.owner_id())
            .field("message_type", &self.message_type)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Drains the write queue onto the socket, in enqueue order. Fatal errors
/// produce a single down event; everything else drops the frame and keeps
/// the pump alive.
async fn write_pump(conn: Arc<Connector>, write_rx: Receiver<Bytes>, events: Sender<ConnEvent>) {
    loop {
        let mut close = conn.close_rx.recv_async().fuse();
        let mut next = write_rx.recv_async().fuse();

        futures::select! {
            _ = close => break,
            msg = next => {
                let Ok(bytes) = msg else { break };
                let frame = match conn.frame_queued(bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(conn_id = conn.conn_id, error = %e, "dropping unencodable queued frame");
                        continue;
                    }
                };
                match conn.send_frame(frame).await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => {
                        debug!(conn_id = conn.conn_id, error = %e, "write pump: socket down");
                        let _ = events.send(ConnEvent::Down { conn_id: conn.conn_id });
                        break;
                    }
                    Err(e) => {
                        warn!(conn_id = conn.conn_id, error = %e, "write pump: dropping frame");
                    }
                }
            }
        }
    }
}

/// Reads frames under the lazily re-armed deadline and hands them to the
/// dispatch worker. Timeouts are not fatal; EOF and fatal transport errors
/// emit one down event and stop the pump.
async fn read_pump(conn: Arc<Connector>, dispatch_tx: Sender<WireFrame>, events: Sender<ConnEvent>) {
    loop {
        let read = conn.read().fuse();
        futures::pin_mut!(read);
        let mut close = conn.close_rx.recv_async().fuse();

        let res = futures::select! {
            _ = close => {
                // Covers direct `close()` calls too: the container reaps the
                // map entry if it still holds one.
                let _ = events.send(ConnEvent::Down { conn_id: conn.conn_id });
                break;
            }
            res = read => res,
        };

        match res {
            Ok(Some(frame)) => match dispatch_tx.try_send(frame) {
                Ok(()) => {}
                Err(flume::TrySendError::Full(_)) => {
                    warn!(conn_id = conn.conn_id, "dispatch queue full, dropping frame");
                }
                Err(flume::TrySendError::Disconnected(_)) => break,
            },
            Ok(None) => {
                debug!(conn_id = conn.conn_id, "read pump: end of stream");
                let _ = events.send(ConnEvent::Down { conn_id: conn.conn_id });
                break;
            }
            Err(e) if e.is_timeout() => {}
            Err(e) if e.is_fatal() => {
                debug!(conn_id = conn.conn_id, error = %e, "read pump: socket down");
                let _ = events.send(ConnEvent::Down { conn_id: conn.conn_id });
                break;
            }
            Err(e) => {
                warn!(conn_id = conn.conn_id, error = %e, "read pump: transient error, continuing");
            }
        }
    }
}

/// Decodes frames and invokes the host read callback, panic-guarded so a
/// faulty handler cannot take the session down with it.
async fn dispatch_worker(
    conn: Arc<Connector>,
    dispatch_rx: Receiver<WireFrame>,
    on_read: Option<Arc<DispatchFn>>,
) {
    while let Ok(frame) = dispatch_rx.recv_async().await {
        if conn.is_closed() {
            break;
        }
        let Some(cb) = on_read.as_ref() else { continue };

        match Payload::decode(frame, conn.message_type) {
            Ok(payload) => {
                let guarded = catch_unwind(AssertUnwindSafe(|| {
                    cb(conn.conn_id, conn.message_type, payload);
                }));
                if guarded.is_err() {
                    error!(conn_id = conn.conn_id, "read handler panicked");
                }
            }
            Err(e) => {
                warn!(conn_id = conn.conn_id, error = %e, "dropping undecodable frame");
            }
        }
    }
}
