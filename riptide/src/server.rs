//! Server: process-lifetime owner of the listen socket and the registries.
//!
//! The server multiplexes upgrade requests by path: exact matches hit a
//! router, `{groupId}` patterns hit a dynamic registry, anything else is
//! turned away with a 404 before the upgrade completes. Each accepted
//! session runs its registry's `entry` on its own task; the task lives
//! exactly as long as the connection.

use crate::ws::split_ws;
use dashmap::DashMap;
use flume::{Receiver, Sender};
use riptide_core::config::{GroupConf, RouterConf};
use riptide_core::dynamic::Dynamic;
use riptide_core::error::{Result, RiptideError};
use riptide_core::router::Router;
use riptide_core::uri::parse_query;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

enum UpgradeTarget {
    Router(Arc<Router>),
    Dynamic(Arc<Dynamic>),
}

/// WebSocket fan-out server.
///
/// ```no_run
/// use riptide::{MsgData, RouterConf, Server};
///
/// # async fn example() -> riptide::Result<()> {
/// let server = Server::bind("127.0.0.1:8080").await?;
/// server.register_router(RouterConf::new("/chat").on_read(|router, conn_id, _mt, payload| {
///     // Echo every frame back through the sender's shard.
///     let router = router.clone();
///     tokio::spawn(async move {
///         let _ = router.cast(MsgData::new(payload).with_conn_ids([conn_id])).await;
///     });
/// }))?;
/// server.serve().await
/// # }
/// ```
pub struct Server {
    addr: SocketAddr,
    listener: parking_lot::Mutex<Option<TcpListener>>,
    routers: DashMap<String, Arc<Router>>,
    dynamics: DashMap<String, Arc<Dynamic>>,
    close_tx: parking_lot::Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
}

impl Server {
    /// Bind the listen socket. Registration can happen before or after
    /// `serve`; port 0 picks a free port (see [`Server::local_addr`]).
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (close_tx, close_rx) = flume::bounded(1);

        Ok(Arc::new(Self {
            addr,
            listener: parking_lot::Mutex::new(Some(listener)),
            routers: DashMap::new(),
            dynamics: DashMap::new(),
            close_tx: parking_lot::Mutex::new(Some(close_tx)),
            close_rx,
        }))
    }

    /// The bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Register a persistent router at its exact path.
    pub fn register_router(&self, conf: RouterConf) -> Result<Arc<Router>> {
        let uri = conf.uri.clone();
        if self.dynamics.contains_key(&uri) {
            return Err(RiptideError::already_exists(uri));
        }
        match self.routers.entry(uri.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RiptideError::already_exists(uri)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let router = Router::new(conf)?;
                slot.insert(router.clone());
                info!(uri = %uri, "router registered");
                Ok(router)
            }
        }
    }

    /// Register a dynamic room registry; the upgrade pattern becomes
    /// `<prefix>/{groupId}`.
    pub fn register_dynamic(&self, conf: GroupConf) -> Result<Arc<Dynamic>> {
        let uri = conf.uri.clone();
        if self.routers.contains_key(&uri) {
            return Err(RiptideError::already_exists(uri));
        }
        match self.dynamics.entry(uri.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RiptideError::already_exists(uri)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let dynamic = Dynamic::new(conf)?;
                slot.insert(dynamic.clone());
                info!(uri = %uri, "dynamic registry registered");
                Ok(dynamic)
            }
        }
    }

    pub fn get_router(&self, uri: &str) -> Result<Arc<Router>> {
        self.routers
            .get(uri)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RiptideError::not_found(uri))
    }

    pub fn get_dynamic(&self, uri: &str) -> Result<Arc<Dynamic>> {
        self.dynamics
            .get(uri)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RiptideError::not_found(uri))
    }

    /// Accept loop. Returns after [`Server::quit`]. Takes an `Arc` clone so
    /// per-connection tasks can hold the registries.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or(RiptideError::InvalidParameter("server is already serving"))?;
        info!(addr = %self.addr, "riptide server listening");

        loop {
            tokio::select! {
                _ = self.close_rx.recv_async() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(handle_socket(server, stream, peer));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
            }
        }
        Ok(())
    }

    /// Stop accepting and cascade teardown: every router, dynamic, group
    /// and connection is force-closed.
    pub async fn quit(&self) {
        self.close_tx.lock().take();

        let routers: Vec<Arc<Router>> = self.routers.iter().map(|e| e.value().clone()).collect();
        self.routers.clear();
        for router in routers {
            router.quit().await;
        }

        let dynamics: Vec<Arc<Dynamic>> = self.dynamics.iter().map(|e| e.value().clone()).collect();
        self.dynamics.clear();
        for dynamic in dynamics {
            dynamic.quit().await;
        }
        info!(addr = %self.addr, "riptide server stopped");
    }

    fn resolve(&self, path: &str) -> Option<(UpgradeTarget, HashMap<String, String>)> {
        if let Some(router) = self.routers.get(path) {
            return Some((UpgradeTarget::Router(router.value().clone()), HashMap::new()));
        }
        for entry in self.dynamics.iter() {
            if let Some(uri_paras) = entry.value().pattern().match_path(path) {
                return Some((UpgradeTarget::Dynamic(entry.value().clone()), uri_paras));
            }
        }
        None
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.addr)
            .field("routers", &self.routers.len())
            .field("dynamics", &self.dynamics.len())
            .finish_non_exhaustive()
    }
}

/// Upgrade one accepted stream and run its registry entry until the
/// connection dies.
async fn handle_socket(server: Arc<Server>, stream: TcpStream, peer: SocketAddr) {
    let mut resolved: Option<(UpgradeTarget, HashMap<String, String>, HashMap<String, String>)> =
        None;

    let callback = |req: &Request, response: Response| {
        let path = req.uri().path();
        let query = req.uri().query().unwrap_or("");
        match server.resolve(path) {
            Some((target, uri_paras)) => {
                resolved = Some((target, uri_paras, parse_query(query)));
                Ok(response)
            }
            None => {
                let mut reject = ErrorResponse::new(Some("no websocket route".to_owned()));
                *reject.status_mut() = StatusCode::NOT_FOUND;
                Err(reject)
            }
        }
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };
    let Some((target, uri_paras, query_paras)) = resolved else {
        return;
    };

    let (sink, stream) = split_ws(ws);
    let outcome = match target {
        UpgradeTarget::Router(router) => {
            router
                .entry(Box::new(sink), Box::new(stream), uri_paras, query_paras)
                .await
        }
        UpgradeTarget::Dynamic(dynamic) => {
            dynamic
                .entry(Box::new(sink), Box::new(stream), uri_paras, query_paras)
                .await
        }
    };
    if let Err(e) = outcome {
        debug!(%peer, error = %e, "session rejected");
    }
}
