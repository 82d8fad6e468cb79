//! # Riptide
//!
//! A multi-tenant WebSocket fan-out server.
//!
//! ## Architecture
//!
//! Riptide is structured as a fan-out core with a thin WebSocket surface:
//!
//! - **`riptide-core`**: connectors (split read/write pumps), sharded
//!   routers, dynamic room registries, wire traits, inproc transport
//! - **`riptide`**: public API surface (this crate) — the listen/upgrade
//!   server, tungstenite adapters and the dialer client
//!
//! ## Quick Start
//!
//! ### Persistent router
//!
//! ```rust,no_run
//! use riptide::{MsgData, RouterConf, Server};
//!
//! # async fn example() -> riptide::Result<()> {
//! let server = Server::bind("0.0.0.0:8080").await?;
//!
//! // Every frame received on /chat is broadcast to all members.
//! server.register_router(RouterConf::new("/chat").on_read(|router, _conn_id, _mt, payload| {
//!     let router = router.clone();
//!     tokio::spawn(async move {
//!         let _ = router.cast(MsgData::new(payload)).await;
//!     });
//! }))?;
//!
//! server.serve().await
//! # }
//! ```
//!
//! ### Dynamic rooms
//!
//! ```rust,no_run
//! use riptide::{GroupConf, MsgData, Server};
//!
//! # async fn example() -> riptide::Result<()> {
//! let server = Server::bind("0.0.0.0:8080").await?;
//!
//! // Clients join ws://host/room/<id>; rooms appear on first join.
//! server.register_dynamic(GroupConf::new("/room").on_read(
//!     |group, _group_id, _conn_id, _mt, payload| {
//!         // Relay every frame to the whole room.
//!         let group = group.clone();
//!         tokio::spawn(async move {
//!             let _ = group.cast(MsgData::new(payload)).await;
//!         });
//!     },
//! ))?;
//!
//! server.serve().await
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! Every connection runs one read pump, one write pump and one dispatch
//! worker; every shard and room runs one cast pump. All communication is
//! over bounded channels, host callbacks run outside core locks and under
//! panic guards, and teardown cascades server → registries → shards/rooms
//! → connections.

#![warn(clippy::all)]
// Allow some pedantic patterns
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]

// Re-export core types
pub use bytes::Bytes;
pub use riptide_core::backoff::BackoffState;
pub use riptide_core::bucket::Bucket;
pub use riptide_core::config::{GroupConf, GroupCreateMode, RouterConf};
pub use riptide_core::connector::Connector;
pub use riptide_core::dynamic::Dynamic;
pub use riptide_core::error::{Result, RiptideError};
pub use riptide_core::group::Group;
pub use riptide_core::inproc;
pub use riptide_core::message::{MessageType, MsgData, Payload};
pub use riptide_core::props::{PropBag, PropValue};
pub use riptide_core::router::Router;
pub use riptide_core::uri::{UriPattern, BUCKET_ID_PARA, GROUP_ID_PARA};
pub use riptide_core::wire::{WireFrame, WireSink, WireStream};

pub mod client;
pub mod server;
pub mod ws;

pub use client::{Client, ClientConf};
pub use server::Server;

/// A small prelude for hosts.
pub mod prelude {
    pub use crate::client::{Client, ClientConf};
    pub use crate::server::Server;
    pub use crate::ws::{split_ws, WsSink, WsStream};
    pub use riptide_core::prelude::*;
}
