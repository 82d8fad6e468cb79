//! Riptide Core
//!
//! This crate contains the transport-agnostic fan-out building blocks:
//! - Split-pump session handle (`connector`)
//! - Sharded persistent registry (`router` + `bucket`)
//! - Room registry with owner index (`dynamic` + `group`)
//! - Wire traits + in-process transport (`wire`, `inproc`)
//! - Message model and broadcast descriptors (`message`)
//! - Registration configuration (`config`)
//! - Error types (`error`)
//!
//! The WebSocket surface (TCP listen, HTTP upgrade, tungstenite adapters,
//! dialer client) lives in the `riptide` facade crate.

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]

pub mod backoff;
pub mod bucket;
pub mod config;
pub mod connector;
pub mod dynamic;
pub mod error;
pub mod group;
pub mod inproc;
pub mod message;
pub mod props;
pub mod router;
pub mod uri;
pub mod wire;

// A small prelude for downstream crates and hosts.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::backoff::BackoffState;
    pub use crate::bucket::Bucket;
    pub use crate::config::{GroupConf, GroupCreateMode, RouterConf};
    pub use crate::connector::Connector;
    pub use crate::dynamic::Dynamic;
    pub use crate::error::{Result, RiptideError};
    pub use crate::group::Group;
    pub use crate::message::{MessageType, MsgData, Payload};
    pub use crate::props::{PropBag, PropValue};
    pub use crate::router::Router;
    pub use crate::wire::{BoxWireSink, BoxWireStream, WireFrame, WireSink, WireStream};
}
