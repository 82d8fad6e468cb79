//! Registration-time configuration.
//!
//! Hosts describe a router or a dynamic room registry with a conf struct,
//! chain `with_*` builders over the defaults, attach callbacks, and hand the
//! result to the server. Confs are validated once at registration and shared
//! immutably (`Arc`) by every shard/group built from them.

use crate::dynamic::Dynamic;
use crate::error::{Result, RiptideError};
use crate::group::Group;
use crate::message::{MessageType, Payload};
use crate::router::Router;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default shard count per router.
pub const DEFAULT_BUCKETS: usize = 32;
/// Default read deadline.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Default write deadline.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default per-connector write queue depth.
pub const DEFAULT_WRITE_QUEUE_CAP: usize = 1024;
/// Default per-shard/per-group broadcast queue depth.
pub const DEFAULT_CAST_QUEUE_CAP: usize = 1024;
/// Default read-dispatch queue depth per connector.
pub const DEFAULT_DISPATCH_QUEUE_CAP: usize = 1024;
/// Default interval of the background map-reclaim ticker.
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(300);

/// Host-provided connection id generator. Must never return 0.
pub type GenConnIdFn = dyn Fn() -> u64 + Send + Sync;

/// Assign the next connection id for a registry: the host generator wins
/// when installed (a returned 0 is rejected), otherwise the registry's
/// atomic counter hands out ids from 1, skipping 0 on wraparound.
pub(crate) fn next_conn_id(
    seq: &std::sync::atomic::AtomicU64,
    generator: Option<&Arc<GenConnIdFn>>,
) -> Result<u64> {
    use std::sync::atomic::Ordering;

    if let Some(generator) = generator {
        let id = generator();
        if id == 0 {
            return Err(RiptideError::InvalidParameter(
                "host conn id generator returned 0",
            ));
        }
        return Ok(id);
    }
    let mut id = seq.fetch_add(1, Ordering::AcqRel) + 1;
    if id == 0 {
        id = seq.fetch_add(1, Ordering::AcqRel) + 1;
    }
    Ok(id)
}

/// Router lifecycle callback: `(router, conn_id)`.
pub type RouterLifeFn = dyn Fn(&Arc<Router>, u64) + Send + Sync;

/// Router read callback: `(router, conn_id, message_type, payload)`.
pub type RouterReadFn = dyn Fn(&Arc<Router>, u64, MessageType, Payload) + Send + Sync;

/// Group admission check: `(dynamic, group_id)`; an error aborts the entry.
pub type VerifyGroupFn = dyn Fn(&Arc<Dynamic>, i64) -> Result<()> + Send + Sync;

/// Group lifecycle callback: `(group, group_id, conn_id)`.
pub type GroupLifeFn = dyn Fn(&Arc<Group>, i64, u64) + Send + Sync;

/// Group read callback: `(group, group_id, conn_id, message_type, payload)`.
pub type GroupReadFn = dyn Fn(&Arc<Group>, i64, u64, MessageType, Payload) + Send + Sync;

/// How a dynamic registry materializes groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupCreateMode {
    /// Create the group lazily on the first entering connection.
    #[default]
    OnDemand,
    /// Require an explicit `create_group` before connections are admitted.
    Preregistered,
}

/// Configuration for a persistent sharded router.
///
/// ```
/// use riptide_core::config::RouterConf;
/// use riptide_core::message::MessageType;
/// use std::time::Duration;
///
/// let conf = RouterConf::new("/chat")
///     .with_buckets(8)
///     .with_message_type(MessageType::Json)
///     .with_read_timeout(Duration::from_secs(60))
///     .on_connected(|_router, conn_id| println!("conn {conn_id} up"));
/// ```
#[derive(Clone)]
pub struct RouterConf {
    /// Exact upgrade path, e.g. `/chat`.
    pub uri: String,
    /// Shard count; fixed after construction.
    pub buckets: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub message_type: MessageType,
    pub write_queue_cap: usize,
    pub cast_queue_cap: usize,
    pub dispatch_queue_cap: usize,
    pub reclaim_interval: Duration,
    pub on_gen_conn_id: Option<Arc<GenConnIdFn>>,
    pub on_connected: Option<Arc<RouterLifeFn>>,
    pub on_closed: Option<Arc<RouterLifeFn>>,
    pub on_read: Option<Arc<RouterReadFn>>,
}

impl RouterConf {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            buckets: DEFAULT_BUCKETS,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            message_type: MessageType::default(),
            write_queue_cap: DEFAULT_WRITE_QUEUE_CAP,
            cast_queue_cap: DEFAULT_CAST_QUEUE_CAP,
            dispatch_queue_cap: DEFAULT_DISPATCH_QUEUE_CAP,
            reclaim_interval: DEFAULT_RECLAIM_INTERVAL,
            on_gen_conn_id: None,
            on_connected: None,
            on_closed: None,
            on_read: None,
        }
    }

    #[must_use]
    pub fn with_buckets(mut self, buckets: usize) -> Self {
        self.buckets = buckets;
        self
    }

    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    #[must_use]
    pub fn with_write_queue_cap(mut self, cap: usize) -> Self {
        self.write_queue_cap = cap;
        self
    }

    #[must_use]
    pub fn with_cast_queue_cap(mut self, cap: usize) -> Self {
        self.cast_queue_cap = cap;
        self
    }

    #[must_use]
    pub fn with_dispatch_queue_cap(mut self, cap: usize) -> Self {
        self.dispatch_queue_cap = cap;
        self
    }

    #[must_use]
    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    #[must_use]
    pub fn on_gen_conn_id(mut self, f: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.on_gen_conn_id = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_connected(mut self, f: impl Fn(&Arc<Router>, u64) + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_closed(mut self, f: impl Fn(&Arc<Router>, u64) + Send + Sync + 'static) -> Self {
        self.on_closed = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_read(
        mut self,
        f: impl Fn(&Arc<Router>, u64, MessageType, Payload) + Send + Sync + 'static,
    ) -> Self {
        self.on_read = Some(Arc::new(f));
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.uri.starts_with('/') || self.uri.len() < 2 {
            return Err(RiptideError::InvalidParameter(
                "router uri must start with '/' and be non-empty",
            ));
        }
        if self.buckets == 0 {
            return Err(RiptideError::InvalidParameter(
                "router needs at least one bucket",
            ));
        }
        validate_common(
            self.read_timeout,
            self.write_timeout,
            self.write_queue_cap,
            self.cast_queue_cap,
            self.dispatch_queue_cap,
        )
    }
}

impl fmt::Debug for RouterConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterConf")
            .field("uri", &self.uri)
            .field("buckets", &self.buckets)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("message_type", &self.message_type)
            .field("has_on_read", &self.on_read.is_some())
            .finish_non_exhaustive()
    }
}

/// Configuration for a dynamic room registry.
///
/// `uri` is the prefix; the registry appends `/{groupId}` when registering
/// its upgrade pattern.
#[derive(Clone)]
pub struct GroupConf {
    /// Upgrade path prefix, e.g. `/room`.
    pub uri: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub message_type: MessageType,
    pub write_queue_cap: usize,
    pub cast_queue_cap: usize,
    pub dispatch_queue_cap: usize,
    pub create_mode: GroupCreateMode,
    pub on_gen_conn_id: Option<Arc<GenConnIdFn>>,
    pub verify_group: Option<Arc<VerifyGroupFn>>,
    pub on_connected: Option<Arc<GroupLifeFn>>,
    pub on_closed: Option<Arc<GroupLifeFn>>,
    pub on_read: Option<Arc<GroupReadFn>>,
}

impl GroupConf {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            message_type: MessageType::default(),
            write_queue_cap: DEFAULT_WRITE_QUEUE_CAP,
            cast_queue_cap: DEFAULT_CAST_QUEUE_CAP,
            dispatch_queue_cap: DEFAULT_DISPATCH_QUEUE_CAP,
            create_mode: GroupCreateMode::default(),
            on_gen_conn_id: None,
            verify_group: None,
            on_connected: None,
            on_closed: None,
            on_read: None,
        }
    }

    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    #[must_use]
    pub fn with_write_queue_cap(mut self, cap: usize) -> Self {
        self.write_queue_cap = cap;
        self
    }

    #[must_use]
    pub fn with_cast_queue_cap(mut self, cap: usize) -> Self {
        self.cast_queue_cap = cap;
        self
    }

    #[must_use]
    pub fn with_dispatch_queue_cap(mut self, cap: usize) -> Self {
        self.dispatch_queue_cap = cap;
        self
    }

    #[must_use]
    pub fn with_create_mode(mut self, mode: GroupCreateMode) -> Self {
        self.create_mode = mode;
        self
    }

    #[must_use]
    pub fn on_gen_conn_id(mut self, f: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.on_gen_conn_id = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn verify_group(
        mut self,
        f: impl Fn(&Arc<Dynamic>, i64) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.verify_group = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_connected(
        mut self,
        f: impl Fn(&Arc<Group>, i64, u64) + Send + Sync + 'static,
    ) -> Self {
        self.on_connected = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_closed(mut self, f: impl Fn(&Arc<Group>, i64, u64) + Send + Sync + 'static) -> Self {
        self.on_closed = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_read(
        mut self,
        f: impl Fn(&Arc<Group>, i64, u64, MessageType, Payload) + Send + Sync + 'static,
    ) -> Self {
        self.on_read = Some(Arc::new(f));
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.uri.starts_with('/') || self.uri.len() < 2 {
            return Err(RiptideError::InvalidParameter(
                "dynamic uri prefix must start with '/' and be non-empty",
            ));
        }
        validate_common(
            self.read_timeout,
            self.write_timeout,
            self.write_queue_cap,
            self.cast_queue_cap,
            self.dispatch_queue_cap,
        )
    }
}

impl fmt::Debug for GroupConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupConf")
            .field("uri", &self.uri)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("message_type", &self.message_type)
            .field("create_mode", &self.create_mode)
            .field("has_verify_group", &self.verify_group.is_some())
            .finish_non_exhaustive()
    }
}

fn validate_common(
    read_timeout: Duration,
    write_timeout: Duration,
    write_queue_cap: usize,
    cast_queue_cap: usize,
    dispatch_queue_cap: usize,
) -> Result<()> {
    if read_timeout.is_zero() || write_timeout.is_zero() {
        return Err(RiptideError::InvalidParameter(
            "read/write timeouts must be non-zero",
        ));
    }
    if write_queue_cap == 0 || cast_queue_cap == 0 || dispatch_queue_cap == 0 {
        return Err(RiptideError::InvalidParameter(
            "queue capacities must be non-zero",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_defaults() {
        let conf = RouterConf::new("/chat");
        assert_eq!(conf.buckets, DEFAULT_BUCKETS);
        assert_eq!(conf.read_timeout, Duration::from_secs(30));
        assert_eq!(conf.write_timeout, Duration::from_secs(10));
        assert_eq!(conf.write_queue_cap, 1024);
        assert_eq!(conf.message_type, MessageType::Octet);
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn router_builder_chain() {
        let conf = RouterConf::new("/feed")
            .with_buckets(4)
            .with_message_type(MessageType::Json)
            .with_write_queue_cap(16)
            .on_gen_conn_id(|| 99);
        assert_eq!(conf.buckets, 4);
        assert_eq!(conf.message_type, MessageType::Json);
        assert_eq!(conf.write_queue_cap, 16);
        assert_eq!((conf.on_gen_conn_id.unwrap())(), 99);
    }

    #[test]
    fn router_validation() {
        assert!(RouterConf::new("chat").validate().is_err());
        assert!(RouterConf::new("/").validate().is_err());
        assert!(RouterConf::new("/chat").with_buckets(0).validate().is_err());
        assert!(RouterConf::new("/chat")
            .with_read_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(RouterConf::new("/chat")
            .with_cast_queue_cap(0)
            .validate()
            .is_err());
    }

    #[test]
    fn group_defaults_and_mode() {
        let conf = GroupConf::new("/room");
        assert_eq!(conf.create_mode, GroupCreateMode::OnDemand);
        assert!(conf.validate().is_ok());

        let conf = conf.with_create_mode(GroupCreateMode::Preregistered);
        assert_eq!(conf.create_mode, GroupCreateMode::Preregistered);
    }
}
