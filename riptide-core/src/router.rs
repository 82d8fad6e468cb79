//! Router (persistent fan-out container)
//!
//! A router owns a fixed set of buckets; every accepted session is assigned
//! a process-unique conn id and lives in the shard `conn_id mod n` for its
//! whole life. The router itself holds no members: all membership and
//! fan-out state lives in the shards, which keeps the cast path free of any
//! router-wide lock.

use crate::bucket::Bucket;
use crate::config::RouterConf;
use crate::connector::Connector;
use crate::error::{Result, RiptideError};
use crate::message::MsgData;
use crate::uri::BUCKET_ID_PARA;
use crate::wire::{BoxWireSink, BoxWireStream};

use flume::{Receiver, Sender};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// A persistent sharded collection of connections under one URI.
pub struct Router {
    conf: Arc<RouterConf>,
    buckets: Vec<Arc<Bucket>>,
    conn_id_seq: AtomicU64,
    close_tx: parking_lot::Mutex<Option<Sender<()>>>,
}

impl Router {
    /// Validate the conf, build the shards and start the reclaim ticker.
    pub fn new(conf: RouterConf) -> Result<Arc<Self>> {
        conf.validate()?;
        let conf = Arc::new(conf);
        let (close_tx, close_rx) = flume::bounded(1);

        let router = Arc::new_cyclic(|weak: &Weak<Router>| {
            let buckets = (0..conf.buckets)
                .map(|id| Bucket::new(id, conf.clone(), weak.clone()))
                .collect();
            Self {
                conf: conf.clone(),
                buckets,
                conn_id_seq: AtomicU64::new(0),
                close_tx: parking_lot::Mutex::new(Some(close_tx)),
            }
        });

        tokio::spawn(reclaim_ticker(
            Arc::downgrade(&router),
            close_rx,
            conf.reclaim_interval,
        ));
        Ok(router)
    }

    /// The exact upgrade path this router is registered under.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.conf.uri
    }

    #[must_use]
    pub fn conf(&self) -> &RouterConf {
        &self.conf
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn bucket(&self, bucket_id: usize) -> Option<&Arc<Bucket>> {
        self.buckets.get(bucket_id)
    }

    /// The shard a conn id deterministically maps to.
    #[must_use]
    pub fn bucket_for(&self, conn_id: u64) -> &Arc<Bucket> {
        &self.buckets[(conn_id % self.buckets.len() as u64) as usize]
    }

    /// Live members across all shards.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.buckets.iter().map(|b| b.total()).sum()
    }

    /// Post-upgrade handler. Assigns a conn id, installs the session in its
    /// shard, then suspends until the connection dies: the upgraded socket
    /// lives exactly as long as this call.
    pub async fn entry(
        &self,
        sink: BoxWireSink,
        stream: BoxWireStream,
        uri_paras: HashMap<String, String>,
        query_paras: HashMap<String, String>,
    ) -> Result<()> {
        let conn_id = self.gen_conn_id()?;

        // An explicit bucketId query parameter overrides the hash pick.
        let bucket = match query_paras
            .get(BUCKET_ID_PARA)
            .and_then(|v| v.parse::<usize>().ok())
        {
            Some(id) if id < self.buckets.len() => &self.buckets[id],
            _ => self.bucket_for(conn_id),
        };

        debug!(uri = %self.conf.uri, conn_id, bucket_id = bucket.bucket_id(), "router entry");
        let conn = bucket.add_conn(conn_id, sink, stream, uri_paras, query_paras)?;
        conn.wait_closed().await;
        Ok(())
    }

    /// Broadcast to the shards (all, or the `bucket_ids` subset). Within a
    /// shard, casts are delivered in enqueue order; across shards the order
    /// is unspecified.
    pub async fn cast(&self, msg: MsgData) -> Result<()> {
        msg.validate()?;
        if msg.bucket_ids.is_empty() {
            for bucket in &self.buckets {
                bucket.broadcast(msg.clone()).await?;
            }
            return Ok(());
        }
        for &bucket_id in &msg.bucket_ids {
            let bucket = self
                .buckets
                .get(bucket_id)
                .ok_or(RiptideError::InvalidParameter("bucket id out of range"))?;
            bucket.broadcast(msg.clone()).await?;
        }
        Ok(())
    }

    pub fn get_connector(&self, conn_id: u64) -> Result<Arc<Connector>> {
        if conn_id == 0 {
            return Err(RiptideError::InvalidParameter("conn id must be non-zero"));
        }
        self.bucket_for(conn_id).get_conn(conn_id)
    }

    pub fn set_owner(&self, conn_id: u64, owner_id: u64) -> Result<()> {
        if owner_id == 0 {
            return Err(RiptideError::InvalidParameter("owner id must be non-zero"));
        }
        self.get_connector(conn_id)?.set_owner_id(owner_id);
        Ok(())
    }

    /// Walk the shards one at a time; each lookup is O(n) over that shard.
    pub fn get_conn_by_owner_id(&self, owner_id: u64) -> Result<Arc<Connector>> {
        if owner_id == 0 {
            return Err(RiptideError::InvalidParameter("owner id must be non-zero"));
        }
        for bucket in &self.buckets {
            if let Ok(conn) = bucket.get_conn_by_owner_id(owner_id) {
                return Ok(conn);
            }
        }
        Err(RiptideError::not_found(format!("owner {owner_id}")))
    }

    pub async fn close_conn(&self, conn_id: u64) -> Result<()> {
        if conn_id == 0 {
            return Err(RiptideError::InvalidParameter("conn id must be non-zero"));
        }
        self.bucket_for(conn_id).close_conn(conn_id).await
    }

    /// Stop the ticker and force-close every shard and member.
    pub async fn quit(&self) {
        self.close_tx.lock().take();
        for bucket in &self.buckets {
            bucket.quit().await;
        }
    }

    fn gen_conn_id(&self) -> Result<u64> {
        crate::config::next_conn_id(&self.conn_id_seq, self.conf.on_gen_conn_id.as_ref())
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("uri", &self.conf.uri)
            .field("buckets", &self.buckets.len())
            .field("total", &self.total())
            .finish_non_exhaustive()
    }
}

/// Rebuilds dirty shard maps on a fixed cadence, so long-lived routers
/// under churn do not pin peak-size hash tables forever.
async fn reclaim_ticker(router: Weak<Router>, close_rx: Receiver<()>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately; skip it.
    ticker.tick().await;

    loop {
        let mut close = close_rx.recv_async().fuse();
        let tick = ticker.tick().fuse();
        futures::pin_mut!(tick);

        futures::select! {
            _ = close => break,
            _ = tick => {
                let Some(router) = router.upgrade() else { break };
                for bucket in &router.buckets {
                    if bucket.dirty_ops() > 0 {
                        bucket.reclaim();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conn_ids_are_monotonic_from_one() {
        let router = Router::new(RouterConf::new("/t").with_buckets(2)).unwrap();
        assert_eq!(router.gen_conn_id().unwrap(), 1);
        assert_eq!(router.gen_conn_id().unwrap(), 2);
        assert_eq!(router.gen_conn_id().unwrap(), 3);
        router.quit().await;
    }

    #[tokio::test]
    async fn host_generator_wins_and_zero_is_rejected() {
        let router = Router::new(RouterConf::new("/t").on_gen_conn_id(|| 4242)).unwrap();
        assert_eq!(router.gen_conn_id().unwrap(), 4242);

        let bad = Router::new(RouterConf::new("/t").on_gen_conn_id(|| 0)).unwrap();
        assert!(bad.gen_conn_id().is_err());

        router.quit().await;
        bad.quit().await;
    }

    #[tokio::test]
    async fn shard_mapping_is_modulo() {
        let router = Router::new(RouterConf::new("/t").with_buckets(4)).unwrap();
        for conn_id in 1..=12u64 {
            assert_eq!(
                router.bucket_for(conn_id).bucket_id(),
                (conn_id % 4) as usize
            );
        }
        router.quit().await;
    }
}
