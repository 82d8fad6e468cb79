//! Group (one room of a dynamic registry)
//!
//! A group is a broadcast domain: every member shares the cast queue, and a
//! secondary owner-id index supports addressing members by host identity
//! (user id) instead of conn id. Member map and owner index live under one
//! lock so they can never disagree.

use crate::config::GroupConf;
use crate::connector::{run_guarded, ConnEvent, ConnSettings, Connector, DispatchFn};
use crate::error::{Result, RiptideError};
use crate::message::MsgData;
use crate::wire::{BoxWireSink, BoxWireStream};

use flume::{Receiver, Sender};
use futures::FutureExt;
use hashbrown::HashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::collections::HashMap as StdHashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Primary member map plus the owner index, under one lock.
#[derive(Default)]
struct Members {
    conns: HashMap<u64, Arc<Connector>>,
    /// owner id -> conn id; every entry points at a live member whose owner
    /// id equals the key.
    owners: HashMap<u64, u64>,
}

/// A named room. All members share one broadcast domain.
pub struct Group {
    group_id: i64,
    conf: Arc<GroupConf>,
    weak_self: Weak<Group>,

    members: RwLock<Members>,
    connects: AtomicI64,
    dirty: AtomicU64,

    cast_tx: Sender<MsgData>,
    event_tx: Sender<ConnEvent>,
    closed: AtomicBool,
    close_tx: parking_lot::Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
}

impl Group {
    pub(crate) fn new(group_id: i64, conf: Arc<GroupConf>) -> Arc<Self> {
        let (cast_tx, cast_rx) = flume::bounded(conf.cast_queue_cap);
        let (event_tx, event_rx) = flume::unbounded();
        let (close_tx, close_rx) = flume::bounded(1);

        let group = Arc::new_cyclic(|weak: &Weak<Group>| Self {
            group_id,
            conf,
            weak_self: weak.clone(),
            members: RwLock::new(Members::default()),
            connects: AtomicI64::new(0),
            dirty: AtomicU64::new(0),
            cast_tx,
            event_tx,
            closed: AtomicBool::new(false),
            close_tx: parking_lot::Mutex::new(Some(close_tx)),
            close_rx,
        });

        tokio::spawn(run_pump(group.clone(), cast_rx, event_rx));
        group
    }

    #[must_use]
    pub fn group_id(&self) -> i64 {
        self.group_id
    }

    /// Live member count.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.connects.load(Ordering::Acquire)
    }

    /// Install an accepted session and start its pumps. The connected
    /// callback fires after the insertion lock drops.
    pub fn add_conn(
        &self,
        conn_id: u64,
        sink: BoxWireSink,
        stream: BoxWireStream,
        uri_paras: StdHashMap<String, String>,
        query_paras: StdHashMap<String, String>,
    ) -> Result<Arc<Connector>> {
        if conn_id == 0 {
            return Err(RiptideError::InvalidParameter("conn id must be non-zero"));
        }

        let on_read: Option<Arc<DispatchFn>> = self.conf.on_read.clone().map(|cb| {
            let weak = self.weak_self.clone();
            let group_id = self.group_id;
            Arc::new(move |conn_id: u64, message_type, payload| {
                if let Some(group) = weak.upgrade() {
                    cb(&group, group_id, conn_id, message_type, payload);
                }
            }) as Arc<DispatchFn>
        });

        let conn = Connector::spawn(
            conn_id,
            sink,
            stream,
            conn_settings(&self.conf),
            uri_paras,
            query_paras,
            self.event_tx.clone(),
            on_read,
        );

        {
            let mut members = self.members.write();
            if members.conns.contains_key(&conn_id) {
                drop(members);
                // Tear the just-spawned pumps down again.
                tokio::spawn(async move { conn.close().await });
                return Err(RiptideError::already_exists(format!("conn {conn_id}")));
            }
            members.conns.insert(conn_id, conn.clone());
        }
        self.connects.fetch_add(1, Ordering::AcqRel);

        if let (Some(cb), Some(group)) = (self.conf.on_connected.clone(), self.weak_self.upgrade())
        {
            run_guarded("connected", conn_id, || cb(&group, self.group_id, conn_id));
        }
        Ok(conn)
    }

    /// Remove and tear down one member, purging its owner binding. Map
    /// removal is the exactly-once gate for the closed callback.
    pub async fn close_conn(&self, conn_id: u64) -> Result<()> {
        if conn_id == 0 {
            return Err(RiptideError::InvalidParameter("conn id must be non-zero"));
        }

        let conn = {
            let mut members = self.members.write();
            let conn = members
                .conns
                .remove(&conn_id)
                .ok_or_else(|| RiptideError::not_found(format!("conn {conn_id}")))?;
            let owner = conn.owner_id();
            if owner != 0 && members.owners.get(&owner) == Some(&conn_id) {
                members.owners.remove(&owner);
            }
            conn
        };

        self.connects.fetch_sub(1, Ordering::AcqRel);
        self.dirty.fetch_add(1, Ordering::AcqRel);
        conn.close().await;

        if let (Some(cb), Some(group)) = (self.conf.on_closed.clone(), self.weak_self.upgrade()) {
            run_guarded("closed", conn_id, || cb(&group, self.group_id, conn_id));
        }

        self.maybe_reclaim();
        Ok(())
    }

    pub fn get_conn(&self, conn_id: u64) -> Result<Arc<Connector>> {
        if conn_id == 0 {
            return Err(RiptideError::InvalidParameter("conn id must be non-zero"));
        }
        self.members
            .read()
            .conns
            .get(&conn_id)
            .cloned()
            .ok_or_else(|| RiptideError::not_found(format!("conn {conn_id}")))
    }

    /// Resolve a member through the owner index.
    pub fn get_conn_by_owner_id(&self, owner_id: u64) -> Result<Arc<Connector>> {
        if owner_id == 0 {
            return Err(RiptideError::InvalidParameter("owner id must be non-zero"));
        }
        let members = self.members.read();
        members
            .owners
            .get(&owner_id)
            .and_then(|conn_id| members.conns.get(conn_id))
            .cloned()
            .ok_or_else(|| RiptideError::not_found(format!("owner {owner_id}")))
    }

    /// Bind a member to a host identity. Updates the connector and the
    /// owner index atomically under the group write lock; re-binding
    /// removes the prior index entry, and stealing an owner id from another
    /// member unsets that member's binding.
    pub fn set_owner(&self, conn_id: u64, owner_id: u64) -> Result<()> {
        if conn_id == 0 || owner_id == 0 {
            return Err(RiptideError::InvalidParameter(
                "conn id and owner id must be non-zero",
            ));
        }

        let mut members = self.members.write();
        let conn = members
            .conns
            .get(&conn_id)
            .cloned()
            .ok_or_else(|| RiptideError::not_found(format!("conn {conn_id}")))?;

        let prev = conn.owner_id();
        if prev != 0 && prev != owner_id && members.owners.get(&prev) == Some(&conn_id) {
            members.owners.remove(&prev);
        }
        if let Some(old_conn_id) = members.owners.insert(owner_id, conn_id) {
            if old_conn_id != conn_id {
                if let Some(old_conn) = members.conns.get(&old_conn_id) {
                    old_conn.set_owner_id(0);
                }
            }
        }
        conn.set_owner_id(owner_id);
        Ok(())
    }

    /// Enqueue a broadcast; suspends while the cast queue is at capacity.
    pub async fn cast(&self, msg: MsgData) -> Result<()> {
        msg.validate()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(RiptideError::Closed);
        }
        self.cast_tx
            .send_async(msg)
            .await
            .map_err(|_| RiptideError::Closed)
    }

    /// Terminate the pump and force-close every member.
    pub async fn quit(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_tx.lock().take();

        let drained: Vec<Arc<Connector>> = {
            let mut members = self.members.write();
            members.owners.clear();
            members.conns.drain().map(|(_, conn)| conn).collect()
        };
        self.connects.store(0, Ordering::Release);
        self.dirty.store(0, Ordering::Release);

        let group = self.weak_self.upgrade();
        for conn in drained {
            conn.close().await;
            if let (Some(cb), Some(group)) = (self.conf.on_closed.clone(), group.as_ref()) {
                run_guarded("closed", conn.conn_id(), || {
                    cb(group, self.group_id, conn.conn_id());
                });
            }
        }
    }

    /// Deliver one descriptor. Owner targets resolve through the index and
    /// merge with explicit conn ids; both empty means every member.
    async fn fan_out(&self, msg: MsgData) {
        let targets: Vec<Arc<Connector>> = {
            let members = self.members.read();
            if msg.conn_ids.is_empty() && msg.owner_ids.is_empty() {
                members.conns.values().cloned().collect()
            } else {
                let mut ids: SmallVec<[u64; 16]> = SmallVec::new();
                ids.extend(msg.conn_ids.iter().copied());
                for owner in &msg.owner_ids {
                    if let Some(conn_id) = members.owners.get(owner) {
                        ids.push(*conn_id);
                    }
                }
                ids.sort_unstable();
                ids.dedup();
                ids.iter()
                    .filter_map(|id| members.conns.get(id).cloned())
                    .collect()
            }
        };

        for conn in targets {
            let outcome = if msg.queue_write {
                match msg.payload.as_octet() {
                    Some(bytes) => conn.queue_write(bytes.clone()),
                    None => Err(RiptideError::InvalidParameter("queued payload not octet")),
                }
            } else {
                conn.write(msg.payload.clone()).await
            };
            if let Err(e) = outcome {
                warn!(
                    group_id = self.group_id,
                    conn_id = conn.conn_id(),
                    error = %e,
                    "cast delivery failed for one receiver"
                );
            }
        }
    }

    fn maybe_reclaim(&self) {
        if self.connects.load(Ordering::Acquire) <= 0
            || rand::random::<f64>() < crate::bucket::RECLAIM_SAMPLE_RATE
        {
            self.reclaim();
        }
    }

    fn reclaim(&self) {
        let mut members = self.members.write();
        let conns: HashMap<u64, Arc<Connector>> = members.conns.drain().collect();
        let owners: HashMap<u64, u64> = members.owners.drain().collect();
        members.conns = conns;
        members.owners = owners;
        self.dirty.store(0, Ordering::Release);
        debug!(group_id = self.group_id, "member map rebuilt");
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("group_id", &self.group_id)
            .field("connects", &self.total())
            .finish_non_exhaustive()
    }
}

fn conn_settings(conf: &GroupConf) -> ConnSettings {
    ConnSettings {
        read_timeout: conf.read_timeout,
        write_timeout: conf.write_timeout,
        message_type: conf.message_type,
        write_queue_cap: conf.write_queue_cap,
        dispatch_queue_cap: conf.dispatch_queue_cap,
    }
}

/// Room pump: drains casts in enqueue order and reaps members whose pumps
/// reported the socket down.
async fn run_pump(group: Arc<Group>, cast_rx: Receiver<MsgData>, event_rx: Receiver<ConnEvent>) {
    loop {
        let mut close = group.close_rx.recv_async().fuse();
        let mut cast = cast_rx.recv_async().fuse();
        let mut event = event_rx.recv_async().fuse();

        futures::select! {
            _ = close => break,
            msg = cast => {
                let Ok(msg) = msg else { break };
                group.fan_out(msg).await;
            }
            ev = event => {
                let Ok(ConnEvent::Down { conn_id }) = ev else { break };
                let _ = group.close_conn(conn_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inproc;

    fn join(group: &Arc<Group>, conn_id: u64) -> (Arc<Connector>, inproc::InprocPipe) {
        let (local, remote) = inproc::pair();
        let (sink, stream) = local.split();
        let conn = group
            .add_conn(
                conn_id,
                Box::new(sink),
                Box::new(stream),
                StdHashMap::new(),
                StdHashMap::new(),
            )
            .unwrap();
        (conn, remote)
    }

    #[tokio::test]
    async fn owner_rebinding_moves_the_index_entry() {
        let group = Group::new(42, Arc::new(GroupConf::new("/room")));
        let (conn, _peer) = join(&group, 5);

        group.set_owner(5, 7).unwrap();
        assert_eq!(group.get_conn_by_owner_id(7).unwrap().conn_id(), 5);

        group.set_owner(5, 9).unwrap();
        assert!(group.get_conn_by_owner_id(7).is_err());
        assert_eq!(group.get_conn_by_owner_id(9).unwrap().conn_id(), 5);
        assert_eq!(conn.owner_id(), 9);

        group.quit().await;
    }

    #[tokio::test]
    async fn stealing_an_owner_unbinds_the_previous_member() {
        let group = Group::new(1, Arc::new(GroupConf::new("/room")));
        let (first, _p1) = join(&group, 1);
        let (second, _p2) = join(&group, 2);

        group.set_owner(1, 77).unwrap();
        group.set_owner(2, 77).unwrap();

        assert_eq!(group.get_conn_by_owner_id(77).unwrap().conn_id(), 2);
        assert_eq!(first.owner_id(), 0);
        assert_eq!(second.owner_id(), 77);

        group.quit().await;
    }

    #[tokio::test]
    async fn cast_after_quit_fails_fast() {
        use bytes::Bytes;

        let group = Group::new(2, Arc::new(GroupConf::new("/room")));
        group.quit().await;
        let err = group
            .cast(MsgData::new(Bytes::from_static(b"late")))
            .await
            .unwrap_err();
        assert!(matches!(err, RiptideError::Closed));
    }

    #[tokio::test]
    async fn close_conn_purges_the_owner_index() {
        let group = Group::new(1, Arc::new(GroupConf::new("/room")));
        let (_conn, _peer) = join(&group, 3);

        group.set_owner(3, 11).unwrap();
        group.close_conn(3).await.unwrap();

        assert!(group.get_conn(3).is_err());
        assert!(group.get_conn_by_owner_id(11).is_err());
        assert_eq!(group.total(), 0);

        group.quit().await;
    }
}
