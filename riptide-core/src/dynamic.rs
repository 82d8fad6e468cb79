//! Dynamic (room registry)
//!
//! A dynamic registry maps dense group ids to rooms under one URI prefix;
//! the upgrade pattern always ends in `{groupId}`. Rooms are created either
//! lazily on first connection or strictly by the host, per the conf's
//! create mode, and removal is always explicit.

use crate::config::{GroupConf, GroupCreateMode};
use crate::error::{Result, RiptideError};
use crate::group::Group;
use crate::message::MsgData;
use crate::uri::{UriPattern, GROUP_ID_PARA};
use crate::wire::{BoxWireSink, BoxWireStream};

use hashbrown::HashMap;
use parking_lot::RwLock;
use std::collections::HashMap as StdHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Registry of groups for one URI prefix.
pub struct Dynamic {
    conf: Arc<GroupConf>,
    pattern: UriPattern,
    weak_self: Weak<Dynamic>,

    groups: RwLock<HashMap<i64, Arc<Group>>>,
    conn_id_seq: AtomicU64,
    dirty: AtomicU64,
}

impl Dynamic {
    /// Validate the conf and derive the upgrade pattern
    /// (`<prefix>/{groupId}`).
    pub fn new(conf: GroupConf) -> Result<Arc<Self>> {
        conf.validate()?;
        let pattern = UriPattern::parse(&format!(
            "{}/{{{GROUP_ID_PARA}}}",
            conf.uri.trim_end_matches('/')
        ))?;

        Ok(Arc::new_cyclic(|weak: &Weak<Dynamic>| Self {
            conf: Arc::new(conf),
            pattern,
            weak_self: weak.clone(),
            groups: RwLock::new(HashMap::new()),
            conn_id_seq: AtomicU64::new(0),
            dirty: AtomicU64::new(0),
        }))
    }

    /// The registered prefix, e.g. `/room`.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.conf.uri
    }

    /// The derived upgrade pattern, e.g. `/room/{groupId}`.
    #[must_use]
    pub fn pattern(&self) -> &UriPattern {
        &self.pattern
    }

    #[must_use]
    pub fn conf(&self) -> &GroupConf {
        &self.conf
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    /// Pre-create a group. Required in `Preregistered` mode, optional in
    /// `OnDemand` mode.
    pub fn create_group(&self, group_id: i64) -> Result<Arc<Group>> {
        if group_id <= 0 {
            return Err(RiptideError::InvalidParameter("group id must be positive"));
        }
        let mut groups = self.groups.write();
        if groups.contains_key(&group_id) {
            return Err(RiptideError::already_exists(format!("group {group_id}")));
        }
        let group = Group::new(group_id, self.conf.clone());
        groups.insert(group_id, group.clone());
        Ok(group)
    }

    pub fn get_group(&self, group_id: i64) -> Result<Arc<Group>> {
        if group_id <= 0 {
            return Err(RiptideError::InvalidParameter("group id must be positive"));
        }
        self.groups
            .read()
            .get(&group_id)
            .cloned()
            .ok_or_else(|| RiptideError::not_found(format!("group {group_id}")))
    }

    /// Quit the group (terminating its pump and force-closing every member)
    /// and drop the registry entry.
    pub async fn remove_group(&self, group_id: i64) -> Result<()> {
        if group_id <= 0 {
            return Err(RiptideError::InvalidParameter("group id must be positive"));
        }
        let group = self
            .groups
            .write()
            .remove(&group_id)
            .ok_or_else(|| RiptideError::not_found(format!("group {group_id}")))?;

        self.dirty.fetch_add(1, Ordering::AcqRel);
        group.quit().await;
        debug!(group_id, "group removed");

        self.maybe_reclaim();
        Ok(())
    }

    /// Broadcast into one group.
    pub async fn cast(&self, group_id: i64, msg: MsgData) -> Result<()> {
        self.get_group(group_id)?.cast(msg).await
    }

    /// Post-upgrade handler. Verifies the group id, resolves the room per
    /// the create mode, installs the session, then suspends until the
    /// connection dies.
    pub async fn entry(
        &self,
        sink: BoxWireSink,
        stream: BoxWireStream,
        uri_paras: StdHashMap<String, String>,
        query_paras: StdHashMap<String, String>,
    ) -> Result<()> {
        let group_id = uri_paras
            .get(GROUP_ID_PARA)
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|id| *id > 0)
            .ok_or(RiptideError::InvalidParameter(
                "missing or non-positive groupId path variable",
            ))?;

        if let Some(verify) = &self.conf.verify_group {
            let this = self.weak_self.upgrade().ok_or(RiptideError::Closed)?;
            verify(&this, group_id).map_err(|e| {
                warn!(group_id, error = %e, "group verification rejected the connection");
                e
            })?;
        }

        let conn_id = self.gen_conn_id()?;
        let group = self.resolve_group(group_id)?;

        debug!(uri = %self.conf.uri, group_id, conn_id, "dynamic entry");
        let conn = group.add_conn(conn_id, sink, stream, uri_paras, query_paras)?;
        conn.wait_closed().await;
        Ok(())
    }

    /// Quit every group and clear the registry.
    pub async fn quit(&self) {
        let drained: Vec<Arc<Group>> = {
            let mut groups = self.groups.write();
            groups.drain().map(|(_, group)| group).collect()
        };
        for group in drained {
            group.quit().await;
        }
        self.dirty.store(0, Ordering::Release);
    }

    fn resolve_group(&self, group_id: i64) -> Result<Arc<Group>> {
        match self.conf.create_mode {
            GroupCreateMode::Preregistered => self.get_group(group_id),
            GroupCreateMode::OnDemand => match self.get_group(group_id) {
                Ok(group) => Ok(group),
                Err(RiptideError::NotFound(_)) => match self.create_group(group_id) {
                    Ok(group) => Ok(group),
                    // Raced another entry; the winner's group is in the map.
                    Err(RiptideError::AlreadyExists(_)) => self.get_group(group_id),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            },
        }
    }

    fn gen_conn_id(&self) -> Result<u64> {
        crate::config::next_conn_id(&self.conn_id_seq, self.conf.on_gen_conn_id.as_ref())
    }

    fn maybe_reclaim(&self) {
        let mut groups = self.groups.write();
        if groups.is_empty() || rand::random::<f64>() < crate::bucket::RECLAIM_SAMPLE_RATE {
            let rebuilt: HashMap<i64, Arc<Group>> = groups.drain().collect();
            *groups = rebuilt;
            self.dirty.store(0, Ordering::Release);
        }
    }

}

impl std::fmt::Debug for Dynamic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dynamic")
            .field("uri", &self.conf.uri)
            .field("groups", &self.group_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_appends_group_id() {
        let dynamic = Dynamic::new(GroupConf::new("/room")).unwrap();
        assert_eq!(dynamic.pattern().raw(), "/room/{groupId}");

        let paras = dynamic.pattern().match_path("/room/42").unwrap();
        assert_eq!(paras.get(GROUP_ID_PARA).map(String::as_str), Some("42"));
    }

    #[tokio::test]
    async fn explicit_group_lifecycle() {
        let dynamic = Dynamic::new(GroupConf::new("/room")).unwrap();
        assert!(dynamic.get_group(42).is_err());

        let group = dynamic.create_group(42).unwrap();
        assert_eq!(group.group_id(), 42);
        assert!(dynamic.create_group(42).is_err());
        assert_eq!(dynamic.group_count(), 1);

        dynamic.remove_group(42).await.unwrap();
        assert!(dynamic.get_group(42).is_err());
        assert!(matches!(
            dynamic.remove_group(42).await,
            Err(RiptideError::NotFound(_))
        ));
    }

    #[test]
    fn group_id_validation() {
        let dynamic = Dynamic::new(GroupConf::new("/room")).unwrap();
        assert!(dynamic.create_group(0).is_err());
        assert!(dynamic.get_group(-3).is_err());
    }
}
