//! Per-uid observer registration tables

use std::collections::HashMap;
use std::io;

use warden_util::{ObserverId, Uid};

use crate::group::{GroupId, GroupKind, UsageGroup};

/// Observer registrations for one requesting uid. App-limit and
/// session-limit observers keep disjoint observer-id namespaces.
pub(crate) struct ObserverTable {
    uid: Uid,
    app_groups: HashMap<ObserverId, UsageGroup>,
    session_groups: HashMap<ObserverId, UsageGroup>,
}

impl ObserverTable {
    pub fn new(uid: Uid) -> Self {
        Self {
            uid,
            app_groups: HashMap::new(),
            session_groups: HashMap::new(),
        }
    }

    fn map(&self, kind: GroupKind) -> &HashMap<ObserverId, UsageGroup> {
        match kind {
            GroupKind::App => &self.app_groups,
            GroupKind::Session => &self.session_groups,
        }
    }

    fn map_mut(&mut self, kind: GroupKind) -> &mut HashMap<ObserverId, UsageGroup> {
        match kind {
            GroupKind::App => &mut self.app_groups,
            GroupKind::Session => &mut self.session_groups,
        }
    }

    pub fn get(&self, kind: GroupKind, observer_id: ObserverId) -> Option<&UsageGroup> {
        self.map(kind).get(&observer_id)
    }

    pub fn get_mut(&mut self, kind: GroupKind, observer_id: ObserverId) -> Option<&mut UsageGroup> {
        self.map_mut(kind).get_mut(&observer_id)
    }

    /// Full key of the group occupying `(kind, observer_id)`, if any.
    pub fn occupant(&self, kind: GroupKind, observer_id: ObserverId) -> Option<GroupId> {
        self.get(kind, observer_id).map(|g| g.id)
    }

    pub fn len(&self, kind: GroupKind) -> usize {
        self.map(kind).len()
    }

    pub fn insert(&mut self, group: UsageGroup) {
        self.map_mut(group.id.kind).insert(group.id.observer_id, group);
    }

    pub fn remove(&mut self, kind: GroupKind, observer_id: ObserverId) -> Option<UsageGroup> {
        self.map_mut(kind).remove(&observer_id)
    }

    pub fn is_empty(&self) -> bool {
        self.app_groups.is_empty() && self.session_groups.is_empty()
    }

    #[cfg(test)]
    pub fn groups(&self) -> impl Iterator<Item = &UsageGroup> {
        self.app_groups.values().chain(self.session_groups.values())
    }

    pub fn dump(&self, w: &mut dyn io::Write) -> io::Result<()> {
        writeln!(w, "  observer uid={}", self.uid)?;
        writeln!(w, "    app usage groups:")?;
        dump_sorted(&self.app_groups, w)?;
        writeln!(w, "    session usage groups:")?;
        dump_sorted(&self.session_groups, w)
    }
}

fn dump_sorted(groups: &HashMap<ObserverId, UsageGroup>, w: &mut dyn io::Write) -> io::Result<()> {
    let mut ids: Vec<_> = groups.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        groups[&id].dump(w)?;
    }
    Ok(())
}
