//! Per-user active-entity set and reverse observer index

use std::collections::{HashMap, HashSet};
use std::io;

use warden_util::{EntityId, UserId};

use crate::group::GroupId;

/// State for one user that has reported usage: which entities are
/// currently active, and which groups watch each entity name.
pub(crate) struct UserState {
    user_id: UserId,
    /// Entities currently between a start and its matching stop.
    currently_active: HashSet<EntityId>,
    /// Reverse index: entity name to the groups watching it. A group
    /// appears once per slot it occupies in its observed list.
    observed_index: HashMap<EntityId, Vec<GroupId>>,
}

impl UserState {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            currently_active: HashSet::new(),
            observed_index: HashMap::new(),
        }
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.currently_active.contains(name)
    }

    /// True iff any of `names` is currently active.
    pub fn is_any_active(&self, names: &[EntityId]) -> bool {
        names.iter().any(|n| self.currently_active.contains(n))
    }

    /// Indexes `id` under every name in `observed`.
    pub fn add_group(&mut self, id: GroupId, observed: &[EntityId]) {
        for name in observed {
            self.observed_index.entry(name.clone()).or_default().push(id);
        }
    }

    /// Reverse of [`Self::add_group`]; empty index entries are dropped.
    pub fn remove_group(&mut self, id: GroupId, observed: &[EntityId]) {
        for name in observed {
            if let Some(groups) = self.observed_index.get_mut(name) {
                if let Some(pos) = groups.iter().position(|g| *g == id) {
                    groups.remove(pos);
                }
                if groups.is_empty() {
                    self.observed_index.remove(name);
                }
            }
        }
    }

    /// Marks `name` active and returns the groups indexed under it.
    pub fn mark_active(&mut self, name: &EntityId) -> Vec<GroupId> {
        self.currently_active.insert(name.clone());
        self.groups_for(name)
    }

    /// Marks `name` inactive and returns the groups indexed under it.
    pub fn mark_inactive(&mut self, name: &EntityId) -> Vec<GroupId> {
        self.currently_active.remove(name);
        self.groups_for(name)
    }

    fn groups_for(&self, name: &EntityId) -> Vec<GroupId> {
        self.observed_index.get(name).cloned().unwrap_or_default()
    }

    pub fn dump(&self, w: &mut dyn io::Write) -> io::Result<()> {
        writeln!(w, "  user id={}", self.user_id)?;
        let mut active: Vec<_> = self.currently_active.iter().map(|e| e.as_str()).collect();
        active.sort_unstable();
        writeln!(w, "    currently active: [{}]", active.join(", "))?;
        let mut observed: Vec<_> = self.observed_index.keys().map(|e| e.as_str()).collect();
        observed.sort_unstable();
        writeln!(w, "    observed entities: [{}]", observed.join(", "))
    }
}
