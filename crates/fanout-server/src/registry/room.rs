//! Shard-local room membership.

use std::collections::HashSet;

use fanout_core::ids::ConnectionId;

/// The members of one named room within one shard.
///
/// The name is the key of the shard's room table.
///
/// Members are identities, not owners: the shard's connection table owns the
/// connections. The logical room seen by publishers is the union of every
/// shard's `Room` with the same name.
#[derive(Debug, Default)]
pub struct Room {
    members: HashSet<ConnectionId>,
}

impl Room {

    /// Add a member. Returns `false` if it was already present.
    pub fn insert(&mut self, id: ConnectionId) -> bool {
        self.members.insert(id)
    }

    /// Remove a member. Returns `false` if it was absent.
    pub fn remove(&mut self, id: ConnectionId) -> bool {
        self.members.remove(&id)
    }

    #[cfg(test)]
    fn contains(&self, id: ConnectionId) -> bool {
        self.members.contains(&id)
    }

    /// Member count.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// No members left.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Iterate over member identities.
    pub fn members(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.members.iter().copied()
    }
}
