//! Teams: predefined subsets of PEs for collectives

use crate::{Error, Result};
use std::sync::atomic::AtomicI64;

/// Handle to a team in the runtime's team table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TeamId(pub usize);

/// World team: every PE.
pub const TEAM_WORLD: TeamId = TeamId(0);
/// Node-local team: PEs sharing this node.
pub const TEAM_SHARED: TeamId = TeamId(1);

/// Active-set view of a team: `start + i * stride` for `i < size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSet {
    pub start: usize,
    pub stride: usize,
    pub size: usize,
}

impl ActiveSet {
    /// World-rank of active-set rank `i`.
    pub fn world_pe(&self, i: usize) -> usize {
        self.start + i * self.stride
    }

    /// Active-set rank of a world PE, if it participates.
    pub fn as_rank(&self, world_pe: usize) -> Option<usize> {
        if world_pe < self.start {
            return None;
        }
        let off = world_pe - self.start;
        if off % self.stride != 0 {
            return None;
        }
        let i = off / self.stride;
        (i < self.size).then_some(i)
    }
}

/// One team: identity, membership, and its pSync pool index.
pub struct Team {
    pub id: TeamId,
    pub name: &'static str,
    pub set: ActiveSet,
    /// Row into the pSync pool layout.
    pub psync_index: usize,
    /// Monotonic sync epochs, one per sync algorithm family; they
    /// drive the reset-free barrier counters.
    pub sync_epochs: [AtomicI64; 4],
}

impl Team {
    pub fn new(id: TeamId, name: &'static str, set: ActiveSet) -> Self {
        Self {
            id,
            name,
            set,
            psync_index: id.0,
            sync_epochs: std::array::from_fn(|_| AtomicI64::new(0)),
        }
    }

    /// Advance and return this team's epoch for one sync algorithm.
    /// Every member calls sync in the same order, so epochs agree
    /// across PEs.
    pub fn next_epoch(&self, algo_slot: usize) -> i64 {
        use std::sync::atomic::Ordering;
        self.sync_epochs[algo_slot].fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn nranks(&self) -> usize {
        self.set.size
    }

    /// My rank inside the team, given my world rank.
    pub fn my_rank(&self, world_pe: usize) -> Result<usize> {
        self.set
            .as_rank(world_pe)
            .ok_or_else(|| Error::BadArg(format!("pe {world_pe} not in team {}", self.name)))
    }

    /// Translate team rank `rank` into a rank of `dest`, when the PE is
    /// a member of both.
    pub fn translate_pe(&self, rank: usize, dest: &Team) -> Option<usize> {
        if rank >= self.set.size {
            return None;
        }
        dest.set.as_rank(self.set.world_pe(rank))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_set_round_trip() {
        let s = ActiveSet {
            start: 2,
            stride: 3,
            size: 4,
        };
        for i in 0..s.size {
            assert_eq!(s.as_rank(s.world_pe(i)), Some(i));
        }
        assert_eq!(s.as_rank(3), None);
        assert_eq!(s.as_rank(14), None);
        assert_eq!(s.as_rank(0), None);
    }

    #[test]
    fn translate_between_teams() {
        let world = Team::new(
            TEAM_WORLD,
            "world",
            ActiveSet {
                start: 0,
                stride: 1,
                size: 8,
            },
        );
        let evens = Team::new(
            TeamId(2),
            "evens",
            ActiveSet {
                start: 0,
                stride: 2,
                size: 4,
            },
        );
        assert_eq!(evens.translate_pe(3, &world), Some(6));
        assert_eq!(world.translate_pe(6, &evens), Some(3));
        assert_eq!(world.translate_pe(5, &evens), None);
    }
}
