//! pSync pool: symmetric synchronization cells with per-slot CAS locks
//!
//! One symmetric buffer holds every team's cells. The general region
//! carries `N_PSYNC_PER_TEAM` lockable slots per team for broadcast,
//! collect, alltoall and reductions; the barrier region carries one
//! dedicated slot per team, serialized by the sync algorithm itself
//! rather than the lock protocol. The CAS lock serializes PEs; threads
//! within a PE are serialized by the comm mutex above this layer.

use crate::region::SymAddr;
use crate::transport::{CommHandle, TransportAdapter};
use crate::{Error, Result};

/// Lock word value of an idle slot; cells are zeroed at pool init.
pub const SYNC_FREE: i64 = 0;
/// Lock word value while a collective owns the slot.
pub const SYNC_BUSY: i64 = 1;

pub const MAX_TEAMS: usize = 64;
pub const N_PSYNC_PER_TEAM: usize = 2;

/// Cells per general slot, sized for the largest general collective.
pub const ALLTOALL_SYNC_SIZE: usize = 32;
/// Cells per dedicated barrier slot.
pub const BARRIER_SYNC_SIZE: usize = 16;
/// Cells a reduction needs in its slot.
pub const REDUCE_SYNC_SIZE: usize = 32;
/// Floor on reduction work-array element counts.
pub const REDUCE_MIN_WRKDATA_SIZE: usize = 16;

const LONG: usize = std::mem::size_of::<i64>();
const GENERAL_LONGS: usize = MAX_TEAMS * N_PSYNC_PER_TEAM * ALLTOALL_SYNC_SIZE;
const BARRIER_LONGS: usize = MAX_TEAMS * BARRIER_SYNC_SIZE;

/// Total pool footprint in the symmetric heap.
pub const fn pool_bytes() -> usize {
    (GENERAL_LONGS + BARRIER_LONGS) * LONG
}

/// An acquired slot. General slots reserve cell 0 as the lock word;
/// the barrier slot has no lock word and every cell is usable.
#[derive(Debug, Clone, Copy)]
pub struct PsyncSlot {
    pub index: usize,
    pub addr: SymAddr,
    pub is_barrier: bool,
}

impl PsyncSlot {
    /// Raw cell address; cell 0 of a general slot is the lock word.
    pub fn cell(&self, i: usize) -> SymAddr {
        self.addr.byte_add(i * LONG)
    }

    /// i-th cell available to an algorithm.
    pub fn data_cell(&self, i: usize) -> SymAddr {
        let skip = if self.is_barrier { 0 } else { 1 };
        debug_assert!(
            i + skip
                < if self.is_barrier {
                    BARRIER_SYNC_SIZE
                } else {
                    ALLTOALL_SYNC_SIZE
                }
        );
        self.cell(i + skip)
    }
}

/// The pool over a symmetric allocation made at init.
pub struct PsyncPool {
    base: SymAddr,
    my_pe: usize,
}

impl PsyncPool {
    /// `base` must point at `pool_bytes()` zeroed bytes of symmetric
    /// memory, 8-aligned.
    pub fn new(base: SymAddr, my_pe: usize) -> Self {
        debug_assert_eq!(base.addr() % LONG, 0);
        Self { base, my_pe }
    }

    fn general_slot_addr(&self, team_index: usize, slot: usize) -> SymAddr {
        self.base
            .byte_add((team_index * N_PSYNC_PER_TEAM + slot) * ALLTOALL_SYNC_SIZE * LONG)
    }

    fn barrier_slot_addr(&self, team_index: usize) -> SymAddr {
        self.base
            .byte_add(GENERAL_LONGS * LONG + team_index * BARRIER_SYNC_SIZE * LONG)
    }

    /// The team's dedicated barrier slot; never tracked by the lock
    /// protocol.
    pub fn barrier_slot(&self, team_index: usize) -> PsyncSlot {
        PsyncSlot {
            index: N_PSYNC_PER_TEAM,
            addr: self.barrier_slot_addr(team_index),
            is_barrier: true,
        }
    }

    fn try_acquire(
        &self,
        ta: &TransportAdapter,
        h: CommHandle,
        team_index: usize,
    ) -> Result<Option<PsyncSlot>> {
        for i in 0..N_PSYNC_PER_TEAM {
            let addr = self.general_slot_addr(team_index, i);
            let prev = ta.cswap_i64(h, addr, self.my_pe, SYNC_FREE, SYNC_BUSY)?;
            if prev == SYNC_FREE {
                return Ok(Some(PsyncSlot {
                    index: i,
                    addr,
                    is_barrier: false,
                }));
            }
        }
        Ok(None)
    }

    /// Acquire a general slot for a collective. If every slot is busy,
    /// run `sync` (a team sync, after which all PEs have released
    /// prior slots) and retry exactly one more pass.
    pub fn alloc(
        &self,
        ta: &TransportAdapter,
        h: CommHandle,
        team_index: usize,
        sync: impl FnOnce() -> Result<()>,
    ) -> Result<PsyncSlot> {
        if let Some(slot) = self.try_acquire(ta, h, team_index)? {
            return Ok(slot);
        }
        sync()?;
        match self.try_acquire(ta, h, team_index)? {
            Some(slot) => Ok(slot),
            None => Err(Error::NoSlot(team_index)),
        }
    }

    /// Release a slot from the PE that won its CAS. Barrier slots are
    /// not locked, so releasing one is a no-op.
    pub fn free(&self, ta: &TransportAdapter, slot: &PsyncSlot) {
        if slot.is_barrier {
            return;
        }
        ta.write_i64(slot.addr, SYNC_FREE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackFabric, LoopbackShared};
    use crate::region::{PeSpan, RegionTable};
    use crate::transport::Fabric;
    use std::sync::Arc;

    struct Rig {
        _mem: Vec<u8>,
        ta: TransportAdapter,
        h: CommHandle,
        pool: PsyncPool,
    }

    fn rig() -> Rig {
        let mut mem = vec![0u8; pool_bytes() + 16];
        let base = (mem.as_mut_ptr() as usize + 15) & !15;
        let regions = Arc::new(RegionTable::new(0));
        regions.register(vec![PeSpan {
            base,
            end: base + pool_bytes(),
            rkey: 0,
        }]);
        let fabric = Arc::new(LoopbackFabric::new(LoopbackShared::new(1), 0));
        let worker = fabric.create_worker().unwrap();
        let ta = TransportAdapter::new(fabric, regions);
        Rig {
            _mem: mem,
            ta,
            h: CommHandle {
                worker,
                no_store: false,
            },
            pool: PsyncPool::new(SymAddr(base), 0),
        }
    }

    #[test]
    fn slots_acquired_in_order_and_released() {
        let r = rig();
        let no_sync = || Ok(());
        let s0 = r.pool.alloc(&r.ta, r.h, 0, no_sync).unwrap();
        assert_eq!(s0.index, 0);
        let s1 = r.pool.alloc(&r.ta, r.h, 0, || Ok(())).unwrap();
        assert_eq!(s1.index, 1);
        r.pool.free(&r.ta, &s0);
        assert_eq!(r.ta.read_i64(s0.addr), SYNC_FREE);
        let again = r.pool.alloc(&r.ta, r.h, 0, || Ok(())).unwrap();
        assert_eq!(again.index, 0);
    }

    #[test]
    fn exhaustion_syncs_once_then_no_slot() {
        let r = rig();
        let _s0 = r.pool.alloc(&r.ta, r.h, 0, || Ok(())).unwrap();
        let _s1 = r.pool.alloc(&r.ta, r.h, 0, || Ok(())).unwrap();
        let mut synced = false;
        let res = r.pool.alloc(&r.ta, r.h, 0, || {
            synced = true;
            Ok(())
        });
        assert!(synced, "full pool must trigger the team-sync retry");
        assert!(matches!(res, Err(Error::NoSlot(0))));
    }

    #[test]
    fn retry_pass_picks_up_released_slot() {
        let r = rig();
        let s0 = r.pool.alloc(&r.ta, r.h, 0, || Ok(())).unwrap();
        let _s1 = r.pool.alloc(&r.ta, r.h, 0, || Ok(())).unwrap();
        let got = r
            .pool
            .alloc(&r.ta, r.h, 0, || {
                // Peers finish during the sync and release their use.
                r.pool.free(&r.ta, &s0);
                Ok(())
            })
            .unwrap();
        assert_eq!(got.index, 0);
    }

    #[test]
    fn teams_do_not_share_slots() {
        let r = rig();
        let a = r.pool.alloc(&r.ta, r.h, 0, || Ok(())).unwrap();
        let b = r.pool.alloc(&r.ta, r.h, 1, || Ok(())).unwrap();
        assert_eq!(a.index, 0);
        assert_eq!(b.index, 0);
        assert_ne!(a.addr, b.addr);
    }

    #[test]
    fn barrier_slot_outside_lock_protocol() {
        let r = rig();
        let b = r.pool.barrier_slot(0);
        assert!(b.is_barrier);
        assert_eq!(b.index, N_PSYNC_PER_TEAM);
        // Free is a no-op and cells keep their values.
        r.ta.write_i64(b.cell(0), 7);
        r.pool.free(&r.ta, &b);
        assert_eq!(r.ta.read_i64(b.cell(0)), 7);
    }
}
