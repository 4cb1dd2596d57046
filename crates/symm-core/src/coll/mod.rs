//! Team-based collective engine
//!
//! Every collective composes one-sided puts, gets and atomics on a
//! context, synchronizing through pSync cells. Algorithms are chosen
//! per operation from the resolved configuration table.

pub mod alltoall;
pub mod barrier;
pub mod broadcast;
pub mod collect;
pub mod reduce;

use crate::config::SyncAlgo;
use crate::heap::HeapTable;
use crate::psync::{PsyncPool, PsyncSlot};
use crate::region::SymAddr;
use crate::team::Team;
use crate::transport::{CommHandle, TransportAdapter};
use crate::{Error, Result};

/// Everything an algorithm needs for one collective call on one team.
pub struct CollCtx<'a> {
    pub ta: &'a TransportAdapter,
    pub h: CommHandle,
    pub pool: &'a PsyncPool,
    pub heap: &'a HeapTable,
    /// Heap index collective scratch comes from.
    pub heap_index: usize,
    pub team: &'a Team,
    /// My rank inside the team's active set.
    pub me_as: usize,
    /// Sync algorithm used for this team's internal syncs.
    pub sync_algo: SyncAlgo,
}

impl<'a> CollCtx<'a> {
    /// World rank of active-set rank `i`.
    pub fn pe_of(&self, i: usize) -> usize {
        self.team.set.world_pe(i)
    }

    pub fn nranks(&self) -> usize {
        self.team.nranks()
    }

    /// Synchronize the team through its dedicated barrier slot.
    pub fn team_sync(&self) -> Result<()> {
        barrier::sync(self, self.sync_algo)
    }

    /// Acquire a general pSync slot, falling back to sync-and-retry
    /// when the pool is exhausted.
    pub fn alloc_slot(&self) -> Result<PsyncSlot> {
        self.pool
            .alloc(self.ta, self.h, self.team.psync_index, || self.team_sync())
    }

    pub fn free_slot(&self, slot: &PsyncSlot) {
        self.pool.free(self.ta, slot);
    }

    /// Symmetric scratch allocation; every member performs the same
    /// allocation sequence, so offsets agree across PEs.
    pub fn scratch_alloc(&self, bytes: usize) -> Result<SymAddr> {
        self.heap
            .calloc_by_index(self.heap_index, bytes, 1)
            .map(SymAddr)
    }

    pub fn scratch_free(&self, addr: SymAddr) {
        let _ = self.heap.free_by_index(self.heap_index, addr.addr());
    }

    /// Bump a signal cell on a peer.
    pub fn signal(&self, cell: SymAddr, pe: usize) -> Result<()> {
        self.ta.add_i64(self.h, cell, pe, 1)
    }

    /// Wait for a local cell to reach `target`.
    pub fn wait_ge(&self, cell: SymAddr, target: i64) {
        self.ta.wait_until(self.h, cell, |v| v >= target);
    }
}

/// Debug-build check that two byte ranges do not overlap where the
/// operation forbids it.
pub fn check_no_overlap(
    debug_checks: bool,
    dest: SymAddr,
    dest_len: usize,
    src: SymAddr,
    src_len: usize,
) -> Result<()> {
    if !debug_checks {
        return Ok(());
    }
    let (d0, d1) = (dest.addr(), dest.addr() + dest_len);
    let (s0, s1) = (src.addr(), src.addr() + src_len);
    if d0 < s1 && s0 < d1 {
        return Err(Error::BufferOverlap);
    }
    Ok(())
}

/// Local memmove between symmetric buffers on this PE.
pub(crate) fn local_copy(dest: SymAddr, src: SymAddr, len: usize) {
    unsafe { std::ptr::copy(src.as_ptr::<u8>(), dest.as_ptr::<u8>(), len) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_check_only_in_debug_builds() {
        let a = SymAddr(0x1000);
        let b = SymAddr(0x1010);
        assert!(check_no_overlap(false, a, 0x20, b, 0x20).is_ok());
        assert!(matches!(
            check_no_overlap(true, a, 0x20, b, 0x20),
            Err(Error::BufferOverlap)
        ));
        assert!(check_no_overlap(true, a, 0x10, b, 0x10).is_ok());
    }
}
