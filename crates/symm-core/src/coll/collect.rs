//! Collect and fcollect: concatenate per-PE contributions in rank order
//!
//! Both use the Bruck dissemination pattern: log2(n) rounds of
//! signal-puts, each doubling the contiguous run of blocks a PE holds,
//! followed by a local rotation from virtual order (own block first)
//! into rank order.

use crate::config::CollectAlgo;
use crate::coll::{local_copy, CollCtx};
use crate::psync::PsyncSlot;
use crate::region::SymAddr;
use crate::transport::TransportAdapter;
use crate::Result;

/// Virtual block index of world-order block `q` as seen from `me`.
fn virtual_block(q: usize, me: usize, n: usize) -> usize {
    (q + n - me) % n
}

/// Number of rounds and per-round block counts for an n-PE Bruck run.
fn round_counts(n: usize) -> Vec<usize> {
    let mut counts = Vec::new();
    let mut dist = 1;
    while dist < n {
        counts.push(dist.min(n - dist));
        dist <<= 1;
    }
    counts
}

/// Fixed-size collect: every PE contributes `block` bytes; `dest` holds
/// `nranks * block` bytes ordered by team rank.
pub fn fcollect_mem(
    cc: &CollCtx<'_>,
    algo: CollectAlgo,
    dest: SymAddr,
    src: SymAddr,
    block: usize,
) -> Result<()> {
    let n = cc.nranks();
    if n <= 1 {
        if dest != src {
            local_copy(dest, src, block);
        }
        return Ok(());
    }
    let slot = cc.alloc_slot()?;
    let staging = match algo {
        CollectAlgo::BruckInplace => dest,
        CollectAlgo::Bruck => cc.scratch_alloc(n * block)?,
    };
    if staging != src {
        local_copy(staging, src, block);
    }

    let me = cc.me_as;
    let mut dist = 1;
    for (r, count) in round_counts(n).into_iter().enumerate() {
        let to = cc.pe_of((me + n - dist) % n);
        let payload =
            unsafe { std::slice::from_raw_parts(staging.as_ptr::<u8>(), count * block) };
        cc.ta.put_signal_nb(
            cc.h,
            staging.byte_add(dist * block),
            to,
            payload,
            slot.data_cell(r),
            1,
        )?;
        cc.wait_ge(slot.data_cell(r), 1);
        dist <<= 1;
    }
    // Drain the last round's put before the rotation mutates staging.
    cc.ta.quiet(cc.h)?;

    // Rotate virtual order back to rank order.
    match algo {
        CollectAlgo::BruckInplace => {
            let staged =
                unsafe { std::slice::from_raw_parts(staging.as_ptr::<u8>(), n * block) }.to_vec();
            for q in 0..n {
                let v = virtual_block(q, me, n);
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        staged.as_ptr().add(v * block),
                        dest.as_ptr::<u8>().add(q * block),
                        block,
                    );
                }
            }
        }
        CollectAlgo::Bruck => {
            for q in 0..n {
                let v = virtual_block(q, me, n);
                local_copy(dest.byte_add(q * block), staging.byte_add(v * block), block);
            }
        }
    }

    reset_round_cells(cc.ta, &slot, round_counts(n).len());
    cc.team_sync()?;
    if staging != dest {
        cc.scratch_free(staging);
    }
    cc.free_slot(&slot);
    Ok(())
}

/// Variable-size collect: each PE contributes `my_bytes` bytes; sizes
/// are exchanged first, then the same doubling pattern runs over byte
/// prefixes instead of whole blocks.
pub fn collect_mem(
    cc: &CollCtx<'_>,
    _algo: CollectAlgo,
    dest: SymAddr,
    src: SymAddr,
    my_bytes: usize,
) -> Result<()> {
    let n = cc.nranks();
    if n <= 1 {
        if dest != src {
            local_copy(dest, src, my_bytes);
        }
        return Ok(());
    }
    let slot = cc.alloc_slot()?;
    let me = cc.me_as;

    // Publish contribution sizes into everyone's size table.
    let sizes_buf = cc.scratch_alloc(n * 8)?;
    let mine = my_bytes as u64;
    for i in (0..n).filter(|&i| i != me) {
        unsafe {
            cc.ta.put_nbi(
                cc.h,
                sizes_buf.byte_add(me * 8),
                cc.pe_of(i),
                &mine as *const u64 as *const u8,
                8,
            )?;
        }
    }
    unsafe { *sizes_buf.as_ptr::<u64>().add(me) = mine };
    cc.ta.quiet(cc.h)?;
    cc.team_sync()?;

    let sizes: Vec<usize> = (0..n)
        .map(|q| unsafe { *sizes_buf.as_ptr::<u64>().add(q) } as usize)
        .collect();
    // Staged prefix of `b` virtual blocks on PE `p`.
    let prefix = |p: usize, b: usize| -> usize { (0..b).map(|j| sizes[(p + j) % n]).sum() };
    let total: usize = sizes.iter().sum();

    let staging = cc.scratch_alloc(total.max(1))?;
    if my_bytes > 0 {
        local_copy(staging, src, my_bytes);
    }

    let mut dist = 1;
    for (r, count) in round_counts(n).into_iter().enumerate() {
        let to_rank = (me + n - dist) % n;
        let send = prefix(me, count);
        let payload = unsafe { std::slice::from_raw_parts(staging.as_ptr::<u8>(), send) };
        cc.ta.put_signal_nb(
            cc.h,
            staging.byte_add(prefix(to_rank, dist)),
            cc.pe_of(to_rank),
            payload,
            slot.data_cell(r),
            1,
        )?;
        cc.wait_ge(slot.data_cell(r), 1);
        dist <<= 1;
    }
    cc.ta.quiet(cc.h)?;

    let mut dest_off = 0;
    for q in 0..n {
        let v = virtual_block(q, me, n);
        local_copy(dest.byte_add(dest_off), staging.byte_add(prefix(me, v)), sizes[q]);
        dest_off += sizes[q];
    }

    reset_round_cells(cc.ta, &slot, round_counts(n).len());
    cc.team_sync()?;
    cc.scratch_free(staging);
    cc.scratch_free(sizes_buf);
    cc.free_slot(&slot);
    Ok(())
}

fn reset_round_cells(ta: &TransportAdapter, slot: &PsyncSlot, rounds: usize) {
    for r in 0..rounds {
        ta.write_i64(slot.data_cell(r), 0);
    }
}
