//! Broadcast: root's buffer to every team member

use crate::config::BcastAlgo;
use crate::coll::{local_copy, CollCtx};
use crate::region::SymAddr;
use crate::Result;

/// Byte-level broadcast from team rank `root_as`. The root's own
/// destination is updated as well.
pub fn broadcast_mem(
    cc: &CollCtx<'_>,
    algo: BcastAlgo,
    dest: SymAddr,
    src: SymAddr,
    nbytes: usize,
    root_as: usize,
) -> Result<()> {
    let n = cc.nranks();
    if n <= 1 {
        if dest != src {
            local_copy(dest, src, nbytes);
        }
        return Ok(());
    }
    match algo {
        BcastAlgo::Linear => linear(cc, dest, src, nbytes, root_as),
        BcastAlgo::Tree => tree(cc, dest, src, nbytes, root_as),
    }
}

fn linear(
    cc: &CollCtx<'_>,
    dest: SymAddr,
    src: SymAddr,
    nbytes: usize,
    root_as: usize,
) -> Result<()> {
    if cc.me_as == root_as {
        let payload = src.as_ptr::<u8>();
        for i in (0..cc.nranks()).filter(|&i| i != root_as) {
            // Source is symmetric memory and stable until the final
            // sync, so non-blocking issuance is safe.
            unsafe { cc.ta.put_nbi(cc.h, dest, cc.pe_of(i), payload, nbytes)? };
        }
        cc.ta.quiet(cc.h)?;
        if dest != src {
            local_copy(dest, src, nbytes);
        }
    }
    cc.team_sync()
}

/// Binomial forwarding: each rank receives a signal-put from its
/// parent and relays the payload to its children.
fn tree(
    cc: &CollCtx<'_>,
    dest: SymAddr,
    src: SymAddr,
    nbytes: usize,
    root_as: usize,
) -> Result<()> {
    let n = cc.nranks();
    let slot = cc.alloc_slot()?;
    let arrived = slot.data_cell(0);

    // Virtual ranks rotate the root to 0.
    let v = (cc.me_as + n - root_as) % n;
    let (_, vchildren) = super::barrier::binomial_topology(v, n);

    if cc.me_as == root_as {
        if dest != src {
            local_copy(dest, src, nbytes);
        }
    } else {
        cc.wait_ge(arrived, 1);
    }
    let payload = unsafe { std::slice::from_raw_parts(dest.as_ptr::<u8>(), nbytes) };
    for vc in vchildren {
        let child_as = (vc + root_as) % n;
        cc.ta
            .put_signal_nb(cc.h, dest, cc.pe_of(child_as), payload, arrived, 1)?;
    }
    cc.ta.write_i64(arrived, 0);
    cc.team_sync()?;
    cc.free_slot(&slot);
    Ok(())
}
