//! Alltoall: pairwise block exchange under pluggable peer schedules
//!
//! A schedule decides which peer each of the `n - 1` iterations talks
//! to; a flavor decides how delivery is confirmed. Barrier interleaves
//! team syncs every `ROUNDS_SYNC` puts, counter relies on a single
//! fence plus the closing sync, signal counts arrivals in a pSync cell.

use crate::config::{AlltoallAlgo, PeerScheme, SyncFlavor};
use crate::coll::{local_copy, CollCtx};
use crate::region::SymAddr;
use crate::{Error, Result};

/// Puts issued between intermediate syncs in the barrier flavor.
const ROUNDS_SYNC: usize = 32;

/// Peer of `me` in iteration `i` of the color-pairing schedule, or
/// `None` when the rank sits the round out. Built on the standard
/// 1-factorization of K_n.
fn edge_color_peer(i: usize, me: usize, n: usize) -> Option<usize> {
    let chr = if n % 2 == 1 { n } else { n - 1 };
    let v = if me < chr {
        (i + chr - me) % chr
    } else if i % 2 == 1 {
        ((i + chr) / 2) % chr
    } else {
        i / 2
    };
    if v == me {
        (n % 2 == 0).then_some(chr)
    } else {
        Some(v)
    }
}

fn peer_of(scheme: PeerScheme, i: usize, me: usize, n: usize) -> Option<usize> {
    match scheme {
        PeerScheme::ShiftExchange => Some((me + i) % n),
        PeerScheme::XorPairwise => Some(me ^ i),
        PeerScheme::ColorPairwise => edge_color_peer(i - 1, me, n),
    }
}

fn check_scheme(scheme: PeerScheme, n: usize) -> Result<()> {
    match scheme {
        PeerScheme::ShiftExchange => Ok(()),
        PeerScheme::XorPairwise if n.is_power_of_two() => Ok(()),
        PeerScheme::XorPairwise => Err(Error::AlgoUnsupported {
            algo: "xor_pairwise",
            reason: format!("team size {n} is not a power of two"),
        }),
        PeerScheme::ColorPairwise if n % 2 == 0 => Ok(()),
        PeerScheme::ColorPairwise => Err(Error::AlgoUnsupported {
            algo: "color_pairwise",
            reason: format!("team size {n} is odd"),
        }),
    }
}

/// Contiguous alltoall: block `q` of `src` lands in block `me` of
/// `dest` on team rank `q`. `block` is the per-destination byte count.
pub fn alltoall_mem(
    cc: &CollCtx<'_>,
    algo: AlltoallAlgo,
    dest: SymAddr,
    src: SymAddr,
    block: usize,
) -> Result<()> {
    let n = cc.nranks();
    if n <= 1 || block == 0 {
        if dest != src {
            local_copy(dest, src, block);
        }
        return Ok(());
    }
    check_scheme(algo.scheme, n)?;
    let slot = cc.alloc_slot()?;
    // The slot goes back on every path, error or not.
    let res = exchange_blocks(cc, algo, dest, src, block, slot.data_cell(0));
    cc.free_slot(&slot);
    res
}

fn exchange_blocks(
    cc: &CollCtx<'_>,
    algo: AlltoallAlgo,
    dest: SymAddr,
    src: SymAddr,
    block: usize,
    arrivals: SymAddr,
) -> Result<()> {
    let n = cc.nranks();
    let me = cc.me_as;
    let mut sent = 0usize;

    for i in 1..n {
        let Some(peer) = peer_of(algo.scheme, i, me, n) else {
            continue;
        };
        if peer >= n {
            return Err(Error::Internal(format!("schedule produced peer {peer} of {n}")));
        }
        let chunk = unsafe {
            std::slice::from_raw_parts(src.as_ptr::<u8>().add(peer * block), block)
        };
        let remote = dest.byte_add(me * block);
        match algo.flavor {
            SyncFlavor::Barrier | SyncFlavor::Counter => {
                unsafe { cc.ta.put_nbi(cc.h, remote, cc.pe_of(peer), chunk.as_ptr(), block)? };
            }
            SyncFlavor::Signal => {
                cc.ta
                    .put_signal_nb(cc.h, remote, cc.pe_of(peer), chunk, arrivals, 1)?;
            }
        }
        sent += 1;
        if algo.flavor == SyncFlavor::Barrier && sent % ROUNDS_SYNC == 0 {
            cc.ta.quiet(cc.h)?;
            cc.team_sync()?;
        }
    }
    if dest != src {
        local_copy(dest.byte_add(me * block), src.byte_add(me * block), block);
    }

    match algo.flavor {
        SyncFlavor::Barrier => {
            cc.ta.quiet(cc.h)?;
            cc.team_sync()?;
        }
        SyncFlavor::Counter => {
            cc.ta.fence(cc.h)?;
            cc.team_sync()?;
        }
        SyncFlavor::Signal => {
            // Signal flavor counts one arrival per sending peer; the
            // color schedule on even teams also sends n-1 times.
            cc.wait_ge(arrivals, (n - 1) as i64);
            cc.ta.write_i64(arrivals, 0);
            cc.team_sync()?;
        }
    }
    Ok(())
}

/// Strided alltoall: element `j` of the block for rank `q` is read at
/// `src[(q * nelems + j) * sst]` and written at
/// `dest[(me * nelems + j) * dst]`, in units of `elem` bytes.
pub fn alltoalls_mem(
    cc: &CollCtx<'_>,
    algo: AlltoallAlgo,
    dest: SymAddr,
    src: SymAddr,
    dst: usize,
    sst: usize,
    nelems: usize,
    elem: usize,
) -> Result<()> {
    let n = cc.nranks();
    let me = cc.me_as;
    let copy_own = |dest: SymAddr, src: SymAddr| {
        for j in 0..nelems {
            local_copy(
                dest.byte_add((me * nelems + j) * dst * elem),
                src.byte_add((me * nelems + j) * sst * elem),
                elem,
            );
        }
    };
    // A zero-element exchange sends nothing; in the signal flavor no
    // peer would ever raise the arrival count.
    if n <= 1 || nelems == 0 {
        if dest != src || dst != sst {
            copy_own(dest, src);
        }
        return Ok(());
    }
    check_scheme(algo.scheme, n)?;
    let slot = cc.alloc_slot()?;
    let res = exchange_strided(cc, algo, dest, src, dst, sst, nelems, elem, slot.data_cell(0));
    cc.free_slot(&slot);
    res?;
    copy_own(dest, src);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn exchange_strided(
    cc: &CollCtx<'_>,
    algo: AlltoallAlgo,
    dest: SymAddr,
    src: SymAddr,
    dst: usize,
    sst: usize,
    nelems: usize,
    elem: usize,
    arrivals: SymAddr,
) -> Result<()> {
    let n = cc.nranks();
    let me = cc.me_as;
    let mut sent = 0usize;

    for i in 1..n {
        let Some(peer) = peer_of(algo.scheme, i, me, n) else {
            continue;
        };
        if peer >= n {
            return Err(Error::Internal(format!("schedule produced peer {peer} of {n}")));
        }
        let world = cc.pe_of(peer);
        for j in 0..nelems {
            let chunk = unsafe {
                std::slice::from_raw_parts(
                    src.as_ptr::<u8>().add((peer * nelems + j) * sst * elem),
                    elem,
                )
            };
            let remote = dest.byte_add((me * nelems + j) * dst * elem);
            let last = j + 1 == nelems;
            match algo.flavor {
                SyncFlavor::Signal if last => {
                    cc.ta.put_signal_nb(cc.h, remote, world, chunk, arrivals, 1)?;
                }
                _ => unsafe { cc.ta.put_nbi(cc.h, remote, world, chunk.as_ptr(), elem)? },
            }
            sent += 1;
            if algo.flavor == SyncFlavor::Barrier && sent % ROUNDS_SYNC == 0 {
                cc.ta.quiet(cc.h)?;
                cc.team_sync()?;
            }
        }
    }

    match algo.flavor {
        SyncFlavor::Barrier => {
            cc.ta.quiet(cc.h)?;
            cc.team_sync()?;
        }
        SyncFlavor::Counter => {
            cc.ta.fence(cc.h)?;
            cc.team_sync()?;
        }
        SyncFlavor::Signal => {
            cc.wait_ge(arrivals, (n - 1) as i64);
            cc.ta.write_i64(arrivals, 0);
            cc.team_sync()?;
        }
    }
    Ok(())
}
