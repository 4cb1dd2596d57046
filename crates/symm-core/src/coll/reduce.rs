//! Reductions: element-wise fold across a team or active set
//!
//! Three cores share one cell map inside a 24-cell window: recursive
//! doubling streams chunks through the symmetric work array with a
//! ready/ack handshake per chunk, linear gathers everything at rank 0,
//! binomial tree folds partials up and fans the result down. The
//! active-set entry adds a closing dissemination sync in the caller's
//! pSync; the team entry syncs through the team barrier instead.

use crate::coll::{local_copy, CollCtx};
use crate::config::ReduceAlgo;
use crate::elem::{as_bytes as bytes, as_bytes_mut as bytes_mut, ShmemElem};
use crate::psync::REDUCE_MIN_WRKDATA_SIZE;
use crate::region::SymAddr;
use crate::team::ActiveSet;
use crate::transport::{CommHandle, TransportAdapter};
use crate::{Error, Result};

const ARRIVE: usize = 0;
const RESULT: usize = 1;
const X_READY: usize = 2;
const X_ACK: usize = 3;
const R_READY: usize = 4;
const R_ACK: usize = 14;
const CELLS_USED: usize = 24;
const MAX_ROUNDS: usize = 10;
// Closing sync cells for the active-set entry, beyond the core window.
const SYNC_BASE: usize = 24;
const SYNC_CELLS: usize = 8;

const LONG: usize = std::mem::size_of::<i64>();

/// Work-array element count a caller must provide for `n` elements.
pub fn wrk_elems(nreduce: usize) -> usize {
    (nreduce / 2).max(REDUCE_MIN_WRKDATA_SIZE)
}

/// Reduction participants and plumbing, team- and active-set-neutral.
pub struct ReduceCtx<'a> {
    pub ta: &'a TransportAdapter,
    pub h: CommHandle,
    pub set: ActiveSet,
    pub me_as: usize,
}

impl<'a> ReduceCtx<'a> {
    fn n(&self) -> usize {
        self.set.size
    }

    fn pe_of(&self, i: usize) -> usize {
        self.set.world_pe(i)
    }

    fn signal(&self, cell: SymAddr, pe: usize) -> Result<()> {
        self.ta.add_i64(self.h, cell, pe, 1)
    }

    fn wait_ge(&self, cell: SymAddr, target: i64) {
        self.ta.wait_until(self.h, cell, |v| v >= target);
    }
}

struct Cells(SymAddr);

impl Cells {
    fn at(&self, i: usize) -> SymAddr {
        self.0.byte_add(i * LONG)
    }

    fn reset(&self, ta: &TransportAdapter, from: usize, to: usize) {
        for i in from..to {
            ta.write_i64(self.at(i), 0);
        }
    }
}

fn read_elems<T: ShmemElem>(addr: SymAddr, n: usize) -> Vec<T> {
    unsafe { std::slice::from_raw_parts(addr.as_ptr::<T>(), n) }.to_vec()
}

fn write_elems<T: ShmemElem>(addr: SymAddr, src: &[T]) {
    unsafe { std::ptr::copy(src.as_ptr(), addr.as_ptr::<T>(), src.len()) };
}

fn chunk_bounds(n_elems: usize, pwrk_elems: usize, c: usize) -> (usize, usize) {
    let lo = c * pwrk_elems;
    (lo, (lo + pwrk_elems).min(n_elems))
}

/// Fold `src[0..n_elems]` across every member into everyone's `dest`.
/// `cells` must point at `CELLS_USED` zeroed i64 cells symmetric across
/// members; they are zero again on return. `pwrk` is a symmetric work
/// array of at least `wrk_elems(n_elems)` elements (recursive doubling
/// only).
pub fn reduce_core<T, F>(
    rc: &ReduceCtx<'_>,
    algo: ReduceAlgo,
    dest: SymAddr,
    src: SymAddr,
    n_elems: usize,
    fold: &F,
    cells_base: SymAddr,
    pwrk: SymAddr,
    pwrk_elems: usize,
) -> Result<()>
where
    T: ShmemElem,
    F: Fn(T, T) -> T,
{
    let n = rc.n();
    if n <= 1 {
        if dest != src {
            local_copy(dest, src, n_elems * std::mem::size_of::<T>());
        }
        return Ok(());
    }
    let cells = Cells(cells_base);
    match algo {
        ReduceAlgo::RecDbl => rec_dbl(rc, dest, src, n_elems, fold, &cells, pwrk, pwrk_elems),
        ReduceAlgo::Linear => linear(rc, dest, src, n_elems, fold, &cells),
        ReduceAlgo::Tree => tree(rc, dest, src, n_elems, fold, &cells),
    }?;
    cells.reset(rc.ta, 0, CELLS_USED);
    Ok(())
}

fn rec_dbl<T, F>(
    rc: &ReduceCtx<'_>,
    dest: SymAddr,
    src: SymAddr,
    n_elems: usize,
    fold: &F,
    cells: &Cells,
    pwrk: SymAddr,
    pwrk_elems: usize,
) -> Result<()>
where
    T: ShmemElem,
    F: Fn(T, T) -> T,
{
    let n = rc.n();
    if n_elems > 0 && pwrk_elems == 0 {
        return Err(Error::BadArg("empty reduction work array".into()));
    }
    let r2 = if n.is_power_of_two() { n } else { n.next_power_of_two() / 2 };
    let rounds = r2.trailing_zeros() as usize;
    if rounds > MAX_ROUNDS {
        return Err(Error::AlgoUnsupported {
            algo: "rec_dbl",
            reason: format!("team of {n} exceeds {MAX_ROUNDS} rounds"),
        });
    }
    let extras = n - r2;
    let me = rc.me_as;
    let nchunks = if n_elems == 0 { 0 } else { n_elems.div_ceil(pwrk_elems) };
    let mut acc: Vec<T> = read_elems(src, n_elems);

    if me >= r2 {
        // Extra rank: stream my contribution to the partner, then wait
        // for it to push the final result into my dest.
        let p = rc.pe_of(me - r2);
        for c in 0..nchunks {
            let (lo, hi) = chunk_bounds(n_elems, pwrk_elems, c);
            write_elems(pwrk, &acc[lo..hi]);
            rc.signal(cells.at(X_READY), p)?;
            rc.wait_ge(cells.at(X_ACK), c as i64 + 1);
        }
        rc.wait_ge(cells.at(RESULT), 1);
        return Ok(());
    }
    if me < extras {
        let ep = rc.pe_of(me + r2);
        let mut buf = vec![T::default(); pwrk_elems.min(n_elems.max(1))];
        for c in 0..nchunks {
            let (lo, hi) = chunk_bounds(n_elems, pwrk_elems, c);
            rc.wait_ge(cells.at(X_READY), c as i64 + 1);
            rc.ta.get(rc.h, bytes_mut(&mut buf[..hi - lo]), pwrk, ep)?;
            for (a, b) in acc[lo..hi].iter_mut().zip(&buf) {
                *a = fold(*a, *b);
            }
            rc.signal(cells.at(X_ACK), ep)?;
        }
    }

    for r in 0..rounds {
        let partner = rc.pe_of(me ^ (1 << r));
        let mut buf = vec![T::default(); pwrk_elems.min(n_elems.max(1))];
        for c in 0..nchunks {
            let (lo, hi) = chunk_bounds(n_elems, pwrk_elems, c);
            write_elems(pwrk, &acc[lo..hi]);
            rc.signal(cells.at(R_READY + r), partner)?;
            rc.wait_ge(cells.at(R_READY + r), c as i64 + 1);
            rc.ta.get(rc.h, bytes_mut(&mut buf[..hi - lo]), pwrk, partner)?;
            rc.signal(cells.at(R_ACK + r), partner)?;
            rc.wait_ge(cells.at(R_ACK + r), c as i64 + 1);
            for (a, b) in acc[lo..hi].iter_mut().zip(&buf) {
                *a = fold(*a, *b);
            }
        }
    }

    write_elems(dest, &acc);
    if me < extras {
        let ep = rc.pe_of(me + r2);
        rc.ta.put(rc.h, dest, ep, bytes(&acc))?;
        rc.ta.quiet(rc.h)?;
        rc.signal(cells.at(RESULT), ep)?;
    }
    Ok(())
}

fn linear<T, F>(
    rc: &ReduceCtx<'_>,
    dest: SymAddr,
    src: SymAddr,
    n_elems: usize,
    fold: &F,
    cells: &Cells,
) -> Result<()>
where
    T: ShmemElem,
    F: Fn(T, T) -> T,
{
    let n = rc.n();
    if rc.me_as != 0 {
        rc.signal(cells.at(ARRIVE), rc.pe_of(0))?;
        rc.wait_ge(cells.at(RESULT), 1);
        return Ok(());
    }
    rc.wait_ge(cells.at(ARRIVE), n as i64 - 1);
    let mut acc: Vec<T> = read_elems(src, n_elems);
    let mut buf = vec![T::default(); n_elems];
    for i in 1..n {
        rc.ta.get(rc.h, bytes_mut(&mut buf), src, rc.pe_of(i))?;
        for (a, b) in acc.iter_mut().zip(&buf) {
            *a = fold(*a, *b);
        }
    }
    write_elems(dest, &acc);
    for i in 1..n {
        rc.ta.put(rc.h, dest, rc.pe_of(i), bytes(&acc))?;
    }
    rc.ta.quiet(rc.h)?;
    for i in 1..n {
        rc.signal(cells.at(RESULT), rc.pe_of(i))?;
    }
    Ok(())
}

fn tree<T, F>(
    rc: &ReduceCtx<'_>,
    dest: SymAddr,
    src: SymAddr,
    n_elems: usize,
    fold: &F,
    cells: &Cells,
) -> Result<()>
where
    T: ShmemElem,
    F: Fn(T, T) -> T,
{
    let me = rc.me_as;
    let (parent, children) = super::barrier::binomial_topology(me, rc.n());
    let mut acc: Vec<T> = read_elems(src, n_elems);

    if !children.is_empty() {
        // Each child parks its partial in its own dest, then checks in.
        rc.wait_ge(cells.at(ARRIVE), children.len() as i64);
        let mut buf = vec![T::default(); n_elems];
        for &c in &children {
            rc.ta.get(rc.h, bytes_mut(&mut buf), dest, rc.pe_of(c))?;
            for (a, b) in acc.iter_mut().zip(&buf) {
                *a = fold(*a, *b);
            }
        }
    }
    write_elems(dest, &acc);
    if let Some(p) = parent {
        rc.signal(cells.at(ARRIVE), rc.pe_of(p))?;
        rc.wait_ge(cells.at(RESULT), 1);
    }
    // dest now holds the final value; relay it down.
    let final_bytes =
        unsafe { std::slice::from_raw_parts(dest.as_ptr::<u8>(), n_elems * std::mem::size_of::<T>()) };
    for &c in &children {
        rc.ta.put(rc.h, dest, rc.pe_of(c), final_bytes)?;
    }
    if !children.is_empty() {
        rc.ta.quiet(rc.h)?;
        for &c in &children {
            rc.signal(cells.at(RESULT), rc.pe_of(c))?;
        }
    }
    Ok(())
}

/// Team reduction: scratch work array, pool slot cells, barrier syncs.
pub fn reduce_team<T, F>(
    cc: &CollCtx<'_>,
    algo: ReduceAlgo,
    dest: SymAddr,
    src: SymAddr,
    n_elems: usize,
    fold: F,
) -> Result<()>
where
    T: ShmemElem,
    F: Fn(T, T) -> T,
{
    if cc.nranks() <= 1 {
        if dest != src {
            local_copy(dest, src, n_elems * std::mem::size_of::<T>());
        }
        return Ok(());
    }
    let slot = cc.alloc_slot()?;
    let pwrk_elems = wrk_elems(n_elems);
    let pwrk = cc.scratch_alloc(pwrk_elems * std::mem::size_of::<T>())?;
    let rc = ReduceCtx {
        ta: cc.ta,
        h: cc.h,
        set: cc.team.set,
        me_as: cc.me_as,
    };
    let res = reduce_core(&rc, algo, dest, src, n_elems, &fold, slot.data_cell(0), pwrk, pwrk_elems);
    cc.team_sync()?;
    cc.scratch_free(pwrk);
    cc.free_slot(&slot);
    res
}

/// Active-set reduction over caller-provided `psync` (>= 32 zeroed
/// cells) and `pwrk` (>= `wrk_elems(n_elems)` elements). The pSync must
/// not be reused until every member returns.
#[allow(clippy::too_many_arguments)]
pub fn reduce_active_set<T, F>(
    rc: &ReduceCtx<'_>,
    algo: ReduceAlgo,
    dest: SymAddr,
    src: SymAddr,
    n_elems: usize,
    fold: F,
    psync: SymAddr,
    pwrk: SymAddr,
    pwrk_elems: usize,
) -> Result<()>
where
    T: ShmemElem,
    F: Fn(T, T) -> T,
{
    reduce_core(rc, algo, dest, src, n_elems, &fold, psync, pwrk, pwrk_elems)?;
    if rc.n() > 1 {
        psync_sync(rc, &Cells(psync))?;
    }
    Ok(())
}

/// One-shot dissemination sync in the closing cells of the pSync.
fn psync_sync(rc: &ReduceCtx<'_>, cells: &Cells) -> Result<()> {
    let n = rc.n();
    let rounds = (usize::BITS - (n - 1).leading_zeros()) as usize;
    if rounds > SYNC_CELLS {
        return Err(Error::AlgoUnsupported {
            algo: "reduce",
            reason: format!("active set of {n} exceeds the pSync sync cells"),
        });
    }
    for r in 0..rounds {
        let peer = (rc.me_as + (1 << r)) % n;
        rc.signal(cells.at(SYNC_BASE + r), rc.pe_of(peer))?;
        rc.wait_ge(cells.at(SYNC_BASE + r), 1);
    }
    cells.reset(rc.ta, SYNC_BASE, SYNC_BASE + rounds);
    Ok(())
}
