//! Team sync algorithms over the dedicated barrier slot
//!
//! All variants use monotonic epoch counters: each sync bumps the
//! team's epoch for the chosen algorithm and waits for counters to
//! reach epoch-scaled targets, so cells never need resetting and there
//! is no reuse race between consecutive syncs. Each algorithm owns a
//! disjoint cell range of the barrier slot.

use crate::config::SyncAlgo;
use crate::coll::CollCtx;
use crate::{Error, Result};

const LINEAR_ARRIVE: usize = 0;
const LINEAR_RELEASE: usize = 1;
const TREE_ARRIVE: usize = 2;
const TREE_RELEASE: usize = 3;
const BINOMIAL_ARRIVE: usize = 4;
const BINOMIAL_RELEASE: usize = 5;
const DISSEM_BASE: usize = 6;
const DISSEM_MAX_ROUNDS: usize = 10;

const TREE_RADIX: usize = 2;

pub(crate) fn algo_slot(algo: SyncAlgo) -> usize {
    match algo {
        SyncAlgo::Linear => 0,
        SyncAlgo::Tree => 1,
        SyncAlgo::BinomialTree => 2,
        SyncAlgo::Dissemination => 3,
    }
}

/// Synchronize the team: returns once every member has entered and all
/// previously issued ops by members are complete everywhere.
pub fn sync(cc: &CollCtx<'_>, algo: SyncAlgo) -> Result<()> {
    let n = cc.nranks();
    if n <= 1 {
        return Ok(());
    }
    let epoch = cc.team.next_epoch(algo_slot(algo));
    match algo {
        SyncAlgo::Linear => linear(cc, epoch),
        SyncAlgo::Tree => counting_tree(cc, epoch, TREE_ARRIVE, TREE_RELEASE, tree_topology),
        SyncAlgo::BinomialTree => {
            counting_tree(cc, epoch, BINOMIAL_ARRIVE, BINOMIAL_RELEASE, binomial_topology)
        }
        SyncAlgo::Dissemination => dissemination(cc, epoch),
    }
}

fn linear(cc: &CollCtx<'_>, epoch: i64) -> Result<()> {
    let n = cc.nranks();
    let slot = cc.pool.barrier_slot(cc.team.psync_index);
    if cc.me_as != 0 {
        cc.signal(slot.cell(LINEAR_ARRIVE), cc.pe_of(0))?;
        cc.wait_ge(slot.cell(LINEAR_RELEASE), epoch);
    } else {
        cc.wait_ge(slot.cell(LINEAR_ARRIVE), (n as i64 - 1) * epoch);
        for i in 1..n {
            cc.signal(slot.cell(LINEAR_RELEASE), cc.pe_of(i))?;
        }
    }
    Ok(())
}

/// (parent, children) of a rank in an n-member tree.
type Topology = fn(usize, usize) -> (Option<usize>, Vec<usize>);

fn tree_topology(me: usize, n: usize) -> (Option<usize>, Vec<usize>) {
    let parent = (me != 0).then(|| (me - 1) / TREE_RADIX);
    let children = (1..=TREE_RADIX)
        .map(|c| TREE_RADIX * me + c)
        .filter(|&c| c < n)
        .collect();
    (parent, children)
}

pub(crate) fn binomial_topology(me: usize, n: usize) -> (Option<usize>, Vec<usize>) {
    let lsb = if me == 0 { usize::MAX } else { me & me.wrapping_neg() };
    let parent = (me != 0).then(|| me - (me & me.wrapping_neg()));
    let mut children = Vec::new();
    let mut bit = 1usize;
    while bit < lsb && me + bit < n {
        children.push(me + bit);
        match bit.checked_shl(1) {
            Some(b) => bit = b,
            None => break,
        }
    }
    (parent, children)
}

fn counting_tree(
    cc: &CollCtx<'_>,
    epoch: i64,
    arrive: usize,
    release: usize,
    topo: Topology,
) -> Result<()> {
    let n = cc.nranks();
    let slot = cc.pool.barrier_slot(cc.team.psync_index);
    let (parent, children) = topo(cc.me_as, n);

    // Gather: wait for the subtree, then report up.
    if !children.is_empty() {
        cc.wait_ge(slot.cell(arrive), children.len() as i64 * epoch);
    }
    if let Some(p) = parent {
        cc.signal(slot.cell(arrive), cc.pe_of(p))?;
        cc.wait_ge(slot.cell(release), epoch);
    }
    // Release: fan the wakeup back down.
    for c in children {
        cc.signal(slot.cell(release), cc.pe_of(c))?;
    }
    Ok(())
}

fn dissemination(cc: &CollCtx<'_>, epoch: i64) -> Result<()> {
    let n = cc.nranks();
    let rounds = (usize::BITS - (n - 1).leading_zeros()) as usize;
    if rounds > DISSEM_MAX_ROUNDS {
        return Err(Error::AlgoUnsupported {
            algo: "dissemination",
            reason: format!("team of {n} exceeds {DISSEM_MAX_ROUNDS} rounds"),
        });
    }
    let slot = cc.pool.barrier_slot(cc.team.psync_index);
    for r in 0..rounds {
        let peer = (cc.me_as + (1 << r)) % n;
        cc.signal(slot.cell(DISSEM_BASE + r), cc.pe_of(peer))?;
        cc.wait_ge(slot.cell(DISSEM_BASE + r), epoch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binomial_links_are_consistent() {
        for n in [2usize, 3, 4, 7, 8, 13] {
            for me in 0..n {
                let (parent, children) = binomial_topology(me, n);
                if me == 0 {
                    assert!(parent.is_none());
                } else {
                    let p = parent.unwrap();
                    let (_, pc) = binomial_topology(p, n);
                    assert!(pc.contains(&me), "n={n} me={me} parent={p}");
                }
                for c in children {
                    assert!(c < n);
                    assert_eq!(binomial_topology(c, n).0, Some(me));
                }
            }
        }
    }

    #[test]
    fn tree_covers_every_rank_once() {
        for n in [2usize, 5, 9, 16] {
            let mut seen = vec![0usize; n];
            seen[0] += 1;
            for me in 0..n {
                for c in tree_topology(me, n).1 {
                    seen[c] += 1;
                }
            }
            assert!(seen.iter().all(|&s| s == 1), "n={n}: {seen:?}");
        }
    }
}
