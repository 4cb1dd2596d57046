//! Launcher contract: identity and key-value wire-up
//!
//! The runtime consumes rank/size/node topology from the launcher and
//! publishes worker addresses, heap bases and remote keys through its
//! kv exchange before reading peers' entries back.

use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::{Arc, Barrier};

/// Process-launch services (PMI-style).
pub trait Launcher: Send + Sync {
    /// This PE's rank in `[0, nranks)`.
    fn rank(&self) -> usize;
    /// Total number of PEs in the job.
    fn nranks(&self) -> usize;
    /// Over-provisioned universe size, when the launcher has one.
    fn universe(&self) -> usize {
        self.nranks()
    }
    /// Ranks co-located on this node, self included, ascending.
    fn node_peers(&self) -> Vec<usize>;

    /// Publish a value under this PE's namespace.
    fn kv_put(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Read a value published by `peer`.
    fn kv_get(&self, peer: usize, key: &str) -> Result<Vec<u8>>;
    /// All PEs arrive before any proceeds; published entries are
    /// visible afterwards.
    fn exchange_barrier(&self);
}

struct KvStore {
    entries: Mutex<HashMap<(usize, String), Vec<u8>>>,
    published: Condvar,
}

/// Shared state for an in-process launcher serving `npes` PE threads.
pub struct LocalExchange {
    npes: usize,
    kv: KvStore,
    barrier: Barrier,
}

impl LocalExchange {
    pub fn new(npes: usize) -> Arc<Self> {
        Arc::new(Self {
            npes,
            kv: KvStore {
                entries: Mutex::new(HashMap::new()),
                published: Condvar::new(),
            },
            barrier: Barrier::new(npes),
        })
    }

    pub fn launcher_for(self: &Arc<Self>, rank: usize) -> LocalLauncher {
        LocalLauncher {
            exchange: Arc::clone(self),
            rank,
        }
    }
}

/// In-process launcher: every PE is a thread of this process, so the
/// whole job is one node.
pub struct LocalLauncher {
    exchange: Arc<LocalExchange>,
    rank: usize,
}

impl Launcher for LocalLauncher {
    fn rank(&self) -> usize {
        self.rank
    }

    fn nranks(&self) -> usize {
        self.exchange.npes
    }

    fn node_peers(&self) -> Vec<usize> {
        (0..self.exchange.npes).collect()
    }

    fn kv_put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.exchange.kv.entries.lock();
        entries.insert((self.rank, key.to_string()), value.to_vec());
        self.exchange.kv.published.notify_all();
        Ok(())
    }

    fn kv_get(&self, peer: usize, key: &str) -> Result<Vec<u8>> {
        if peer >= self.exchange.npes {
            return Err(Error::BadArg(format!("kv_get from bad pe {peer}")));
        }
        let k = (peer, key.to_string());
        let mut entries = self.exchange.kv.entries.lock();
        loop {
            if let Some(v) = entries.get(&k) {
                return Ok(v.clone());
            }
            self.exchange.kv.published.wait(&mut entries);
        }
    }

    fn exchange_barrier(&self) {
        self.exchange.barrier.wait();
    }
}
