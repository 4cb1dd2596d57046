//! Context engine: creation, pooling and reuse of comm contexts

use crate::team::TeamId;
use crate::transport::{CommHandle, TransportAdapter, WorkerHandle};
use crate::{Error, Result};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;

/// Context attribute bits.
pub const CTX_SERIALIZED: u32 = 1 << 0;
pub const CTX_PRIVATE: u32 = 1 << 1;
pub const CTX_NOSTORE: u32 = 1 << 2;

/// User-visible context handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxHandle {
    /// The runtime's static default context.
    Default,
    /// A created context: (team, slot index).
    Id(TeamId, usize),
}

/// One communication context: a progress worker plus attributes.
pub struct Context {
    pub id: usize,
    pub team: TeamId,
    pub worker: WorkerHandle,
    pub attrs: u32,
    pub creator: ThreadId,
}

impl Context {
    pub fn comm(&self) -> CommHandle {
        CommHandle {
            worker: self.worker,
            no_store: self.attrs & CTX_NOSTORE != 0,
        }
    }

    pub fn is_private(&self) -> bool {
        self.attrs & CTX_PRIVATE != 0
    }

    pub fn is_serialized(&self) -> bool {
        self.attrs & CTX_SERIALIZED != 0
    }
}

/// Per-team slot table. `nctxts` is the ever-used watermark; capacity
/// is the spill point, grown by `spill_block` slots at a time.
struct CtxTable {
    ctxts: Vec<Option<Arc<Context>>>,
    nctxts: usize,
    freelist: Vec<usize>,
}

/// Creates, pools and destroys contexts. All tables and the freelists
/// are mutated under one engine-wide mutex.
pub struct ContextEngine {
    spill_block: usize,
    tables: Mutex<HashMap<usize, CtxTable>>,
}

impl ContextEngine {
    pub fn new(prealloc: usize) -> Self {
        Self {
            spill_block: prealloc.max(1),
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Pop a reusable slot or mint a fresh one. Returns the slot index
    /// and whether it carries a prior context's worker.
    fn get_usable(&self, team: TeamId) -> (usize, bool, Option<WorkerHandle>) {
        let mut tables = self.tables.lock();
        let table = tables.entry(team.0).or_insert_with(|| CtxTable {
            ctxts: {
                let mut v = Vec::new();
                v.resize_with(self.spill_block, || None);
                v
            },
            nctxts: 0,
            freelist: Vec::new(),
        });
        if let Some(idx) = table.freelist.pop() {
            let worker = table.ctxts[idx].as_ref().map(|c| c.worker);
            return (idx, true, worker);
        }
        let idx = table.nctxts;
        if idx == table.ctxts.len() {
            let grow = self.spill_block;
            table.ctxts.resize_with(idx + grow, || None);
        }
        table.nctxts += 1;
        (idx, false, None)
    }

    /// Create a context on `team`. Fresh contexts get a new worker,
    /// endpoints to every PE and a wire-up pass; wire-up failure is
    /// fatal. Reused slots keep their worker and only take the new
    /// attributes and creator.
    pub fn create(
        &self,
        team: TeamId,
        attrs: u32,
        ta: &TransportAdapter,
        npes: usize,
        peer_worker_addrs: &[Vec<u8>],
    ) -> Result<Arc<Context>> {
        let (idx, reused, prior_worker) = self.get_usable(team);

        let worker = match prior_worker {
            Some(w) if reused => w,
            _ => {
                let w = ta
                    .fabric()
                    .create_worker()
                    .map_err(|e| Error::Transport(e.to_string()))?;
                let h = CommHandle {
                    worker: w,
                    no_store: false,
                };
                ta.progress(h);
                ta.make_endpoints(h, npes)
                    .and_then(|_| ta.wireup(h, peer_worker_addrs))
                    .unwrap_or_else(|e| ta.fatal(&format!("context wire-up failed: {e}")));
                w
            }
        };

        let ctx = Arc::new(Context {
            id: idx,
            team,
            worker,
            attrs,
            creator: std::thread::current().id(),
        });
        self.tables
            .lock()
            .get_mut(&team.0)
            .expect("table exists after get_usable")
            .ctxts[idx] = Some(Arc::clone(&ctx));
        debug!(target: "symm_core::context", "create ctx {idx} on team {} (reused={reused})", team.0);
        Ok(ctx)
    }

    /// Resolve a handle to its live context.
    pub fn lookup(&self, team: TeamId, id: usize) -> Result<Arc<Context>> {
        self.tables
            .lock()
            .get(&team.0)
            .and_then(|t| t.ctxts.get(id))
            .and_then(|c| c.clone())
            .ok_or_else(|| Error::BadArg(format!("no context {id} on team {}", team.0)))
    }

    /// Quiet the context and return its slot to the freelist. The
    /// object stays allocated for reuse.
    pub fn destroy(&self, team: TeamId, id: usize, ta: &TransportAdapter) -> Result<()> {
        let ctx = self.lookup(team, id)?;
        ta.quiet(ctx.comm())?;
        let mut tables = self.tables.lock();
        let table = tables
            .get_mut(&team.0)
            .ok_or_else(|| Error::BadArg(format!("no context table for team {}", team.0)))?;
        if table.freelist.contains(&id) {
            return Err(Error::BadArg(format!("context {id} already destroyed")));
        }
        table.freelist.push(id);
        debug!(target: "symm_core::context", "destroy ctx {id} on team {}", team.0);
        Ok(())
    }

    /// Ever-used slot count for a team.
    pub fn nctxts(&self, team: TeamId) -> usize {
        self.tables
            .lock()
            .get(&team.0)
            .map(|t| t.nctxts)
            .unwrap_or(0)
    }

    /// Tear down every context's worker.
    pub fn finalize(&self, ta: &TransportAdapter) {
        let mut tables = self.tables.lock();
        for table in tables.values_mut() {
            for slot in table.ctxts.iter_mut() {
                if let Some(ctx) = slot.take() {
                    let h = ctx.comm();
                    ta.destroy_endpoints(h);
                    ta.fabric().destroy_worker(ctx.worker);
                }
            }
        }
        tables.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackFabric, LoopbackShared};
    use crate::region::RegionTable;
    use crate::team::TEAM_WORLD;
    use crate::transport::Fabric;

    fn adapter() -> (TransportAdapter, Vec<Vec<u8>>) {
        let shared = LoopbackShared::new(1);
        let fabric = Arc::new(LoopbackFabric::new(shared, 0));
        let probe = fabric.create_worker().unwrap();
        let addr = fabric.worker_address(probe).unwrap();
        let ta = TransportAdapter::new(fabric, Arc::new(RegionTable::new(0)));
        (ta, vec![addr])
    }

    #[test]
    fn freelist_reuses_most_recent_id() {
        let (ta, addrs) = adapter();
        let eng = ContextEngine::new(4);
        let a = eng.create(TEAM_WORLD, 0, &ta, 1, &addrs).unwrap();
        assert_eq!(a.id, 0);
        eng.destroy(TEAM_WORLD, a.id, &ta).unwrap();
        let b = eng.create(TEAM_WORLD, 0, &ta, 1, &addrs).unwrap();
        assert_eq!(b.id, 0, "destroyed id comes back first");
        let c = eng.create(TEAM_WORLD, 0, &ta, 1, &addrs).unwrap();
        assert_eq!(c.id, 1);
        assert_eq!(eng.nctxts(TEAM_WORLD), 2);
    }

    #[test]
    fn table_grows_past_spill_block() {
        let (ta, addrs) = adapter();
        let eng = ContextEngine::new(2);
        let ids: Vec<_> = (0..5)
            .map(|_| eng.create(TEAM_WORLD, 0, &ta, 1, &addrs).unwrap().id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn double_destroy_refused() {
        let (ta, addrs) = adapter();
        let eng = ContextEngine::new(2);
        let a = eng.create(TEAM_WORLD, 0, &ta, 1, &addrs).unwrap();
        eng.destroy(TEAM_WORLD, a.id, &ta).unwrap();
        assert!(eng.destroy(TEAM_WORLD, a.id, &ta).is_err());
    }

    #[test]
    fn attrs_flow_through() {
        let (ta, addrs) = adapter();
        let eng = ContextEngine::new(2);
        let c = eng
            .create(TEAM_WORLD, CTX_PRIVATE | CTX_NOSTORE, &ta, 1, &addrs)
            .unwrap();
        assert!(c.is_private());
        assert!(!c.is_serialized());
        assert!(c.comm().no_store);
    }
}
