//! The runtime object: init, wire-up, typed entry points, finalize

use crate::coll::{self, alltoall, barrier, broadcast, collect, reduce, CollCtx};
use crate::config::{Config, ReduceOpKind, SyncAlgo, ThreadLevel};
use crate::context::{Context, ContextEngine, CtxHandle};
use crate::elem::{as_bytes, as_bytes_mut, ArithElem, AtomicElem, BitElem, OrdElem, ShmemElem};
use crate::heap::HeapTable;
use crate::launch::Launcher;
use crate::logger;
use crate::psync::{pool_bytes, PsyncPool};
use crate::region::{PeSpan, RegionTable, SymAddr};
use crate::segment::HeapSegment;
use crate::team::{ActiveSet, Team, TeamId, TEAM_SHARED, TEAM_WORLD};
use crate::transport::{AmoOp, CommHandle, Fabric, TransportAdapter, WorkerHandle};
use crate::{Error, Result};
use log::{info, warn};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DEFAULT_HEAP: usize = 0;

/// Background progress poller, stopped through a shared flag.
struct ProgressThread {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ProgressThread {
    fn start(fabric: Arc<dyn Fabric>, worker: WorkerHandle, delay_ns: u64) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("symm-progress".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    fabric.progress(worker);
                    std::thread::sleep(std::time::Duration::from_nanos(delay_ns));
                }
            })
            .map_err(|e| warn!(target: "symm_core::runtime", "no progress thread: {e}"))
            .ok();
        Self { stop, handle }
    }

    fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn encode_span(base: usize, len: usize, rkey: u64) -> [u8; 24] {
    let mut b = [0u8; 24];
    b[..8].copy_from_slice(&(base as u64).to_le_bytes());
    b[8..16].copy_from_slice(&(len as u64).to_le_bytes());
    b[16..].copy_from_slice(&rkey.to_le_bytes());
    b
}

fn decode_span(b: &[u8]) -> Result<PeSpan> {
    if b.len() != 24 {
        return Err(Error::Internal(format!("segment kv entry of {} bytes", b.len())));
    }
    let word = |i: usize| u64::from_le_bytes(b[i..i + 8].try_into().unwrap_or([0; 8]));
    let base = word(0) as usize;
    Ok(PeSpan {
        base,
        end: base + word(8) as usize,
        rkey: word(16),
    })
}

/// Derive a `(start, stride, size)` view of the node-peer list, falling
/// back to a self-only set when the list is not regularly strided.
fn derive_set(peers: &[usize], me: usize) -> ActiveSet {
    match peers {
        [] | [_] => ActiveSet { start: me, stride: 1, size: 1 },
        [first, second, rest @ ..] => {
            let stride = second - first;
            let regular = stride >= 1
                && rest
                    .iter()
                    .zip(std::iter::once(second).chain(rest.iter()))
                    .all(|(b, a)| b - a == stride);
            if regular {
                ActiveSet { start: *first, stride, size: peers.len() }
            } else {
                ActiveSet { start: me, stride: 1, size: 1 }
            }
        }
    }
}

/// The per-PE runtime: one instance owns this PE's symmetric heap,
/// transport wiring, context engine, teams and pSync pool.
pub struct Runtime {
    config: Config,
    my_pe: usize,
    npes: usize,
    node_peers: Vec<usize>,
    launcher: Box<dyn Launcher>,
    _segment: HeapSegment,
    heaps: HeapTable,
    regions: Arc<RegionTable>,
    ta: TransportAdapter,
    peer_worker_addrs: Vec<Vec<u8>>,
    default_worker: WorkerHandle,
    ctxts: ContextEngine,
    world: Arc<Team>,
    shared: Arc<Team>,
    pool: PsyncPool,
    thread_level: ThreadLevel,
    comm_lock: Mutex<()>,
    progress: Option<ProgressThread>,
}

impl Runtime {
    /// Bring the PE up with `ThreadLevel::Single`.
    pub fn init(config: Config, launcher: Box<dyn Launcher>, fabric: Arc<dyn Fabric>) -> Result<Self> {
        Self::init_thread(config, launcher, fabric, ThreadLevel::Single)
    }

    /// Full init: create the heap segment, publish and read back wire-up
    /// data, connect endpoints and stand up teams. Collective across
    /// the job; no PE returns before every PE is reachable.
    pub fn init_thread(
        config: Config,
        launcher: Box<dyn Launcher>,
        fabric: Arc<dyn Fabric>,
        thread_level: ThreadLevel,
    ) -> Result<Self> {
        let my_pe = launcher.rank();
        let npes = launcher.nranks();
        logger::install(&config, my_pe, npes);
        if my_pe == 0 {
            if config.print_version {
                eprintln!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            }
            if config.print_info {
                eprintln!("symmetric heap {}", crate::config::format_size(config.symmetric_size));
                eprintln!("barrier {:?}, reduce {:?}", config.algos.barrier, config.algos.reduce[0]);
                eprintln!("alltoall {}", config.algos.alltoall.name());
                eprintln!("progress {:?}", config.progress);
            }
        }

        let seg_len = config.symmetric_size + pool_bytes();
        let seg_name = format!("symm-{}-{my_pe}", std::process::id());
        let segment = HeapSegment::create(config.heap_backing, &seg_name, seg_len)?;
        let base = segment.base();

        let hook_fabric = Arc::clone(&fabric);
        let heaps = HeapTable::new(
            1,
            config.memerr_fatal,
            Some(Arc::new(move |msg: &str| hook_fabric.global_exit(1, msg))),
        );
        heaps.init_by_index(DEFAULT_HEAP, "default", base, config.symmetric_size)?;

        let regions = Arc::new(RegionTable::new(my_pe));
        // Globals area: nothing symmetric outside the heap in this
        // process model, so region 0 is an empty placeholder.
        regions.register(vec![PeSpan { base: 0, end: 0, rkey: 0 }; npes]);

        let default_worker = fabric
            .create_worker()
            .map_err(|e| Error::Transport(e.to_string()))?;
        let my_addr = fabric
            .worker_address(default_worker)
            .map_err(|e| Error::Transport(e.to_string()))?;
        launcher.kv_put("worker", &my_addr)?;
        launcher.kv_put("segment", &encode_span(base, seg_len, 0))?;
        launcher.exchange_barrier();

        let mut peer_worker_addrs = Vec::with_capacity(npes);
        let mut spans = Vec::with_capacity(npes);
        for pe in 0..npes {
            peer_worker_addrs.push(launcher.kv_get(pe, "worker")?);
            spans.push(decode_span(&launcher.kv_get(pe, "segment")?)?);
        }
        regions.register(spans);

        let ta = TransportAdapter::new(Arc::clone(&fabric), Arc::clone(&regions));
        let h = CommHandle { worker: default_worker, no_store: false };
        ta.make_endpoints(h, npes)?;
        ta.wireup(h, &peer_worker_addrs)?;

        let pool = PsyncPool::new(SymAddr(base + config.symmetric_size), my_pe);
        let world = Arc::new(Team::new(
            TEAM_WORLD,
            "world",
            ActiveSet { start: 0, stride: 1, size: npes },
        ));
        let node_peers = launcher.node_peers();
        let shared = Arc::new(Team::new(TEAM_SHARED, "shared", derive_set(&node_peers, my_pe)));

        let progress = config
            .progress
            .applies_to(my_pe)
            .then(|| ProgressThread::start(Arc::clone(&fabric), default_worker, config.progress_delay_ns));

        let rt = Self {
            ctxts: ContextEngine::new(config.prealloc_ctxs),
            config,
            my_pe,
            npes,
            node_peers,
            launcher,
            _segment: segment,
            heaps,
            regions,
            ta,
            peer_worker_addrs,
            default_worker,
            world,
            shared,
            pool,
            thread_level,
            comm_lock: Mutex::new(()),
            progress,
        };
        rt.launcher.exchange_barrier();
        info!(target: "symm_core::runtime", "pe {my_pe}/{npes} up");
        Ok(rt)
    }

    pub fn my_pe(&self) -> usize {
        self.my_pe
    }

    pub fn n_pes(&self) -> usize {
        self.npes
    }

    pub fn node_peers(&self) -> &[usize] {
        &self.node_peers
    }

    pub fn thread_level(&self) -> ThreadLevel {
        self.thread_level
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn guard(&self) -> Option<MutexGuard<'_, ()>> {
        (self.thread_level == ThreadLevel::Multiple).then(|| self.comm_lock.lock())
    }

    fn default_comm(&self) -> CommHandle {
        CommHandle { worker: self.default_worker, no_store: false }
    }

    /// Resolve a handle to an issuing context, enforcing the private
    /// context ownership rule.
    fn resolve(&self, ctx: CtxHandle) -> Result<CommHandle> {
        match ctx {
            CtxHandle::Default => Ok(self.default_comm()),
            CtxHandle::Id(team, id) => {
                let c = self.ctxts.lookup(team, id)?;
                self.check_private(&c);
                Ok(c.comm())
            }
        }
    }

    fn check_private(&self, c: &Context) {
        if c.is_private() && c.creator != std::thread::current().id() {
            self.ta.fatal(&Error::ThreadViolation(c.id).to_string());
        }
    }

    fn team(&self, id: TeamId) -> Result<&Arc<Team>> {
        match id {
            TEAM_WORLD => Ok(&self.world),
            TEAM_SHARED => Ok(&self.shared),
            TeamId(other) => Err(Error::BadArg(format!("unknown team {other}"))),
        }
    }

    fn coll_ctx<'a>(&'a self, team: &'a Team) -> Result<CollCtx<'a>> {
        Ok(CollCtx {
            ta: &self.ta,
            h: self.default_comm(),
            pool: &self.pool,
            heap: &self.heaps,
            heap_index: DEFAULT_HEAP,
            team,
            me_as: team.my_rank(self.my_pe)?,
            sync_algo: self.config.algos.team_sync,
        })
    }

    // ---- symmetric memory -------------------------------------------------

    /// Collective allocation; every PE gets the same heap offset and no
    /// PE returns before all have allocated.
    pub fn malloc(&self, size: usize) -> Result<SymAddr> {
        let addr = self.heaps.malloc_by_index(DEFAULT_HEAP, size)?;
        self.barrier_all()?;
        Ok(SymAddr(addr))
    }

    pub fn calloc(&self, count: usize, size: usize) -> Result<SymAddr> {
        let addr = self.heaps.calloc_by_index(DEFAULT_HEAP, count, size)?;
        self.barrier_all()?;
        Ok(SymAddr(addr))
    }

    pub fn memalign(&self, align: usize, size: usize) -> Result<SymAddr> {
        let addr = self.heaps.memalign_by_index(DEFAULT_HEAP, align, size)?;
        self.barrier_all()?;
        Ok(SymAddr(addr))
    }

    pub fn realloc(&self, addr: SymAddr, size: usize) -> Result<SymAddr> {
        let fresh = self.heaps.realloc_by_index(DEFAULT_HEAP, addr.addr(), size)?;
        self.barrier_all()?;
        Ok(SymAddr(fresh))
    }

    /// Collective free; pending remote accesses drain at the barrier
    /// before the block is reusable.
    pub fn free(&self, addr: SymAddr) -> Result<()> {
        self.barrier_all()?;
        self.heaps.free_by_index(DEFAULT_HEAP, addr.addr())
    }

    pub fn heap_bytes_in_use(&self) -> Result<usize> {
        self.heaps.bytes_in_use(DEFAULT_HEAP)
    }

    pub fn addr_accessible(&self, addr: SymAddr, pe: usize) -> bool {
        self.regions.is_addr_accessible(addr, pe)
    }

    // ---- RMA --------------------------------------------------------------

    pub fn put<T: ShmemElem>(&self, dest: SymAddr, src: &[T], pe: usize) -> Result<()> {
        let _g = self.guard();
        self.ta.put(self.default_comm(), dest, pe, as_bytes(src))
    }

    pub fn get<T: ShmemElem>(&self, dest: &mut [T], src: SymAddr, pe: usize) -> Result<()> {
        let _g = self.guard();
        self.ta.get(self.default_comm(), as_bytes_mut(dest), src, pe)
    }

    /// Single-element put.
    pub fn p<T: ShmemElem>(&self, dest: SymAddr, value: T, pe: usize) -> Result<()> {
        self.put(dest, &[value], pe)
    }

    /// Single-element get.
    pub fn g<T: ShmemElem>(&self, src: SymAddr, pe: usize) -> Result<T> {
        let mut v = [T::default()];
        self.get(&mut v, src, pe)?;
        Ok(v[0])
    }

    /// Payload put followed by an atomic add of `value` on the remote
    /// signal word once the payload is delivered.
    pub fn put_signal<T: ShmemElem>(
        &self,
        dest: SymAddr,
        src: &[T],
        sig: SymAddr,
        value: i64,
        pe: usize,
    ) -> Result<()> {
        let _g = self.guard();
        self.ta
            .put_signal_nb(self.default_comm(), dest, pe, as_bytes(src), sig, value)
    }

    pub fn fence(&self) -> Result<()> {
        let _g = self.guard();
        self.ta.fence(self.default_comm())
    }

    pub fn quiet(&self) -> Result<()> {
        let _g = self.guard();
        self.ta.quiet(self.default_comm())
    }

    /// Spin on a local symmetric i64 until `pred` holds.
    pub fn wait_until(&self, addr: SymAddr, pred: impl Fn(i64) -> bool) {
        self.ta.wait_until(self.default_comm(), addr, pred);
    }

    // ---- atomics ----------------------------------------------------------

    fn amo<T: AtomicElem>(&self, op: AmoOp, target: SymAddr, pe: usize, v: T, cmp: T) -> Result<T> {
        let _g = self.guard();
        self.ta.amo(self.default_comm(), op, target, pe, v, cmp)
    }

    pub fn atomic_fetch_add<T: AtomicElem>(&self, t: SymAddr, pe: usize, v: T) -> Result<T> {
        self.amo(AmoOp::FetchAdd, t, pe, v, T::default())
    }

    pub fn atomic_add<T: AtomicElem>(&self, t: SymAddr, pe: usize, v: T) -> Result<()> {
        self.atomic_fetch_add(t, pe, v).map(drop)
    }

    pub fn atomic_fetch_and<T: AtomicElem>(&self, t: SymAddr, pe: usize, v: T) -> Result<T> {
        self.amo(AmoOp::FetchAnd, t, pe, v, T::default())
    }

    pub fn atomic_fetch_or<T: AtomicElem>(&self, t: SymAddr, pe: usize, v: T) -> Result<T> {
        self.amo(AmoOp::FetchOr, t, pe, v, T::default())
    }

    pub fn atomic_fetch_xor<T: AtomicElem>(&self, t: SymAddr, pe: usize, v: T) -> Result<T> {
        self.amo(AmoOp::FetchXor, t, pe, v, T::default())
    }

    pub fn atomic_swap<T: AtomicElem>(&self, t: SymAddr, pe: usize, v: T) -> Result<T> {
        self.amo(AmoOp::Swap, t, pe, v, T::default())
    }

    pub fn atomic_set<T: AtomicElem>(&self, t: SymAddr, pe: usize, v: T) -> Result<()> {
        self.atomic_swap(t, pe, v).map(drop)
    }

    pub fn atomic_compare_swap<T: AtomicElem>(
        &self,
        t: SymAddr,
        pe: usize,
        cond: T,
        value: T,
    ) -> Result<T> {
        self.amo(AmoOp::CompareSwap, t, pe, value, cond)
    }

    pub fn atomic_fetch<T: AtomicElem>(&self, t: SymAddr, pe: usize) -> Result<T> {
        self.amo(AmoOp::Fetch, t, pe, T::default(), T::default())
    }

    // ---- contexts ---------------------------------------------------------

    /// Create a context on the world team. `attrs` is a bitmask of
    /// `CTX_SERIALIZED`, `CTX_PRIVATE`, `CTX_NOSTORE`.
    pub fn ctx_create(&self, attrs: u32) -> Result<CtxHandle> {
        let _g = self.guard();
        let c = self
            .ctxts
            .create(TEAM_WORLD, attrs, &self.ta, self.npes, &self.peer_worker_addrs)?;
        Ok(CtxHandle::Id(TEAM_WORLD, c.id))
    }

    /// Destroying the default context is a structural failure.
    pub fn ctx_destroy(&self, ctx: CtxHandle) -> Result<()> {
        let _g = self.guard();
        match ctx {
            CtxHandle::Default => self.ta.fatal("attempt to destroy the default context"),
            CtxHandle::Id(team, id) => {
                let c = self.ctxts.lookup(team, id)?;
                self.check_private(&c);
                self.ctxts.destroy(team, id, &self.ta)
            }
        }
    }

    pub fn ctx_put<T: ShmemElem>(&self, ctx: CtxHandle, dest: SymAddr, src: &[T], pe: usize) -> Result<()> {
        let h = self.resolve(ctx)?;
        let _g = self.guard();
        self.ta.put(h, dest, pe, as_bytes(src))
    }

    pub fn ctx_get<T: ShmemElem>(&self, ctx: CtxHandle, dest: &mut [T], src: SymAddr, pe: usize) -> Result<()> {
        let h = self.resolve(ctx)?;
        let _g = self.guard();
        self.ta.get(h, as_bytes_mut(dest), src, pe)
    }

    pub fn ctx_fence(&self, ctx: CtxHandle) -> Result<()> {
        let h = self.resolve(ctx)?;
        self.ta.fence(h)
    }

    pub fn ctx_quiet(&self, ctx: CtxHandle) -> Result<()> {
        let h = self.resolve(ctx)?;
        self.ta.quiet(h)
    }

    /// Ever-used context slots on a team.
    pub fn ctx_count(&self, team: TeamId) -> usize {
        self.ctxts.nctxts(team)
    }

    // ---- teams ------------------------------------------------------------

    pub fn team_my_pe(&self, id: TeamId) -> Result<usize> {
        self.team(id)?.my_rank(self.my_pe)
    }

    pub fn team_n_pes(&self, id: TeamId) -> Result<usize> {
        Ok(self.team(id)?.nranks())
    }

    pub fn team_translate(&self, src: TeamId, rank: usize, dest: TeamId) -> Result<Option<usize>> {
        Ok(self.team(src)?.translate_pe(rank, self.team(dest)?))
    }

    // ---- collectives ------------------------------------------------------

    fn sync_team(&self, id: TeamId, algo: SyncAlgo) -> Result<()> {
        let team = self.team(id)?;
        let cc = self.coll_ctx(team)?;
        barrier::sync(&cc, algo)
    }

    /// Quiet the default context, then synchronize the world.
    pub fn barrier_all(&self) -> Result<()> {
        let _g = self.guard();
        self.ta.quiet(self.default_comm())?;
        self.sync_team(TEAM_WORLD, self.config.algos.barrier_all)
    }

    pub fn sync_all(&self) -> Result<()> {
        let _g = self.guard();
        self.sync_team(TEAM_WORLD, self.config.algos.sync_all)
    }

    pub fn barrier(&self, id: TeamId) -> Result<()> {
        let _g = self.guard();
        self.ta.quiet(self.default_comm())?;
        self.sync_team(id, self.config.algos.barrier)
    }

    pub fn sync(&self, id: TeamId) -> Result<()> {
        let _g = self.guard();
        self.sync_team(id, self.config.algos.sync)
    }

    pub fn broadcast<T: ShmemElem>(
        &self,
        id: TeamId,
        dest: SymAddr,
        src: SymAddr,
        nelems: usize,
        root: usize,
    ) -> Result<()> {
        let _g = self.guard();
        let cc = self.coll_ctx(self.team(id)?)?;
        broadcast::broadcast_mem(
            &cc,
            self.config.algos.broadcast,
            dest,
            src,
            nelems * std::mem::size_of::<T>(),
            root,
        )
    }

    pub fn broadcast_mem(&self, id: TeamId, dest: SymAddr, src: SymAddr, nbytes: usize, root: usize) -> Result<()> {
        let _g = self.guard();
        let cc = self.coll_ctx(self.team(id)?)?;
        broadcast::broadcast_mem(&cc, self.config.algos.broadcastmem, dest, src, nbytes, root)
    }

    pub fn fcollect<T: ShmemElem>(&self, id: TeamId, dest: SymAddr, src: SymAddr, nelems: usize) -> Result<()> {
        let _g = self.guard();
        let cc = self.coll_ctx(self.team(id)?)?;
        collect::fcollect_mem(&cc, self.config.algos.fcollect, dest, src, nelems * std::mem::size_of::<T>())
    }

    pub fn fcollect_mem(&self, id: TeamId, dest: SymAddr, src: SymAddr, nbytes: usize) -> Result<()> {
        let _g = self.guard();
        let cc = self.coll_ctx(self.team(id)?)?;
        collect::fcollect_mem(&cc, self.config.algos.fcollectmem, dest, src, nbytes)
    }

    pub fn collect<T: ShmemElem>(&self, id: TeamId, dest: SymAddr, src: SymAddr, nelems: usize) -> Result<()> {
        let _g = self.guard();
        let cc = self.coll_ctx(self.team(id)?)?;
        collect::collect_mem(&cc, self.config.algos.collect, dest, src, nelems * std::mem::size_of::<T>())
    }

    pub fn collect_mem(&self, id: TeamId, dest: SymAddr, src: SymAddr, nbytes: usize) -> Result<()> {
        let _g = self.guard();
        let cc = self.coll_ctx(self.team(id)?)?;
        collect::collect_mem(&cc, self.config.algos.collectmem, dest, src, nbytes)
    }

    pub fn alltoall<T: ShmemElem>(&self, id: TeamId, dest: SymAddr, src: SymAddr, nelems: usize) -> Result<()> {
        let _g = self.guard();
        let team = self.team(id)?;
        let cc = self.coll_ctx(team)?;
        let block = nelems * std::mem::size_of::<T>();
        if dest != src {
            coll::check_no_overlap(self.config.debug_checks, dest, team.nranks() * block, src, team.nranks() * block)?;
        }
        alltoall::alltoall_mem(&cc, self.config.algos.alltoall, dest, src, block)
    }

    pub fn alltoall_mem(&self, id: TeamId, dest: SymAddr, src: SymAddr, nbytes: usize) -> Result<()> {
        let _g = self.guard();
        let cc = self.coll_ctx(self.team(id)?)?;
        alltoall::alltoall_mem(&cc, self.config.algos.alltoallmem, dest, src, nbytes)
    }

    /// Strided alltoall; strides are in elements of `T`.
    pub fn alltoalls<T: ShmemElem>(
        &self,
        id: TeamId,
        dest: SymAddr,
        src: SymAddr,
        dst: usize,
        sst: usize,
        nelems: usize,
    ) -> Result<()> {
        let _g = self.guard();
        let cc = self.coll_ctx(self.team(id)?)?;
        alltoall::alltoalls_mem(
            &cc,
            self.config.algos.alltoalls,
            dest,
            src,
            dst,
            sst,
            nelems,
            std::mem::size_of::<T>(),
        )
    }

    // ---- reductions -------------------------------------------------------

    fn reduce_team<T, F>(&self, id: TeamId, op: ReduceOpKind, dest: SymAddr, src: SymAddr, n: usize, fold: F) -> Result<()>
    where
        T: ShmemElem,
        F: Fn(T, T) -> T,
    {
        let _g = self.guard();
        let cc = self.coll_ctx(self.team(id)?)?;
        reduce::reduce_team(&cc, self.config.algos.reduce[op as usize], dest, src, n, fold)
    }

    pub fn sum_reduce<T: ArithElem>(&self, id: TeamId, dest: SymAddr, src: SymAddr, n: usize) -> Result<()> {
        self.reduce_team(id, ReduceOpKind::Sum, dest, src, n, T::add)
    }

    pub fn prod_reduce<T: ArithElem>(&self, id: TeamId, dest: SymAddr, src: SymAddr, n: usize) -> Result<()> {
        self.reduce_team(id, ReduceOpKind::Prod, dest, src, n, T::mul)
    }

    pub fn max_reduce<T: OrdElem>(&self, id: TeamId, dest: SymAddr, src: SymAddr, n: usize) -> Result<()> {
        self.reduce_team(id, ReduceOpKind::Max, dest, src, n, T::max_v)
    }

    pub fn min_reduce<T: OrdElem>(&self, id: TeamId, dest: SymAddr, src: SymAddr, n: usize) -> Result<()> {
        self.reduce_team(id, ReduceOpKind::Min, dest, src, n, T::min_v)
    }

    pub fn and_reduce<T: BitElem>(&self, id: TeamId, dest: SymAddr, src: SymAddr, n: usize) -> Result<()> {
        self.reduce_team(id, ReduceOpKind::And, dest, src, n, T::band)
    }

    pub fn or_reduce<T: BitElem>(&self, id: TeamId, dest: SymAddr, src: SymAddr, n: usize) -> Result<()> {
        self.reduce_team(id, ReduceOpKind::Or, dest, src, n, T::bor)
    }

    pub fn xor_reduce<T: BitElem>(&self, id: TeamId, dest: SymAddr, src: SymAddr, n: usize) -> Result<()> {
        self.reduce_team(id, ReduceOpKind::Xor, dest, src, n, T::bxor)
    }

    /// Legacy active-set reduction over caller-provided pSync and pWrk.
    #[allow(clippy::too_many_arguments)]
    pub fn reduce_to_all<T, F>(
        &self,
        op: ReduceOpKind,
        set: ActiveSet,
        dest: SymAddr,
        src: SymAddr,
        n: usize,
        fold: F,
        psync: SymAddr,
        pwrk: SymAddr,
        pwrk_elems: usize,
    ) -> Result<()>
    where
        T: ShmemElem,
        F: Fn(T, T) -> T,
    {
        let _g = self.guard();
        let me_as = set
            .as_rank(self.my_pe)
            .ok_or_else(|| Error::BadArg(format!("pe {} outside the active set", self.my_pe)))?;
        let rc = reduce::ReduceCtx {
            ta: &self.ta,
            h: self.default_comm(),
            set,
            me_as,
        };
        reduce::reduce_active_set(
            &rc,
            self.config.algos.reduce[op as usize],
            dest,
            src,
            n,
            fold,
            psync,
            pwrk,
            pwrk_elems,
        )
    }

    /// Abend the whole job.
    pub fn global_exit(&self, code: i32) -> ! {
        self.ta.fabric().global_exit(code, "global exit requested")
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Skip the collective quiesce while unwinding; peers may be gone.
        if !std::thread::panicking() {
            let _ = self.barrier_all();
        }
        if let Some(p) = self.progress.take() {
            p.shutdown();
        }
        self.ctxts.finalize(&self.ta);
        let h = self.default_comm();
        self.ta.destroy_endpoints(h);
        self.ta.fabric().destroy_worker(self.default_worker);
        self.heaps.finalize();
        if !std::thread::panicking() {
            // Segment stays mapped until every peer is done with it.
            self.launcher.exchange_barrier();
        }
    }
}
