//! In-process loopback fabric and multi-PE world harness
//!
//! All PEs live in one address space as threads, so a translated
//! remote address is directly dereferenceable. Data moves by memcpy;
//! synchronization cells use real atomics with release/acquire pairing
//! so payloads are published race-free. Global exit maps to a thread
//! panic, which harnesses can observe.

use crate::config::Config;
use crate::launch::LocalExchange;
use crate::runtime::Runtime;
use crate::transport::{AmoOp, Fabric, FabricError, FabricResult, RemotePtr, WorkerHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

fn bad(msg: impl Into<String>) -> FabricError {
    FabricError {
        code: -1,
        msg: msg.into(),
    }
}

#[derive(Default)]
struct WorkerState {
    endpoints: usize,
    wired: bool,
}

/// State shared by every PE's fabric instance in one loopback world.
pub struct LoopbackShared {
    npes: usize,
    next_worker: AtomicU64,
    workers: Mutex<HashMap<WorkerHandle, WorkerState>>,
    native_bitwise: AtomicBool,
}

impl LoopbackShared {
    pub fn new(npes: usize) -> Arc<Self> {
        Arc::new(Self {
            npes,
            next_worker: AtomicU64::new(1),
            workers: Mutex::new(HashMap::new()),
            native_bitwise: AtomicBool::new(true),
        })
    }

    /// Pretend the fabric lacks bitwise atomics, forcing the adapter's
    /// cswap emulation loop.
    pub fn set_native_bitwise(&self, native: bool) {
        self.native_bitwise.store(native, Ordering::SeqCst);
    }
}

/// Per-PE handle onto a loopback world.
pub struct LoopbackFabric {
    shared: Arc<LoopbackShared>,
    pe: usize,
}

impl LoopbackFabric {
    pub fn new(shared: Arc<LoopbackShared>, pe: usize) -> Self {
        Self { shared, pe }
    }

    fn worker_state<R>(
        &self,
        worker: WorkerHandle,
        f: impl FnOnce(&mut WorkerState) -> FabricResult<R>,
    ) -> FabricResult<R> {
        let mut ws = self.shared.workers.lock();
        let state = ws
            .get_mut(&worker)
            .ok_or_else(|| bad(format!("unknown worker {worker}")))?;
        f(state)
    }
}

impl Fabric for LoopbackFabric {
    fn create_worker(&self) -> FabricResult<WorkerHandle> {
        let id = self.shared.next_worker.fetch_add(1, Ordering::SeqCst);
        self.shared.workers.lock().insert(id, WorkerState::default());
        Ok(id)
    }

    fn destroy_worker(&self, worker: WorkerHandle) {
        self.shared.workers.lock().remove(&worker);
    }

    fn worker_address(&self, worker: WorkerHandle) -> FabricResult<Vec<u8>> {
        self.worker_state(worker, |_| Ok(()))?;
        Ok(format!("loopback:{}:{}", self.pe, worker).into_bytes())
    }

    fn make_endpoints(&self, worker: WorkerHandle, npes: usize) -> FabricResult<()> {
        if npes != self.shared.npes {
            return Err(bad(format!(
                "endpoint count {npes} does not match world size {}",
                self.shared.npes
            )));
        }
        self.worker_state(worker, |s| {
            s.endpoints = npes;
            Ok(())
        })
    }

    fn wireup(&self, worker: WorkerHandle, peer_addrs: &[Vec<u8>]) -> FabricResult<()> {
        if peer_addrs.len() != self.shared.npes {
            return Err(bad("wireup with wrong peer count"));
        }
        for (pe, addr) in peer_addrs.iter().enumerate() {
            let s = std::str::from_utf8(addr).map_err(|_| bad("bad worker address"))?;
            if !s.starts_with(&format!("loopback:{pe}:")) {
                return Err(bad(format!("worker address '{s}' is not pe {pe}")));
            }
        }
        self.worker_state(worker, |s| {
            if s.endpoints == 0 {
                return Err(bad("wireup before make_endpoints"));
            }
            s.wired = true;
            Ok(())
        })
    }

    fn destroy_endpoints(&self, worker: WorkerHandle) {
        let _ = self.worker_state(worker, |s| {
            s.endpoints = 0;
            s.wired = false;
            Ok(())
        });
    }

    fn put(&self, _worker: WorkerHandle, dst: RemotePtr, src: *const u8, len: usize)
        -> FabricResult<()> {
        // Same address space: deliver immediately. copy handles the
        // self-target overlap case.
        unsafe { std::ptr::copy(src, dst.addr as *mut u8, len) };
        Ok(())
    }

    fn put_nbi(&self, worker: WorkerHandle, dst: RemotePtr, src: *const u8, len: usize)
        -> FabricResult<()> {
        self.put(worker, dst, src, len)
    }

    fn get(&self, _worker: WorkerHandle, dst: *mut u8, src: RemotePtr, len: usize)
        -> FabricResult<()> {
        unsafe { std::ptr::copy(src.addr as *const u8, dst, len) };
        Ok(())
    }

    fn get_nbi(&self, worker: WorkerHandle, dst: *mut u8, src: RemotePtr, len: usize)
        -> FabricResult<()> {
        self.get(worker, dst, src, len)
    }

    fn put_signal_nb(
        &self,
        worker: WorkerHandle,
        dst: RemotePtr,
        src: *const u8,
        len: usize,
        sig: RemotePtr,
        sig_val: i64,
    ) -> FabricResult<()> {
        self.put(worker, dst, src, len)?;
        let cell = unsafe { &*(sig.addr as *const std::sync::atomic::AtomicI64) };
        cell.fetch_add(sig_val, Ordering::AcqRel);
        Ok(())
    }

    fn fence(&self, _worker: WorkerHandle) -> FabricResult<()> {
        // Delivery is immediate; ordering already holds.
        Ok(())
    }

    fn quiet(&self, _worker: WorkerHandle) -> FabricResult<()> {
        Ok(())
    }

    fn progress(&self, _worker: WorkerHandle) {
        std::hint::spin_loop();
    }

    fn amo32(
        &self,
        _worker: WorkerHandle,
        op: AmoOp,
        target: RemotePtr,
        operand: u32,
        compare: u32,
    ) -> FabricResult<u32> {
        if target.addr % 4 != 0 {
            return Err(bad(format!("unaligned 32-bit amo at {:#x}", target.addr)));
        }
        let cell = unsafe { &*(target.addr as *const AtomicU32) };
        let old = match op {
            AmoOp::FetchAdd => cell.fetch_add(operand, Ordering::SeqCst),
            AmoOp::FetchAnd => cell.fetch_and(operand, Ordering::SeqCst),
            AmoOp::FetchOr => cell.fetch_or(operand, Ordering::SeqCst),
            AmoOp::FetchXor => cell.fetch_xor(operand, Ordering::SeqCst),
            AmoOp::Swap => cell.swap(operand, Ordering::SeqCst),
            AmoOp::CompareSwap => {
                match cell.compare_exchange(compare, operand, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(prev) | Err(prev) => prev,
                }
            }
            AmoOp::Fetch => cell.load(Ordering::SeqCst),
        };
        Ok(old)
    }

    fn amo64(
        &self,
        _worker: WorkerHandle,
        op: AmoOp,
        target: RemotePtr,
        operand: u64,
        compare: u64,
    ) -> FabricResult<u64> {
        if target.addr % 8 != 0 {
            return Err(bad(format!("unaligned 64-bit amo at {:#x}", target.addr)));
        }
        let cell = unsafe { &*(target.addr as *const AtomicU64) };
        let old = match op {
            AmoOp::FetchAdd => cell.fetch_add(operand, Ordering::SeqCst),
            AmoOp::FetchAnd => cell.fetch_and(operand, Ordering::SeqCst),
            AmoOp::FetchOr => cell.fetch_or(operand, Ordering::SeqCst),
            AmoOp::FetchXor => cell.fetch_xor(operand, Ordering::SeqCst),
            AmoOp::Swap => cell.swap(operand, Ordering::SeqCst),
            AmoOp::CompareSwap => {
                match cell.compare_exchange(compare, operand, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(prev) | Err(prev) => prev,
                }
            }
            AmoOp::Fetch => cell.load(Ordering::SeqCst),
        };
        Ok(old)
    }

    fn has_native_bitwise(&self) -> bool {
        self.shared.native_bitwise.load(Ordering::SeqCst)
    }

    fn global_exit(&self, code: i32, msg: &str) -> ! {
        panic!("global_exit(pe {}, code {code}): {msg}", self.pe);
    }
}

/// Spawn an `npes`-thread loopback world, run `body` on each PE's
/// runtime, and return the per-PE results in rank order. Panics (and
/// therefore global exits) propagate to the caller.
pub fn run_world<T, F>(npes: usize, config: Config, body: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(&Runtime) -> T + Send + Sync + 'static,
{
    run_world_catch(npes, config, body)
        .into_iter()
        .map(|r| match r {
            Ok(v) => v,
            Err(p) => std::panic::resume_unwind(p),
        })
        .collect()
}

/// As `run_world`, but delivers each PE's panic (if any) instead of
/// propagating, so fatal-path behavior is testable.
pub fn run_world_catch<T, F>(npes: usize, config: Config, body: F) -> Vec<std::thread::Result<T>>
where
    T: Send + 'static,
    F: Fn(&Runtime) -> T + Send + Sync + 'static,
{
    assert!(npes > 0);
    let shared = LoopbackShared::new(npes);
    let exchange = LocalExchange::new(npes);
    let body = Arc::new(body);

    let handles: Vec<_> = (0..npes)
        .map(|pe| {
            let shared = Arc::clone(&shared);
            let exchange = Arc::clone(&exchange);
            let body = Arc::clone(&body);
            let config = config.clone();
            std::thread::Builder::new()
                .name(format!("pe-{pe}"))
                .spawn(move || {
                    let fabric = Arc::new(LoopbackFabric::new(shared, pe));
                    let launcher = Box::new(exchange.launcher_for(pe));
                    let rt = Runtime::init(config, launcher, fabric).expect("runtime init");
                    body(&rt)
                })
                .expect("spawn pe thread")
        })
        .collect();

    handles.into_iter().map(|h| h.join()).collect()
}
