//! Transport adapter: one-sided surface over a fabric backend
//!
//! Every per-address operation resolves its target through the region
//! table first, then hands a fully translated remote pointer to the
//! fabric. Backend status codes are bridged into the crate's error
//! taxonomy here and nowhere else.

use crate::elem::{AtomicElem, AtomicWidth};
use crate::region::{RegionTable, SymAddr};
use crate::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Opaque progress-worker handle issued by a fabric.
pub type WorkerHandle = u64;

/// Backend status carried up from a fabric call.
#[derive(Debug, Clone)]
pub struct FabricError {
    pub code: i32,
    pub msg: String,
}

impl fmt::Display for FabricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.msg, self.code)
    }
}

pub type FabricResult<T> = std::result::Result<T, FabricError>;

/// Fully translated one-sided target.
#[derive(Debug, Clone, Copy)]
pub struct RemotePtr {
    pub pe: usize,
    pub addr: usize,
    pub rkey: u64,
}

/// Atomic fetch-and-op selector; all variants return the prior value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmoOp {
    FetchAdd,
    FetchAnd,
    FetchOr,
    FetchXor,
    Swap,
    CompareSwap,
    Fetch,
}

impl AmoOp {
    pub fn is_bitwise(self) -> bool {
        matches!(self, AmoOp::FetchAnd | AmoOp::FetchOr | AmoOp::FetchXor)
    }
}

/// Capability set a transport backend must provide. Production RDMA
/// backends and the in-process loopback implement the same surface.
pub trait Fabric: Send + Sync {
    fn create_worker(&self) -> FabricResult<WorkerHandle>;
    fn destroy_worker(&self, worker: WorkerHandle);
    /// Opaque address other PEs use to reach this worker; published
    /// through the launcher's kv exchange.
    fn worker_address(&self, worker: WorkerHandle) -> FabricResult<Vec<u8>>;

    fn make_endpoints(&self, worker: WorkerHandle, npes: usize) -> FabricResult<()>;
    fn wireup(&self, worker: WorkerHandle, peer_addrs: &[Vec<u8>]) -> FabricResult<()>;
    fn destroy_endpoints(&self, worker: WorkerHandle);

    /// Blocking issuance: the local buffer is reusable on return;
    /// remote visibility still requires fence or quiet.
    fn put(&self, worker: WorkerHandle, dst: RemotePtr, src: *const u8, len: usize)
        -> FabricResult<()>;
    /// Non-blocking: the local buffer may not be touched until quiet.
    fn put_nbi(&self, worker: WorkerHandle, dst: RemotePtr, src: *const u8, len: usize)
        -> FabricResult<()>;
    fn get(&self, worker: WorkerHandle, dst: *mut u8, src: RemotePtr, len: usize)
        -> FabricResult<()>;
    fn get_nbi(&self, worker: WorkerHandle, dst: *mut u8, src: RemotePtr, len: usize)
        -> FabricResult<()>;
    /// Writes the payload, then atomically adds `sig_val` to the word
    /// at `sig` once the payload is delivered.
    fn put_signal_nb(
        &self,
        worker: WorkerHandle,
        dst: RemotePtr,
        src: *const u8,
        len: usize,
        sig: RemotePtr,
        sig_val: i64,
    ) -> FabricResult<()>;

    fn fence(&self, worker: WorkerHandle) -> FabricResult<()>;
    fn quiet(&self, worker: WorkerHandle) -> FabricResult<()>;
    /// Advance the worker once; may complete pending operations.
    fn progress(&self, worker: WorkerHandle);

    /// 32-bit fetch-and-op; `compare` is meaningful for CompareSwap only.
    fn amo32(
        &self,
        worker: WorkerHandle,
        op: AmoOp,
        target: RemotePtr,
        operand: u32,
        compare: u32,
    ) -> FabricResult<u32>;
    /// 64-bit fetch-and-op.
    fn amo64(
        &self,
        worker: WorkerHandle,
        op: AmoOp,
        target: RemotePtr,
        operand: u64,
        compare: u64,
    ) -> FabricResult<u64>;
    /// Whether the backend implements bitwise atomics natively; when
    /// false the adapter emulates them over cswap.
    fn has_native_bitwise(&self) -> bool;

    /// Abend the whole job.
    fn global_exit(&self, code: i32, msg: &str) -> !;
}

/// What the adapter needs to know about the issuing context.
#[derive(Debug, Clone, Copy)]
pub struct CommHandle {
    pub worker: WorkerHandle,
    /// Context declared store-free: fence and quiet are suppressed.
    pub no_store: bool,
}

fn bridge(e: FabricError) -> Error {
    Error::Transport(e.to_string())
}

fn apply_bitwise(op: AmoOp, old: u64, v: u64) -> u64 {
    match op {
        AmoOp::FetchAnd => old & v,
        AmoOp::FetchOr => old | v,
        AmoOp::FetchXor => old ^ v,
        _ => unreachable!("emulation is only entered for bitwise ops"),
    }
}

/// Uniform one-sided surface over a fabric plus the region table.
pub struct TransportAdapter {
    fabric: Arc<dyn Fabric>,
    regions: Arc<RegionTable>,
}

impl TransportAdapter {
    pub fn new(fabric: Arc<dyn Fabric>, regions: Arc<RegionTable>) -> Self {
        Self { fabric, regions }
    }

    pub fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.fabric
    }

    pub fn regions(&self) -> &Arc<RegionTable> {
        &self.regions
    }

    fn resolve(&self, addr: SymAddr, pe: usize) -> Result<RemotePtr> {
        let t = self.regions.translate(addr, pe)?;
        Ok(RemotePtr {
            pe,
            addr: t.remote_addr,
            rkey: t.rkey,
        })
    }

    pub fn put(&self, h: CommHandle, dest: SymAddr, pe: usize, src: &[u8]) -> Result<()> {
        let dst = self.resolve(dest, pe)?;
        self.fabric
            .put(h.worker, dst, src.as_ptr(), src.len())
            .map_err(bridge)
    }

    /// # Safety
    /// `src` must stay valid and untouched until `quiet` returns.
    pub unsafe fn put_nbi(
        &self,
        h: CommHandle,
        dest: SymAddr,
        pe: usize,
        src: *const u8,
        len: usize,
    ) -> Result<()> {
        let dst = self.resolve(dest, pe)?;
        self.fabric.put_nbi(h.worker, dst, src, len).map_err(bridge)
    }

    pub fn get(&self, h: CommHandle, dest: &mut [u8], src: SymAddr, pe: usize) -> Result<()> {
        let from = self.resolve(src, pe)?;
        self.fabric
            .get(h.worker, dest.as_mut_ptr(), from, dest.len())
            .map_err(bridge)
    }

    /// # Safety
    /// `dest` must stay valid and unread until `quiet` returns.
    pub unsafe fn get_nbi(
        &self,
        h: CommHandle,
        dest: *mut u8,
        len: usize,
        src: SymAddr,
        pe: usize,
    ) -> Result<()> {
        let from = self.resolve(src, pe)?;
        self.fabric.get_nbi(h.worker, dest, from, len).map_err(bridge)
    }

    /// Payload plus signal add; the signal lands after the payload.
    pub fn put_signal_nb(
        &self,
        h: CommHandle,
        dest: SymAddr,
        pe: usize,
        src: &[u8],
        sig: SymAddr,
        sig_val: i64,
    ) -> Result<()> {
        let dst = self.resolve(dest, pe)?;
        let sig = self.resolve(sig, pe)?;
        self.fabric
            .put_signal_nb(h.worker, dst, src.as_ptr(), src.len(), sig, sig_val)
            .map_err(bridge)
    }

    /// Order prior puts on this context toward each PE. Suppressed on
    /// no-store contexts.
    pub fn fence(&self, h: CommHandle) -> Result<()> {
        if h.no_store {
            return Ok(());
        }
        self.fabric.fence(h.worker).map_err(bridge)
    }

    /// Drain all prior operations on this context. Suppressed on
    /// no-store contexts.
    pub fn quiet(&self, h: CommHandle) -> Result<()> {
        if h.no_store {
            return Ok(());
        }
        self.fabric.quiet(h.worker).map_err(bridge)
    }

    pub fn progress(&self, h: CommHandle) {
        self.fabric.progress(h.worker);
    }

    /// Typed fetch-and-op, synchronous to the caller. Bitwise ops fall
    /// back to a get/cswap retry loop when the fabric lacks them; the
    /// loop composes into a single logical atomic.
    pub fn amo<T: AtomicElem>(
        &self,
        h: CommHandle,
        op: AmoOp,
        target: SymAddr,
        pe: usize,
        operand: T,
        compare: T,
    ) -> Result<T> {
        let dst = self.resolve(target, pe)?;
        if op.is_bitwise() && !self.fabric.has_native_bitwise() {
            return self.emulate_bitwise(h, op, dst, operand);
        }
        let old = match T::WIDTH {
            AtomicWidth::W32 => self
                .fabric
                .amo32(h.worker, op, dst, operand.to_bits() as u32, compare.to_bits() as u32)
                .map(|v| v as u64),
            AtomicWidth::W64 => self
                .fabric
                .amo64(h.worker, op, dst, operand.to_bits(), compare.to_bits()),
        }
        .map_err(bridge)?;
        Ok(T::from_bits(old))
    }

    fn emulate_bitwise<T: AtomicElem>(
        &self,
        h: CommHandle,
        op: AmoOp,
        dst: RemotePtr,
        operand: T,
    ) -> Result<T> {
        let v = operand.to_bits();
        loop {
            let (old, new) = match T::WIDTH {
                AtomicWidth::W32 => {
                    let old = self
                        .fabric
                        .amo32(h.worker, AmoOp::Fetch, dst, 0, 0)
                        .map_err(bridge)? as u64;
                    (old, apply_bitwise(op, old, v))
                }
                AtomicWidth::W64 => {
                    let old = self
                        .fabric
                        .amo64(h.worker, AmoOp::Fetch, dst, 0, 0)
                        .map_err(bridge)?;
                    (old, apply_bitwise(op, old, v))
                }
            };
            let won = match T::WIDTH {
                AtomicWidth::W32 => self
                    .fabric
                    .amo32(h.worker, AmoOp::CompareSwap, dst, new as u32, old as u32)
                    .map(|prev| prev as u64 == old),
                AtomicWidth::W64 => self
                    .fabric
                    .amo64(h.worker, AmoOp::CompareSwap, dst, new, old)
                    .map(|prev| prev == old),
            }
            .map_err(bridge)?;
            if won {
                return Ok(T::from_bits(old));
            }
        }
    }

    /// Compare-swap on an i64 synchronization cell.
    pub fn cswap_i64(
        &self,
        h: CommHandle,
        target: SymAddr,
        pe: usize,
        expect: i64,
        desired: i64,
    ) -> Result<i64> {
        self.amo::<i64>(h, AmoOp::CompareSwap, target, pe, desired, expect)
    }

    /// Atomic add on an i64 synchronization cell, result discarded.
    pub fn add_i64(&self, h: CommHandle, target: SymAddr, pe: usize, value: i64) -> Result<()> {
        self.amo::<i64>(h, AmoOp::FetchAdd, target, pe, value, 0)?;
        Ok(())
    }

    /// Atomically read a local synchronization cell.
    pub fn read_i64(&self, addr: SymAddr) -> i64 {
        unsafe { &*(addr.as_ptr::<AtomicI64>()) }.load(Ordering::Acquire)
    }

    /// Atomically write a local synchronization cell.
    pub fn write_i64(&self, addr: SymAddr, value: i64) {
        unsafe { &*(addr.as_ptr::<AtomicI64>()) }.store(value, Ordering::Release);
    }

    /// Spin on a local cell until `pred` holds, progressing the worker
    /// between polls.
    pub fn wait_until(&self, h: CommHandle, addr: SymAddr, pred: impl Fn(i64) -> bool) {
        let cell = unsafe { &*(addr.as_ptr::<AtomicI64>()) };
        let mut spins = 0u32;
        while !pred(cell.load(Ordering::Acquire)) {
            self.fabric.progress(h.worker);
            spins += 1;
            if spins % 1024 == 0 {
                std::thread::yield_now();
            }
        }
    }

    pub fn make_endpoints(&self, h: CommHandle, npes: usize) -> Result<()> {
        self.fabric.make_endpoints(h.worker, npes).map_err(bridge)
    }

    pub fn wireup(&self, h: CommHandle, peer_addrs: &[Vec<u8>]) -> Result<()> {
        self.fabric.wireup(h.worker, peer_addrs).map_err(bridge)
    }

    pub fn destroy_endpoints(&self, h: CommHandle) {
        self.fabric.destroy_endpoints(h.worker);
    }

    /// Structural failure: log and abend the whole job.
    pub fn fatal(&self, msg: &str) -> ! {
        log::error!(target: "symm_core::transport", "fatal: {msg}");
        self.fabric.global_exit(1, msg)
    }
}
