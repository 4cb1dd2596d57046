//! Symmetric heap table and per-heap allocation

use crate::freelist::{BlockFault, FreeList};
use crate::{Error, Result};
use log::{error, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Called when a corruption-class failure must abend the job.
pub type FatalHook = Arc<dyn Fn(&str) + Send + Sync>;

struct Heap {
    name: String,
    base: usize,
    capacity: usize,
    fl: Mutex<FreeList>,
}

/// Dynamic array of symmetric heaps, indexed `0..H`, with a unique
/// name-to-index map (first insert wins).
pub struct HeapTable {
    heaps: RwLock<Vec<Option<Arc<Heap>>>>,
    names: Mutex<HashMap<String, usize>>,
    memfatal: bool,
    fatal: Option<FatalHook>,
}

impl HeapTable {
    /// Create the table with `h` empty heap slots.
    pub fn new(h: usize, memfatal: bool, fatal: Option<FatalHook>) -> Self {
        Self {
            heaps: RwLock::new((0..h).map(|_| None).collect()),
            names: Mutex::new(HashMap::new()),
            memfatal,
            fatal,
        }
    }

    /// Number of heap slots.
    pub fn len(&self) -> usize {
        self.heaps.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn heap(&self, index: usize) -> Result<Arc<Heap>> {
        self.heaps
            .read()
            .get(index)
            .and_then(|h| h.clone())
            .ok_or(Error::Uninitialized)
    }

    /// Invoked on allocator self-check failure.
    fn report_corruption(&self, index: usize) {
        error!(target: "symm_core::heap", "heap {index} corrupted");
        if self.memfatal {
            if let Some(f) = &self.fatal {
                f(&format!("symmetric heap {index} corrupted"));
            }
        }
    }

    /// Invoked when the caller misuses a heap pointer.
    fn report_usage_error(&self, index: usize, addr: usize) {
        error!(target: "symm_core::heap", "heap {index}: bad free of {addr:#x}");
        if self.memfatal {
            if let Some(f) = &self.fatal {
                f(&format!("symmetric heap {index}: bad free of {addr:#x}"));
            }
        }
    }

    /// Bring up heap `index` over a caller-supplied span. Grows the
    /// table if needed; registers `name` unless already taken.
    pub fn init_by_index(&self, index: usize, name: &str, base: usize, capacity: usize) -> Result<()> {
        let fl = FreeList::new(base, capacity)
            .ok_or_else(|| Error::BadArg(format!("heap span too small: {capacity} bytes")))?;
        let heap = Arc::new(Heap {
            name: name.to_string(),
            base,
            capacity,
            fl: Mutex::new(fl),
        });
        {
            let mut heaps = self.heaps.write();
            if index >= heaps.len() {
                heaps.resize_with(index + 1, || None);
            }
            if heaps[index].is_some() {
                return Err(Error::BadArg(format!("heap {index} already initialized")));
            }
            heaps[index] = Some(heap);
        }
        self.names.lock().entry(name.to_string()).or_insert(index);
        Ok(())
    }

    pub fn base_by_index(&self, index: usize) -> Result<usize> {
        Ok(self.heap(index)?.base)
    }

    pub fn capacity_by_index(&self, index: usize) -> Result<usize> {
        Ok(self.heap(index)?.capacity)
    }

    /// Payload bytes currently allocated from heap `index`.
    pub fn bytes_in_use(&self, index: usize) -> Result<usize> {
        Ok(self.heap(index)?.fl.lock().bytes_in_use())
    }

    pub fn name_to_index(&self, name: &str) -> Option<usize> {
        self.names.lock().get(name).copied()
    }

    pub fn index_to_name(&self, index: usize) -> Result<String> {
        Ok(self.heap(index)?.name.clone())
    }

    pub fn malloc_by_index(&self, index: usize, size: usize) -> Result<usize> {
        if size == 0 {
            return Err(Error::BadArg("zero-size symmetric allocation".into()));
        }
        let heap = self.heap(index)?;
        let addr = heap.fl.lock().alloc(size);
        addr.ok_or(Error::AllocFail(size))
    }

    pub fn calloc_by_index(&self, index: usize, count: usize, size: usize) -> Result<usize> {
        let bytes = count
            .checked_mul(size)
            .ok_or_else(|| Error::BadArg("calloc size overflow".into()))?;
        let addr = self.malloc_by_index(index, bytes)?;
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, bytes) };
        Ok(addr)
    }

    /// Alignment must be a power of two.
    pub fn memalign_by_index(&self, index: usize, align: usize, size: usize) -> Result<usize> {
        if align == 0 || !align.is_power_of_two() {
            return Err(Error::BadArg(format!("alignment {align} is not a power of two")));
        }
        let heap = self.heap(index)?;
        let addr = heap.fl.lock().alloc_aligned(size, align);
        addr.ok_or(Error::AllocFail(size))
    }

    pub fn realloc_by_index(&self, index: usize, addr: usize, size: usize) -> Result<usize> {
        if addr == 0 {
            return self.malloc_by_index(index, size);
        }
        if size == 0 {
            self.free_by_index(index, addr)?;
            return Ok(0);
        }
        let heap = self.heap(index)?;
        let old = {
            let fl = heap.fl.lock();
            match fl.alloc_size(addr) {
                Ok(sz) => sz,
                Err(fault) => {
                    drop(fl);
                    self.report_fault(index, addr, fault);
                    return Err(match fault {
                        BlockFault::Usage => {
                            Error::BadArg(format!("realloc of bad pointer {addr:#x}"))
                        }
                        BlockFault::Corrupt => Error::Corruption(index),
                    });
                }
            }
        };
        let fresh = heap.fl.lock().alloc(size).ok_or(Error::AllocFail(size))?;
        unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, fresh as *mut u8, old.min(size))
        };
        // Old block is known-good, ignore the impossible fault.
        let _ = heap.fl.lock().free(addr);
        Ok(fresh)
    }

    fn report_fault(&self, index: usize, addr: usize, fault: BlockFault) {
        match fault {
            BlockFault::Usage => self.report_usage_error(index, addr),
            BlockFault::Corrupt => self.report_corruption(index),
        }
    }

    /// Freeing NULL is a no-op. Misuse is reported through the heap
    /// fault callbacks rather than returned.
    pub fn free_by_index(&self, index: usize, addr: usize) -> Result<()> {
        if addr == 0 {
            return Ok(());
        }
        let heap = self.heap(index)?;
        let res = heap.fl.lock().free(addr);
        if let Err(fault) = res {
            self.report_fault(index, addr, fault);
        }
        Ok(())
    }

    /// Which heap owns `addr`, if any.
    pub fn index_of_addr(&self, addr: usize) -> Option<usize> {
        let heaps = self.heaps.read();
        heaps.iter().enumerate().find_map(|(i, h)| {
            h.as_ref()
                .filter(|h| addr >= h.base && addr < h.base + h.capacity)
                .map(|_| i)
        })
    }

    pub fn finalize_by_index(&self, index: usize) -> Result<()> {
        let mut heaps = self.heaps.write();
        let slot = heaps
            .get_mut(index)
            .ok_or_else(|| Error::BadArg(format!("heap index {index} out of range")))?;
        if let Some(h) = slot.take() {
            let leaked = h.fl.lock().bytes_in_use();
            if leaked > 0 {
                warn!(target: "symm_core::heap", "heap {index} finalized with {leaked} bytes live");
            }
            self.names.lock().remove(&h.name);
        }
        Ok(())
    }

    pub fn finalize(&self) {
        let n = self.heaps.read().len();
        for i in 0..n {
            let _ = self.finalize_by_index(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_over(mem: &mut [u8]) -> HeapTable {
        let t = HeapTable::new(1, false, None);
        t.init_by_index(0, "default", mem.as_mut_ptr() as usize, mem.len())
            .unwrap();
        t
    }

    #[test]
    fn malloc_free_round_trip() {
        let mut mem = vec![0u8; 64 * 1024];
        let t = table_over(&mut mem);
        let before = t.bytes_in_use(0).unwrap();
        let p = t.malloc_by_index(0, 4096).unwrap();
        t.free_by_index(0, p).unwrap();
        assert_eq!(t.bytes_in_use(0).unwrap(), before);
    }

    #[test]
    fn calloc_zeroes() {
        let mut mem = vec![0xffu8; 64 * 1024];
        let t = table_over(&mut mem);
        let p = t.calloc_by_index(0, 16, 8).unwrap();
        let s = unsafe { std::slice::from_raw_parts(p as *const u8, 128) };
        assert!(s.iter().all(|&b| b == 0));
    }

    #[test]
    fn realloc_preserves_prefix() {
        let mut mem = vec![0u8; 64 * 1024];
        let t = table_over(&mut mem);
        let p = t.malloc_by_index(0, 8).unwrap();
        unsafe { (p as *mut u64).write(0xfeed) };
        let q = t.realloc_by_index(0, p, 1024).unwrap();
        assert_eq!(unsafe { (q as *const u64).read() }, 0xfeed);
        t.free_by_index(0, q).unwrap();
        assert_eq!(t.bytes_in_use(0).unwrap(), 0);
    }

    #[test]
    fn bad_alignment_rejected() {
        let mut mem = vec![0u8; 16 * 1024];
        let t = table_over(&mut mem);
        assert!(matches!(
            t.memalign_by_index(0, 24, 64),
            Err(Error::BadArg(_))
        ));
        let p = t.memalign_by_index(0, 128, 64).unwrap();
        assert_eq!(p % 128, 0);
    }

    #[test]
    fn free_null_is_noop() {
        let mut mem = vec![0u8; 16 * 1024];
        let t = table_over(&mut mem);
        t.free_by_index(0, 0).unwrap();
    }

    #[test]
    fn double_free_fatal_hook_fires() {
        use std::sync::atomic::{AtomicBool, Ordering};
        static FIRED: AtomicBool = AtomicBool::new(false);
        let mut mem = vec![0u8; 16 * 1024];
        let t = HeapTable::new(1, true, Some(Arc::new(|_msg: &str| {
            FIRED.store(true, Ordering::SeqCst);
        })));
        t.init_by_index(0, "default", mem.as_mut_ptr() as usize, mem.len())
            .unwrap();
        let p = t.malloc_by_index(0, 64).unwrap();
        t.free_by_index(0, p).unwrap();
        t.free_by_index(0, p).unwrap();
        assert!(FIRED.load(Ordering::SeqCst));
    }

    #[test]
    fn double_free_without_memfatal_continues() {
        let mut mem = vec![0u8; 16 * 1024];
        let t = table_over(&mut mem);
        let p = t.malloc_by_index(0, 64).unwrap();
        t.free_by_index(0, p).unwrap();
        // Reported through the callback, not an error.
        t.free_by_index(0, p).unwrap();
        let q = t.malloc_by_index(0, 64).unwrap();
        t.free_by_index(0, q).unwrap();
    }

    #[test]
    fn exhausted_heap_reports_alloc_fail() {
        let mut mem = vec![0u8; 4 * 1024];
        let t = table_over(&mut mem);
        assert!(matches!(
            t.malloc_by_index(0, 64 * 1024),
            Err(Error::AllocFail(_))
        ));
        assert!(matches!(
            t.memalign_by_index(0, 64, 64 * 1024),
            Err(Error::AllocFail(_))
        ));
        let p = t.malloc_by_index(0, 64).unwrap();
        t.free_by_index(0, p).unwrap();
    }

    #[test]
    fn finalized_heap_refuses_allocation() {
        let mut mem = vec![0u8; 16 * 1024];
        let t = table_over(&mut mem);
        t.finalize_by_index(0).unwrap();
        assert!(matches!(t.malloc_by_index(0, 64), Err(Error::Uninitialized)));
    }

    #[test]
    fn realloc_of_smashed_header_reports_corruption() {
        let mut mem = vec![0u8; 16 * 1024];
        let t = table_over(&mut mem);
        let p = t.malloc_by_index(0, 64).unwrap();
        unsafe { ((p - 2 * std::mem::size_of::<usize>()) as *mut usize).write(0xdead) };
        assert!(matches!(
            t.realloc_by_index(0, p, 128),
            Err(Error::Corruption(0))
        ));
    }

    #[test]
    fn names_first_insert_wins() {
        let mut mem = vec![0u8; 32 * 1024];
        let t = HeapTable::new(2, false, None);
        let base = mem.as_mut_ptr() as usize;
        t.init_by_index(0, "scratch", base, 16 * 1024).unwrap();
        t.init_by_index(1, "scratch", base + 16 * 1024, 16 * 1024)
            .unwrap();
        assert_eq!(t.name_to_index("scratch"), Some(0));
    }
}
