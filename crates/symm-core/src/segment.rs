//! Heap segment backing: private pages or OS shared memory

use crate::config::HeapBacking;
use crate::{Error, Result};
use shared_memory::{Shmem, ShmemConf};
use std::alloc::{alloc_zeroed, dealloc, Layout};

/// Segment alignment; pSync cells and atomics require at least 8, heap
/// blocks are carved at 16.
pub const SEGMENT_ALIGN: usize = 4096;

/// Privately mapped segment for in-process worlds.
pub struct PrivateSegment {
    ptr: *mut u8,
    layout: Layout,
}

impl PrivateSegment {
    fn new(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size, SEGMENT_ALIGN)
            .map_err(|e| Error::BadArg(format!("segment layout: {e}")))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::AllocFail(size));
        }
        Ok(Self { ptr, layout })
    }
}

impl Drop for PrivateSegment {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// One symmetric memory segment, remotely addressable after wire-up.
pub enum HeapSegment {
    Private(PrivateSegment),
    Os { shm: Shmem, name: String },
}

// Safety: the segment is a stable mapping for the life of the runtime;
// concurrent access is mediated by the transport's ordering rules.
unsafe impl Send for HeapSegment {}
unsafe impl Sync for HeapSegment {}

impl HeapSegment {
    /// Create a segment of `size` bytes with the requested backing.
    /// `name` seeds the OS id for shared backing.
    pub fn create(backing: HeapBacking, name: &str, size: usize) -> Result<Self> {
        match backing {
            HeapBacking::Private => Ok(HeapSegment::Private(PrivateSegment::new(size)?)),
            HeapBacking::OsShared => {
                let shm = ShmemConf::new()
                    .size(size)
                    .os_id(name)
                    .create()
                    .map_err(|e| Error::Transport(format!("shm create '{name}': {e}")))?;
                Ok(HeapSegment::Os {
                    shm,
                    name: name.to_string(),
                })
            }
        }
    }

    /// Map an existing OS-backed segment created by a node-local peer.
    pub fn open_shared(name: &str) -> Result<Self> {
        let shm = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|e| Error::Transport(format!("shm open '{name}': {e}")))?;
        Ok(HeapSegment::Os {
            shm,
            name: name.to_string(),
        })
    }

    pub fn base(&self) -> usize {
        match self {
            HeapSegment::Private(p) => p.ptr as usize,
            HeapSegment::Os { shm, .. } => shm.as_ptr() as usize,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HeapSegment::Private(p) => p.layout.size(),
            HeapSegment::Os { shm, .. } => shm.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn os_name(&self) -> Option<&str> {
        match self {
            HeapSegment::Private(_) => None,
            HeapSegment::Os { name, .. } => Some(name),
        }
    }
}
