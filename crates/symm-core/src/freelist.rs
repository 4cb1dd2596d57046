//! Segregated free-list allocator over a caller-supplied span
//!
//! Blocks carry in-band boundary-tag headers so free() can coalesce with
//! both neighbors. A magic word in each header lets the allocator detect
//! stray frees and header smashes; violations are reported to the owning
//! heap, which decides whether they are fatal.

/// Block header, resident in the managed span just before the payload.
#[repr(C)]
struct BlockHeader {
    /// Total block size, header included. Multiple of `ALIGN`.
    size: usize,
    /// Total size of the block immediately before this one; 0 for the
    /// first block in the span.
    prev_size: usize,
    /// Magic plus the allocated bit.
    state: usize,
    _pad: usize,
}

/// Free-list node, stored in the payload of free blocks.
#[repr(C)]
struct FreeNode {
    next: usize,
    prev: usize,
}

const HDR: usize = std::mem::size_of::<BlockHeader>();
const ALIGN: usize = 16;
const MIN_PAYLOAD: usize = std::mem::size_of::<FreeNode>();
const MIN_BLOCK: usize = HDR + MIN_PAYLOAD;
const MAGIC: usize = 0x5AFE_B10C_0000_0000;
const ALLOCATED: usize = 1;
const NBINS: usize = 48;

/// Violation classes surfaced to the heap layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFault {
    /// Caller passed a pointer the span does not own, or freed twice.
    Usage,
    /// A header failed its self-check; the span is damaged.
    Corrupt,
}

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

fn bin_index(size: usize) -> usize {
    // Size class by leading bit; sizes are >= MIN_BLOCK.
    let b = usize::BITS - size.leading_zeros();
    (b as usize).min(NBINS - 1)
}

/// Free-list allocator over `[base, base + capacity)`.
pub struct FreeList {
    base: usize,
    end: usize,
    bins: [usize; NBINS],
    in_use: usize,
}

impl FreeList {
    /// Initialize over a span. The span must be at least one minimal
    /// block and aligned to `ALIGN`.
    pub fn new(base: usize, capacity: usize) -> Option<Self> {
        let start = align_up(base, ALIGN);
        let end = (base + capacity) & !(ALIGN - 1);
        if end <= start || end - start < MIN_BLOCK {
            return None;
        }
        let mut fl = Self {
            base: start,
            end,
            bins: [0; NBINS],
            in_use: 0,
        };
        unsafe {
            let h = fl.header_mut(start);
            h.size = end - start;
            h.prev_size = 0;
            h.state = MAGIC;
            fl.bin_push(start);
        }
        Some(fl)
    }

    pub fn span(&self) -> (usize, usize) {
        (self.base, self.end)
    }

    /// Payload bytes currently handed out.
    pub fn bytes_in_use(&self) -> usize {
        self.in_use
    }

    pub fn owns(&self, addr: usize) -> bool {
        addr >= self.base + HDR && addr < self.end
    }

    unsafe fn header_mut(&mut self, block: usize) -> &mut BlockHeader {
        &mut *(block as *mut BlockHeader)
    }

    unsafe fn header(&self, block: usize) -> &BlockHeader {
        &*(block as *const BlockHeader)
    }

    unsafe fn node_mut(&mut self, block: usize) -> &mut FreeNode {
        &mut *((block + HDR) as *mut FreeNode)
    }

    unsafe fn check(&self, block: usize) -> Result<(), BlockFault> {
        if block < self.base || block + HDR > self.end || block % ALIGN != 0 {
            return Err(BlockFault::Usage);
        }
        let h = self.header(block);
        if h.state & !ALLOCATED != MAGIC {
            return Err(BlockFault::Corrupt);
        }
        if h.size < MIN_BLOCK || block + h.size > self.end || h.size % ALIGN != 0 {
            return Err(BlockFault::Corrupt);
        }
        Ok(())
    }

    unsafe fn bin_push(&mut self, block: usize) {
        let idx = bin_index(self.header(block).size);
        let head = self.bins[idx];
        {
            let n = self.node_mut(block);
            n.next = head;
            n.prev = 0;
        }
        if head != 0 {
            self.node_mut(head).prev = block;
        }
        self.bins[idx] = block;
    }

    unsafe fn bin_remove(&mut self, block: usize) {
        let idx = bin_index(self.header(block).size);
        let (next, prev) = {
            let n = self.node_mut(block);
            (n.next, n.prev)
        };
        if prev != 0 {
            self.node_mut(prev).next = next;
        } else {
            self.bins[idx] = next;
        }
        if next != 0 {
            self.node_mut(next).prev = prev;
        }
    }

    /// Where would an aligned payload land inside `block`? Returns the
    /// block address to allocate at (after an optional prefix split) or
    /// None if it does not fit.
    unsafe fn fit(&self, block: usize, need: usize, align: usize) -> Option<usize> {
        let size = self.header(block).size;
        let mut payload = align_up(block + HDR, align);
        // A nonzero prefix must itself be a whole free block.
        if payload != block + HDR && payload - HDR - block < MIN_BLOCK {
            payload = align_up(block + HDR + MIN_BLOCK, align);
        }
        let alloc_block = payload - HDR;
        let used = alloc_block - block + HDR + need;
        if used <= size {
            Some(alloc_block)
        } else {
            None
        }
    }

    /// Allocate `size` payload bytes at the given power-of-two alignment
    /// (minimum `ALIGN`). Returns the payload address.
    pub fn alloc_aligned(&mut self, size: usize, align: usize) -> Option<usize> {
        let align = align.max(ALIGN);
        let need = align_up(size.max(MIN_PAYLOAD), ALIGN);
        let mut found: Option<(usize, usize)> = None;
        'scan: for idx in bin_index(need + HDR)..NBINS {
            let mut block = self.bins[idx];
            while block != 0 {
                if let Some(at) = unsafe { self.fit(block, need, align) } {
                    found = Some((block, at));
                    break 'scan;
                }
                block = unsafe { self.node_mut(block) }.next;
            }
        }
        let (block, alloc_block) = found?;
        unsafe {
            self.bin_remove(block);
            let total = self.header(block).size;
            let block_end = block + total;

            // Prefix left by alignment becomes its own free block.
            if alloc_block != block {
                let prefix = alloc_block - block;
                let h = self.header_mut(block);
                h.size = prefix;
                self.bin_push(block);
                let ah = self.header_mut(alloc_block);
                ah.prev_size = prefix;
                ah.state = MAGIC;
            } else {
                let ah = self.header_mut(alloc_block);
                ah.state = MAGIC;
            }

            // Split the tail if the remainder is a viable block.
            let want = HDR + need;
            let avail = block_end - alloc_block;
            let (alloc_size, remainder) = if avail - want >= MIN_BLOCK {
                (want, avail - want)
            } else {
                (avail, 0)
            };
            {
                let ah = self.header_mut(alloc_block);
                ah.size = alloc_size;
                ah.state = MAGIC | ALLOCATED;
            }
            if remainder > 0 {
                let tail = alloc_block + alloc_size;
                let th = self.header_mut(tail);
                th.size = remainder;
                th.prev_size = alloc_size;
                th.state = MAGIC;
                self.bin_push(tail);
                let tail_end = tail + remainder;
                if tail_end < self.end {
                    self.header_mut(tail_end).prev_size = remainder;
                }
            } else {
                let e = alloc_block + alloc_size;
                if e < self.end {
                    self.header_mut(e).prev_size = alloc_size;
                }
            }
            self.in_use += alloc_size - HDR;
            Some(alloc_block + HDR)
        }
    }

    pub fn alloc(&mut self, size: usize) -> Option<usize> {
        self.alloc_aligned(size, ALIGN)
    }

    /// Payload size of a live allocation.
    pub fn alloc_size(&self, addr: usize) -> Result<usize, BlockFault> {
        let block = addr.wrapping_sub(HDR);
        unsafe {
            self.check(block)?;
            let h = self.header(block);
            if h.state & ALLOCATED == 0 {
                return Err(BlockFault::Usage);
            }
            Ok(h.size - HDR)
        }
    }

    /// Return a payload address to the span, coalescing with free
    /// neighbors.
    pub fn free(&mut self, addr: usize) -> Result<(), BlockFault> {
        if !self.owns(addr) {
            return Err(BlockFault::Usage);
        }
        let mut block = addr - HDR;
        unsafe {
            self.check(block)?;
            if self.header(block).state & ALLOCATED == 0 {
                // Double free.
                return Err(BlockFault::Usage);
            }
            let mut size = self.header(block).size;
            self.in_use -= size - HDR;

            // Coalesce forward.
            let next = block + size;
            if next < self.end {
                self.check(next)?;
                if self.header(next).state & ALLOCATED == 0 {
                    let nsize = self.header(next).size;
                    self.bin_remove(next);
                    self.header_mut(next).state = 0;
                    size += nsize;
                }
            }
            // Coalesce backward.
            let prev_size = self.header(block).prev_size;
            if prev_size != 0 {
                let prev = block - prev_size;
                self.check(prev)?;
                if self.header(prev).state & ALLOCATED == 0 {
                    self.bin_remove(prev);
                    self.header_mut(block).state = 0;
                    block = prev;
                    size += prev_size;
                }
            }
            {
                let h = self.header_mut(block);
                h.size = size;
                h.state = MAGIC;
            }
            let after = block + size;
            if after < self.end {
                self.header_mut(after).prev_size = size;
            }
            self.bin_push(block);
        }
        Ok(())
    }
}
