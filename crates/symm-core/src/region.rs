//! Region table and symmetric address translation

use crate::{Error, Result};
use parking_lot::RwLock;

/// Region id reserved for program-global symmetric data.
pub const GLOBALS_REGION: usize = 0;

/// A symmetric address as observed on the local PE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymAddr(pub usize);

impl SymAddr {
    pub const NULL: SymAddr = SymAddr(0);

    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    pub fn addr(self) -> usize {
        self.0
    }

    pub fn byte_add(self, off: usize) -> SymAddr {
        SymAddr(self.0 + off)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// One peer's view of a region.
#[derive(Debug, Clone, Copy)]
pub struct PeSpan {
    pub base: usize,
    pub end: usize,
    pub rkey: u64,
}

/// The transport's view of one heap or the globals area, replicated
/// per PE.
#[derive(Debug, Clone)]
pub struct Region {
    pub id: usize,
    pub spans: Vec<PeSpan>,
}

impl Region {
    /// Bases equal on every PE, so addresses cross unchanged.
    pub fn aligned(&self) -> bool {
        self.spans
            .windows(2)
            .all(|w| w[0].base == w[1].base)
    }
}

/// Result of resolving a local address for a target PE.
#[derive(Debug, Clone, Copy)]
pub struct Translated {
    pub region: usize,
    pub remote_addr: usize,
    pub rkey: u64,
}

/// Per-PE table of symmetric regions. Region 0 is the globals area;
/// regions >= 1 are heaps, appended in heap-index order.
pub struct RegionTable {
    my_pe: usize,
    regions: RwLock<Vec<Region>>,
}

impl RegionTable {
    pub fn new(my_pe: usize) -> Self {
        Self {
            my_pe,
            regions: RwLock::new(Vec::new()),
        }
    }

    /// Append a region; ids are assigned densely in registration order.
    pub fn register(&self, spans: Vec<PeSpan>) -> usize {
        let mut regions = self.regions.write();
        let id = regions.len();
        regions.push(Region { id, spans });
        id
    }

    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn span(&self, region: usize, pe: usize) -> Result<PeSpan> {
        self.regions
            .read()
            .get(region)
            .and_then(|r| r.spans.get(pe))
            .copied()
            .ok_or_else(|| Error::BadArg(format!("no region {region} for pe {pe}")))
    }

    /// Resolve `addr` for `dest_pe`. Regions are searched newest first
    /// so heap hits never fall through to the globals area.
    pub fn translate(&self, addr: SymAddr, dest_pe: usize) -> Result<Translated> {
        let regions = self.regions.read();
        for region in regions.iter().rev() {
            let mine = region
                .spans
                .get(self.my_pe)
                .ok_or_else(|| Error::Internal(format!("region {} lacks pe {}", region.id, self.my_pe)))?;
            if addr.0 < mine.base || addr.0 >= mine.end {
                continue;
            }
            let theirs = region
                .spans
                .get(dest_pe)
                .ok_or_else(|| Error::BadArg(format!("pe {dest_pe} out of range")))?;
            let remote_addr = if region.aligned() {
                addr.0
            } else {
                theirs.base + (addr.0 - mine.base)
            };
            return Ok(Translated {
                region: region.id,
                remote_addr,
                rkey: theirs.rkey,
            });
        }
        Err(Error::NotSymmetric(addr.0))
    }

    /// Would `translate` succeed for this address and PE?
    pub fn is_addr_accessible(&self, addr: SymAddr, pe: usize) -> bool {
        self.translate(addr, pe).is_ok()
    }
}
