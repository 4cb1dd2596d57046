//! Environment-driven runtime configuration

use crate::{Error, Result};
use log::warn;
use std::str::FromStr;

/// Default symmetric heap capacity (32 MiB).
pub const DEFAULT_SYMMETRIC_SIZE: usize = 32 * 1024 * 1024;

/// Default initial context-table capacity.
pub const DEFAULT_PREALLOC_CTXS: usize = 8;

/// Default delay between progress-thread polls (1 ms).
pub const DEFAULT_PROGRESS_DELAY_NS: u64 = 1_000_000;

/// Barrier / sync algorithm family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAlgo {
    Linear,
    Tree,
    BinomialTree,
    Dissemination,
}

impl FromStr for SyncAlgo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(SyncAlgo::Linear),
            "tree" => Ok(SyncAlgo::Tree),
            "binomial_tree" => Ok(SyncAlgo::BinomialTree),
            "dissemination" => Ok(SyncAlgo::Dissemination),
            _ => Err(Error::BadArg(format!("unknown sync algorithm '{s}'"))),
        }
    }
}

/// Broadcast algorithm family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcastAlgo {
    Linear,
    Tree,
}

impl FromStr for BcastAlgo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(BcastAlgo::Linear),
            "tree" => Ok(BcastAlgo::Tree),
            _ => Err(Error::BadArg(format!("unknown broadcast algorithm '{s}'"))),
        }
    }
}

/// Collect / fcollect algorithm family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectAlgo {
    Bruck,
    BruckInplace,
}

impl FromStr for CollectAlgo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bruck" => Ok(CollectAlgo::Bruck),
            "bruck_inplace" => Ok(CollectAlgo::BruckInplace),
            _ => Err(Error::BadArg(format!("unknown collect algorithm '{s}'"))),
        }
    }
}

/// Peer-selection schedule for alltoall variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerScheme {
    ShiftExchange,
    XorPairwise,
    ColorPairwise,
}

/// Completion flavor for alltoall variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncFlavor {
    Barrier,
    Counter,
    Signal,
}

/// Alltoall algorithm: a peer schedule plus a completion flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlltoallAlgo {
    pub scheme: PeerScheme,
    pub flavor: SyncFlavor,
}

impl AlltoallAlgo {
    pub const fn new(scheme: PeerScheme, flavor: SyncFlavor) -> Self {
        Self { scheme, flavor }
    }

    pub fn name(&self) -> &'static str {
        match (self.scheme, self.flavor) {
            (PeerScheme::ShiftExchange, SyncFlavor::Barrier) => "shift_exchange_barrier",
            (PeerScheme::ShiftExchange, SyncFlavor::Counter) => "shift_exchange_counter",
            (PeerScheme::ShiftExchange, SyncFlavor::Signal) => "shift_exchange_signal",
            (PeerScheme::XorPairwise, SyncFlavor::Barrier) => "xor_pairwise_exchange_barrier",
            (PeerScheme::XorPairwise, SyncFlavor::Counter) => "xor_pairwise_exchange_counter",
            (PeerScheme::XorPairwise, SyncFlavor::Signal) => "xor_pairwise_exchange_signal",
            (PeerScheme::ColorPairwise, SyncFlavor::Barrier) => "color_pairwise_exchange_barrier",
            (PeerScheme::ColorPairwise, SyncFlavor::Counter) => "color_pairwise_exchange_counter",
            (PeerScheme::ColorPairwise, SyncFlavor::Signal) => "color_pairwise_exchange_signal",
        }
    }
}

impl FromStr for AlltoallAlgo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, rest) = if let Some(rest) = s.strip_prefix("shift_exchange_") {
            (PeerScheme::ShiftExchange, rest)
        } else if let Some(rest) = s.strip_prefix("xor_pairwise_exchange_") {
            (PeerScheme::XorPairwise, rest)
        } else if let Some(rest) = s.strip_prefix("color_pairwise_exchange_") {
            (PeerScheme::ColorPairwise, rest)
        } else {
            return Err(Error::BadArg(format!("unknown alltoall algorithm '{s}'")));
        };
        let flavor = match rest {
            "barrier" => SyncFlavor::Barrier,
            "counter" => SyncFlavor::Counter,
            "signal" => SyncFlavor::Signal,
            _ => return Err(Error::BadArg(format!("unknown alltoall flavor '{rest}'"))),
        };
        Ok(AlltoallAlgo::new(scheme, flavor))
    }
}

/// Reduction algorithm family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceAlgo {
    RecDbl,
    Linear,
    Tree,
}

impl FromStr for ReduceAlgo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rec_dbl" => Ok(ReduceAlgo::RecDbl),
            "linear" => Ok(ReduceAlgo::Linear),
            "tree" => Ok(ReduceAlgo::Tree),
            _ => Err(Error::BadArg(format!("unknown reduction algorithm '{s}'"))),
        }
    }
}

/// Reduction operator tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ReduceOpKind {
    Sum = 0,
    Prod = 1,
    And = 2,
    Or = 3,
    Xor = 4,
    Max = 5,
    Min = 6,
}

impl ReduceOpKind {
    pub const COUNT: usize = 7;
    pub const ALL: [ReduceOpKind; Self::COUNT] = [
        ReduceOpKind::Sum,
        ReduceOpKind::Prod,
        ReduceOpKind::And,
        ReduceOpKind::Or,
        ReduceOpKind::Xor,
        ReduceOpKind::Max,
        ReduceOpKind::Min,
    ];

    /// Environment-variable stem for this operator.
    fn env_stem(&self) -> &'static str {
        match self {
            ReduceOpKind::Sum => "SUM",
            ReduceOpKind::Prod => "PROD",
            ReduceOpKind::And => "AND",
            ReduceOpKind::Or => "OR",
            ReduceOpKind::Xor => "XOR",
            ReduceOpKind::Max => "MAX",
            ReduceOpKind::Min => "MIN",
        }
    }
}

/// Declared thread support level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadLevel {
    Single,
    Funneled,
    Serialized,
    Multiple,
}

/// Which PEs run a dedicated progress thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressPolicy {
    Disabled,
    All,
    Ranks(Vec<usize>),
}

impl ProgressPolicy {
    pub fn applies_to(&self, pe: usize) -> bool {
        match self {
            ProgressPolicy::Disabled => false,
            ProgressPolicy::All => true,
            ProgressPolicy::Ranks(rs) => rs.contains(&pe),
        }
    }
}

/// Heap segment backing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapBacking {
    /// Private aligned allocation; used by in-process loopback worlds.
    Private,
    /// OS shared memory, mappable by node-local peers.
    OsShared,
}

/// Per-collective algorithm selections, resolved once at startup.
#[derive(Debug, Clone)]
pub struct CollectiveAlgos {
    pub barrier: SyncAlgo,
    pub barrier_all: SyncAlgo,
    pub sync: SyncAlgo,
    pub team_sync: SyncAlgo,
    pub sync_all: SyncAlgo,
    pub broadcast: BcastAlgo,
    pub broadcastmem: BcastAlgo,
    pub collect: CollectAlgo,
    pub collectmem: CollectAlgo,
    pub fcollect: CollectAlgo,
    pub fcollectmem: CollectAlgo,
    pub alltoall: AlltoallAlgo,
    pub alltoallmem: AlltoallAlgo,
    pub alltoalls: AlltoallAlgo,
    pub alltoallsmem: AlltoallAlgo,
    /// Indexed by `ReduceOpKind as usize`.
    pub reduce: [ReduceAlgo; ReduceOpKind::COUNT],
}

impl Default for CollectiveAlgos {
    fn default() -> Self {
        let a2a = AlltoallAlgo::new(PeerScheme::ShiftExchange, SyncFlavor::Barrier);
        Self {
            barrier: SyncAlgo::BinomialTree,
            barrier_all: SyncAlgo::BinomialTree,
            sync: SyncAlgo::BinomialTree,
            team_sync: SyncAlgo::BinomialTree,
            sync_all: SyncAlgo::BinomialTree,
            broadcast: BcastAlgo::Linear,
            broadcastmem: BcastAlgo::Linear,
            collect: CollectAlgo::Bruck,
            collectmem: CollectAlgo::Bruck,
            fcollect: CollectAlgo::BruckInplace,
            fcollectmem: CollectAlgo::BruckInplace,
            alltoall: a2a,
            alltoallmem: a2a,
            alltoalls: a2a,
            alltoallsmem: a2a,
            reduce: [ReduceAlgo::RecDbl; ReduceOpKind::COUNT],
        }
    }
}

/// Parsed runtime settings, init to finalize.
#[derive(Debug, Clone)]
pub struct Config {
    pub print_version: bool,
    pub print_info: bool,
    pub debug_checks: bool,
    pub symmetric_size: usize,
    pub logging: bool,
    pub logging_events: Vec<String>,
    pub logging_file: Option<String>,
    pub algos: CollectiveAlgos,
    pub progress: ProgressPolicy,
    pub progress_delay_ns: u64,
    pub prealloc_ctxs: usize,
    pub memerr_fatal: bool,
    pub heap_backing: HeapBacking,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            print_version: false,
            print_info: false,
            debug_checks: false,
            symmetric_size: DEFAULT_SYMMETRIC_SIZE,
            logging: false,
            logging_events: Vec::new(),
            logging_file: None,
            algos: CollectiveAlgos::default(),
            progress: ProgressPolicy::Disabled,
            progress_delay_ns: DEFAULT_PROGRESS_DELAY_NS,
            prealloc_ctxs: DEFAULT_PREALLOC_CTXS,
            memerr_fatal: false,
            heap_backing: HeapBacking::Private,
        }
    }
}

/// Look up `SHMEM_<key>`, falling back to the deprecated `SMA_<key>`.
fn lookup(key: &str) -> Option<String> {
    if let Ok(v) = std::env::var(format!("SHMEM_{key}")) {
        return Some(v);
    }
    if let Ok(v) = std::env::var(format!("SMA_{key}")) {
        warn!("SMA_{key} is deprecated, use SHMEM_{key}");
        return Some(v);
    }
    None
}

/// Boolean grammar: y/yes/on (case-insensitive) or a non-zero integer.
pub fn parse_bool(s: &str) -> bool {
    let t = s.trim().to_ascii_lowercase();
    matches!(t.as_str(), "y" | "yes" | "on") || t.parse::<i64>().map(|n| n != 0).unwrap_or(false)
}

/// Size grammar: decimal with optional K/M/G/T/P/E suffix, base 1024.
pub fn parse_size_spec(s: &str) -> Result<usize> {
    let t = s.trim();
    if t.is_empty() {
        return Err(Error::BadArg("empty size spec".into()));
    }
    let (digits, shift) = match t.as_bytes()[t.len() - 1].to_ascii_uppercase() {
        b'K' => (&t[..t.len() - 1], 10),
        b'M' => (&t[..t.len() - 1], 20),
        b'G' => (&t[..t.len() - 1], 30),
        b'T' => (&t[..t.len() - 1], 40),
        b'P' => (&t[..t.len() - 1], 50),
        b'E' => (&t[..t.len() - 1], 60),
        _ => (t, 0),
    };
    let n: usize = digits
        .trim()
        .parse()
        .map_err(|_| Error::BadArg(format!("bad size spec '{s}'")))?;
    n.checked_shl(shift)
        .filter(|_| shift == 0 || (n as u128) << shift <= usize::MAX as u128)
        .ok_or_else(|| Error::BadArg(format!("size spec '{s}' overflows")))
}

/// Human-readable base-1024 size, one decimal place ("8.0M").
pub fn format_size(bytes: usize) -> String {
    const SUFFIX: [&str; 7] = ["B", "K", "M", "G", "T", "P", "E"];
    let mut v = bytes as f64;
    let mut i = 0;
    while v >= 1024.0 && i < SUFFIX.len() - 1 {
        v /= 1024.0;
        i += 1;
    }
    if i == 0 {
        format!("{bytes}B")
    } else {
        format!("{v:.1}{}", SUFFIX[i])
    }
}

fn parse_progress_policy(s: &str) -> ProgressPolicy {
    let t = s.trim().to_ascii_lowercase();
    if t == "all" || parse_bool(&t) && t.parse::<i64>().is_err() {
        return ProgressPolicy::All;
    }
    let ranks: Vec<usize> = t
        .split(',')
        .filter_map(|p| p.trim().parse().ok())
        .collect();
    if ranks.is_empty() {
        ProgressPolicy::Disabled
    } else {
        ProgressPolicy::Ranks(ranks)
    }
}

fn algo_var<T: FromStr<Err = Error>>(key: &str, deprecated: Option<&str>, out: &mut T) {
    let raw = lookup(key).or_else(|| {
        deprecated.and_then(|d| {
            let v = lookup(d);
            if v.is_some() {
                warn!("SHMEM_{d} is deprecated, use SHMEM_{key}");
            }
            v
        })
    });
    if let Some(raw) = raw {
        match raw.parse() {
            Ok(v) => *out = v,
            Err(e) => warn!("ignoring SHMEM_{key}: {e}"),
        }
    }
}

impl Config {
    /// Parse the full `SHMEM_` (and deprecated `SMA_`) environment.
    pub fn from_env() -> Self {
        let mut c = Config::default();

        if let Some(v) = lookup("VERSION") {
            c.print_version = parse_bool(&v);
        }
        if let Some(v) = lookup("INFO") {
            c.print_info = parse_bool(&v);
        }
        if let Some(v) = lookup("DEBUG") {
            c.debug_checks = parse_bool(&v);
        }
        if let Some(v) = lookup("SYMMETRIC_SIZE") {
            match parse_size_spec(&v) {
                Ok(n) => c.symmetric_size = n,
                Err(e) => warn!("ignoring SHMEM_SYMMETRIC_SIZE: {e}"),
            }
        }
        if let Some(v) = lookup("LOGGING") {
            c.logging = parse_bool(&v);
        }
        if let Some(v) = lookup("LOGGING_EVENTS") {
            c.logging_events = v
                .split([',', ';'])
                .map(|e| e.trim().to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect();
        }
        if let Some(v) = lookup("LOGGING_FILE") {
            c.logging_file = Some(v);
        }
        if let Some(v) = lookup("PROGRESS_THREADS") {
            c.progress = parse_progress_policy(&v);
        }
        if let Some(v) = lookup("PROGRESS_DELAY") {
            match parse_size_spec(&v) {
                Ok(n) => c.progress_delay_ns = n as u64,
                Err(e) => warn!("ignoring SHMEM_PROGRESS_DELAY: {e}"),
            }
        }
        if let Some(v) = lookup("PREALLOC_CTXS") {
            match v.trim().parse::<usize>() {
                Ok(n) => c.prealloc_ctxs = n.max(1),
                Err(_) => warn!("ignoring SHMEM_PREALLOC_CTXS: '{v}' is not a count"),
            }
        }
        if let Some(v) = lookup("MEMERR_FATAL") {
            c.memerr_fatal = parse_bool(&v);
        }

        let a = &mut c.algos;
        algo_var("BARRIER_ALGO", None, &mut a.barrier);
        algo_var("BARRIER_ALL_ALGO", None, &mut a.barrier_all);
        algo_var("SYNC_ALGO", None, &mut a.sync);
        algo_var("TEAM_SYNC_ALGO", None, &mut a.team_sync);
        algo_var("SYNC_ALL_ALGO", None, &mut a.sync_all);
        algo_var("BROADCAST_ALGO", None, &mut a.broadcast);
        algo_var("BROADCASTMEM_ALGO", Some("BROADCAST_SIZE_ALGO"), &mut a.broadcastmem);
        algo_var("COLLECT_ALGO", None, &mut a.collect);
        algo_var("COLLECTMEM_ALGO", Some("COLLECT_SIZE_ALGO"), &mut a.collectmem);
        algo_var("FCOLLECT_ALGO", None, &mut a.fcollect);
        algo_var("FCOLLECTMEM_ALGO", Some("FCOLLECT_SIZE_ALGO"), &mut a.fcollectmem);
        algo_var("ALLTOALL_ALGO", None, &mut a.alltoall);
        algo_var("ALLTOALLMEM_ALGO", Some("ALLTOALL_SIZE_ALGO"), &mut a.alltoallmem);
        algo_var("ALLTOALLS_ALGO", None, &mut a.alltoalls);
        algo_var("ALLTOALLSMEM_ALGO", Some("ALLTOALLS_SIZE_ALGO"), &mut a.alltoallsmem);

        for op in ReduceOpKind::ALL {
            let stem = op.env_stem();
            let mut algo = a.reduce[op as usize];
            algo_var(&format!("{stem}_REDUCE_ALGO"), None, &mut algo);
            // Legacy active-set spelling wins only if the team spelling is absent.
            if lookup(&format!("{stem}_REDUCE_ALGO")).is_none() {
                algo_var(&format!("{stem}_TO_ALL_ALGO"), None, &mut algo);
            }
            a.reduce[op as usize] = algo;
        }

        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_spec_suffixes() {
        assert_eq!(parse_size_spec("8M").unwrap(), 8 * 1024 * 1024);
        assert_eq!(parse_size_spec("1K").unwrap(), 1024);
        assert_eq!(parse_size_spec("2g").unwrap(), 2usize << 30);
        assert_eq!(parse_size_spec("4096").unwrap(), 4096);
        assert!(parse_size_spec("").is_err());
        assert!(parse_size_spec("12Q").is_err());
        assert!(parse_size_spec("x1K").is_err());
    }

    #[test]
    fn size_banner_format() {
        assert_eq!(format_size(8 * 1024 * 1024), "8.0M");
        assert_eq!(format_size(1536), "1.5K");
        assert_eq!(format_size(512), "512B");
    }

    #[test]
    fn bool_grammar() {
        assert!(parse_bool("y"));
        assert!(parse_bool("Yes"));
        assert!(parse_bool("on"));
        assert!(parse_bool("3"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("off"));
        assert!(!parse_bool("nope"));
    }

    #[test]
    fn alltoall_algo_names_round_trip() {
        for scheme in [
            PeerScheme::ShiftExchange,
            PeerScheme::XorPairwise,
            PeerScheme::ColorPairwise,
        ] {
            for flavor in [SyncFlavor::Barrier, SyncFlavor::Counter, SyncFlavor::Signal] {
                let a = AlltoallAlgo::new(scheme, flavor);
                assert_eq!(a.name().parse::<AlltoallAlgo>().unwrap(), a);
            }
        }
    }

    #[test]
    fn progress_policy_grammar() {
        assert_eq!(parse_progress_policy("all"), ProgressPolicy::All);
        assert_eq!(parse_progress_policy("yes"), ProgressPolicy::All);
        assert_eq!(
            parse_progress_policy("0, 2,5"),
            ProgressPolicy::Ranks(vec![0, 2, 5])
        );
        assert!(!parse_progress_policy("").applies_to(0));
    }

    #[test]
    fn default_algorithm_table() {
        let a = CollectiveAlgos::default();
        assert_eq!(a.barrier, SyncAlgo::BinomialTree);
        assert_eq!(a.broadcast, BcastAlgo::Linear);
        assert_eq!(a.collect, CollectAlgo::Bruck);
        assert_eq!(a.fcollect, CollectAlgo::BruckInplace);
        assert_eq!(a.alltoall.name(), "shift_exchange_barrier");
        assert_eq!(a.reduce[ReduceOpKind::Sum as usize], ReduceAlgo::RecDbl);
    }
}
