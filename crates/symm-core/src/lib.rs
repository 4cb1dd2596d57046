//! symm - partitioned global address space runtime core

pub mod coll;
pub mod config;
pub mod context;
pub mod elem;
pub mod error;
pub mod freelist;
pub mod heap;
pub mod launch;
pub mod logger;
pub mod loopback;
pub mod psync;
pub mod region;
pub mod runtime;
pub mod segment;
pub mod team;
pub mod transport;

pub use config::{Config, ReduceOpKind, ThreadLevel};
pub use context::{CtxHandle, CTX_NOSTORE, CTX_PRIVATE, CTX_SERIALIZED};
pub use elem::{Complex32, Complex64, ShmemElem};
pub use error::{Error, Result};
pub use region::SymAddr;
pub use runtime::Runtime;
pub use team::{ActiveSet, TeamId, TEAM_SHARED, TEAM_WORLD};
