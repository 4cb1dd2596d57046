//! Error taxonomy for the runtime

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("runtime not initialized or already finalized")]
    Uninitialized,

    #[error("bad argument: {0}")]
    BadArg(String),

    #[error("address {0:#x} is not in any symmetric region")]
    NotSymmetric(usize),

    #[error("source and destination buffers overlap")]
    BufferOverlap,

    #[error("no pSync slot available for team {0}")]
    NoSlot(usize),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("symmetric allocation of {0} bytes failed")]
    AllocFail(usize),

    #[error("symmetric heap {0} corrupted")]
    Corruption(usize),

    #[error("context {0} is private to another thread")]
    ThreadViolation(usize),

    #[error("algorithm {algo} unsupported: {reason}")]
    AlgoUnsupported { algo: &'static str, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Soft errors are returned to the caller; everything else routes
    /// through the global-exit path.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Error::BadArg(_)
                | Error::NoSlot(_)
                | Error::AllocFail(_)
                | Error::AlgoUnsupported { .. }
        )
    }
}
