use thiserror::Error;

/// Errors surfaced by the FTL engine.
///
/// `Config` is the one variant with no request-path analogue; it covers
/// construction-time validation failures only.
#[derive(Error, Debug)]
pub enum FtlError {
    #[error("out of space: no free block and no recoverable GC victim")]
    OutOfSpace,

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("logical address {sector} out of range")]
    BadAddress { sector: u64 },

    #[error("device error: {0}")]
    Device(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, FtlError>;

/// Raises an integrity violation: aborts in debug builds, logs and returns
/// an error in release.
#[macro_export]
macro_rules! integrity_violation {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        if cfg!(debug_assertions) {
            panic!("integrity violation: {}", msg);
        } else {
            tracing::error!(target: "ftl::integrity", "{}", msg);
            return Err($crate::error::FtlError::Integrity(msg));
        }
    }};
}
