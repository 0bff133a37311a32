use std::time::Duration;

use thiserror::Error;

/// Every failure kind the ICE bridge stack can surface.
#[derive(Debug, Error)]
pub enum IceError {
    #[error("operation requires connect() first")]
    NotConnected,

    #[error("malformed frame: {0}")]
    FormatError(String),

    #[error("invalid argument: {0}")]
    ParameterError(String),

    #[error("peer NAKed request after exhausting retries")]
    NakError,

    #[error("protocol version {current:?} does not support this call (requires {required:?})")]
    VersionError { required: (u8, u8), current: (u8, u8) },

    #[error("peer lacks capability '{required}' (have {have:?})")]
    CapabilityError { required: char, have: String },

    #[error("serial read timed out after {elapsed:?}, got {partial} of the expected bytes")]
    TimeoutError { elapsed: Duration, partial: usize },

    #[error("access at {addr:#x} of size {size} crosses a 32-bit word boundary")]
    Unaligned { addr: u32, size: u8 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type IceResult<T> = Result<T, IceError>;
