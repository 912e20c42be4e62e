//! Error types shared by the cache engine, the wire protocol and the client.

use thiserror::Error;

/// Wire status codes carried in ACK frames.
pub mod status {
    pub const OK: u32 = 0;
    pub const INVALID_RANGE: u32 = 1;
    pub const NOT_FOUND: u32 = 2;
    pub const POOL_EXHAUSTED: u32 = 3;
    pub const DEVICE_MISMATCH: u32 = 4;
    pub const TRANSPORT: u32 = 5;
    pub const PROTOCOL: u32 = 6;
}

#[derive(Debug, Error)]
pub enum Error {
    /// Tensor offset/length out of bounds, or an extent request that does not
    /// fit the pool's block size.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// Read of an unbound key.
    #[error("key not found: {0}")]
    NotFound(String),

    /// The allocator cannot satisfy a write.
    #[error("device pool exhausted")]
    PoolExhausted,

    /// Tensor not on a device, or not contiguous.
    #[error("device mismatch: {0}")]
    DeviceMismatch(String),

    /// Connection closed, verb failure, or I/O error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed frame or an out-of-sequence command.
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Status code for the ACK frame.
    pub fn status(&self) -> u32 {
        match self {
            Error::InvalidRange(_) => status::INVALID_RANGE,
            Error::NotFound(_) => status::NOT_FOUND,
            Error::PoolExhausted => status::POOL_EXHAUSTED,
            Error::DeviceMismatch(_) => status::DEVICE_MISMATCH,
            Error::Transport(_) => status::TRANSPORT,
            Error::Protocol(_) => status::PROTOCOL,
        }
    }

    /// Reconstruct an error from an ACK status code.
    pub fn from_status(code: u32, context: &str) -> Option<Error> {
        match code {
            status::OK => None,
            status::INVALID_RANGE => Some(Error::InvalidRange(context.to_string())),
            status::NOT_FOUND => Some(Error::NotFound(context.to_string())),
            status::POOL_EXHAUSTED => Some(Error::PoolExhausted),
            status::DEVICE_MISMATCH => Some(Error::DeviceMismatch(context.to_string())),
            status::TRANSPORT => Some(Error::Transport(context.to_string())),
            _ => Some(Error::Protocol(format!("status {code} ({context})"))),
        }
    }

    /// True for failures that tear the connection down rather than surfacing
    /// as a single op's status.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Protocol(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
