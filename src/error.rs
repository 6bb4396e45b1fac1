use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Operation attempted before a successful mount.
    NotReady,
    /// Rejected request: oversized value, reserved key, bad geometry.
    InvalidArgument(&'static str),
    /// Write cannot proceed even after offering every sector to the
    /// garbage collector.
    NoSpace,
    /// No live entry for the requested key or history index.
    NotFound,
    /// Propagated verbatim from the flash device; fatal for the current
    /// operation, never retried internally.
    Medium(io::Error),
    /// Mount could not find any internally consistent sector boundary.
    Corrupt(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Medium(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotReady => write!(f, "store is not mounted"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::NoSpace => write!(f, "no space left on device"),
            Error::NotFound => write!(f, "key not found"),
            Error::Medium(err) => write!(f, "medium error: {}", err),
            Error::Corrupt(msg) => write!(f, "corrupted store: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
