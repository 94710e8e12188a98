/// Represents errors that can occur in the storage engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Malformed persistent bytes (bad checksum, bad footer magic,
    /// invalid internal key, unknown manifest tag, ...)
    Corruption(String),

    /// Caller handed the engine something it cannot accept,
    /// e.g. out-of-order keys fed to a table writer
    InvalidArgument(String),

    /// A data block carries a compression type this build does not know
    UnsupportedCompression(u8),

    /// Operation was attempted after the database was closed
    Closed,

    /// An iterator was used after its backing store went away
    Released,

    /// The database folder is locked by another process
    Locked,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SiltError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

// A journal write failure has to be handed to every writer of a merged
// commit group and is kept as the sticky background error, so the error
// needs to be clonable. `std::io::Error` is not `Clone`; the copy keeps
// the kind and message.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Corruption(msg) => Self::Corruption(msg.clone()),
            Self::InvalidArgument(msg) => Self::InvalidArgument(msg.clone()),
            Self::UnsupportedCompression(t) => Self::UnsupportedCompression(*t),
            Self::Closed => Self::Closed,
            Self::Released => Self::Released,
            Self::Locked => Self::Locked,
        }
    }
}

/// Storage engine result
pub type Result<T> = std::result::Result<T, Error>;
