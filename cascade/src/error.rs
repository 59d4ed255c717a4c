use serde_derive::{Deserialize, Serialize};

/// A shorthand result type used across the crate.
pub type CResult<T> = std::result::Result<T, Error>;

/// Errors are serializable so they can be shipped to a remote caller as-is.
///
/// Rejected mutations and absent keys are NOT errors: those outcomes travel
/// as sentinel values in the reply (see the store operations). Only genuine
/// faults end up here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid data or argument, typically from the caller.
    Value(String),

    /// Failed to parse or decode bytes.
    Parse(String),

    /// A log frame failed its checksum away from the tail. The local replica
    /// cannot trust its log anymore and must rehydrate from its peers.
    Corruption(String),

    /// Unrecoverable internal error.
    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Value(s) => write!(f, "value error: {}", s),
            Error::Parse(s) => write!(f, "parse error: {}", s),
            Error::Corruption(s) => write!(f, "log corruption: {}", s),
            Error::Internal(s) => write!(f, "internal error: {}", s),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::Parse(err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn io_error_converts_to_internal() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(err, Error::Internal("boom".to_string()));
    }

    #[test]
    fn display() {
        assert_eq!(
            Error::Corruption("bad frame".to_string()).to_string(),
            "log corruption: bad frame"
        );
    }
}
