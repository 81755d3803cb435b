use thiserror::Error;

/// Errors produced by the chainstore engine, its storage shim and its
/// replication multiplexer.
#[derive(Debug, Error)]
pub enum Error {
    /// A namespaced `default()` call had no name to derive from.
    #[error("default() requires a name")]
    MissingName,

    /// The name persisted on disk for a chain does not hash to the
    /// discovery key the resolver expected.
    #[error("name stored on disk does not match the requested discovery key")]
    WrongNameStored,

    /// A passive `get({discovery_key})` found no on-disk record for that id.
    /// Callers of `get` never see this directly: the engine treats it as
    /// "not present on this node" (see `inner::Inner`).
    #[error("no local keypair for this discovery key")]
    UnknownKeypair,

    /// The backing `Storage` reported that an object does not exist.
    #[error("not found")]
    NotFound,

    /// Any other storage I/O failure.
    #[error("storage error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound
        } else {
            Error::Io(value.to_string())
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::NotFound => std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            other => std::io::Error::other(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
