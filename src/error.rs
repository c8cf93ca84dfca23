use std::io;

use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

/// API-level errors. Terminal blob failures are not errors; they are
/// surfaced as a broken [`BlobStatus`](crate::entry::BlobStatus) through
/// status queries and completion callbacks.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// The uuid is not present in the registry.
    UnknownBlob(Uuid),
    /// The blob exists but is not in the phase the call requires.
    WrongPhase(Uuid, &'static str),
    /// A builder was submitted under a uuid that is already registered.
    BlobExists(Uuid),
    /// A transport population call referenced a bad item or range.
    InvalidPopulation(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::UnknownBlob(uuid) => write!(f, "Unknown blob: {}", uuid),
            Error::WrongPhase(uuid, expected) => {
                write!(f, "Blob {} is not in phase {}", uuid, expected)
            }
            Error::BlobExists(uuid) => write!(f, "Blob already registered: {}", uuid),
            Error::InvalidPopulation(msg) => write!(f, "Invalid population: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
