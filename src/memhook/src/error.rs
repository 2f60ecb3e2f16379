//! Error types for the memhook engine.

use thiserror::Error;

use crate::memory::MemoryAddress;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Could not connect to the emulator: {0}")]
    Connection(String),

    #[error("Driver read failed: {0}")]
    DriverRead(String),

    #[error("Driver write failed: {0}")]
    DriverWrite(String),

    #[error("Unable to determine a mapper with the ID of {0}")]
    MapperNotFound(String),

    #[error("Mapper file {0} was not found on disk")]
    MapperFileMissing(String),

    #[error("Unsupported mapper format: {0}")]
    UnsupportedMapperFormat(String),

    #[error("Malformed mapper: {0}")]
    MapperParse(String),

    #[error("Unknown game platform {0}")]
    UnknownPlatform(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Value {0} cannot be converted to a byte because it is out of range")]
    ByteRange(f64),

    #[error("Memory at {address:#x} ({length} bytes) in namespace '{namespace}' has not been read")]
    MemoryUnmapped {
        namespace: String,
        address: MemoryAddress,
        length: usize,
    },

    #[error("Cannot decode property value: {0}")]
    Decode(String),

    #[error("{context}: {source}")]
    PropertyProcess {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Notifier failed: {0}")]
    Notifier(String),

    #[error("Instance is not initialized: {0}")]
    NotInitialized(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a failure raised while processing the property at `path`.
    pub fn property(path: &str, source: Error) -> Self {
        Error::PropertyProcess {
            context: format!("Property {} failed to run processor", path),
            source: Box::new(source),
        }
    }

    /// Wrap a notifier failure raised while publishing `count` changed properties.
    pub fn notification(count: usize, source: Error) -> Self {
        Error::PropertyProcess {
            context: format!("Could not send {} property change events", count),
            source: Box::new(source),
        }
    }
}

impl From<Box<rhai::EvalAltResult>> for Error {
    fn from(err: Box<rhai::EvalAltResult>) -> Self {
        Error::Script(err.to_string())
    }
}

impl From<rhai::ParseError> for Error {
    fn from(err: rhai::ParseError) -> Self {
        Error::Script(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
