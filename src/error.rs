//! Error kinds and the reporting surface. Fatal conditions unwind to the
//! caller of the top-level operation as an [`Error`]; recoverable ones
//! (unknown dynamic tag, bad machine on a library candidate, unexpanded
//! rpath token) go through a pluggable [`Reporter`] at warning level and
//! the operation keeps going.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// No parser claims the leading magic bytes.
    #[error("unknown executable format with magic: {}", hex4(.0))]
    UnknownFormat([u8; 4]),

    /// A parser was invoked on a file that fails its magic check.
    #[error("{0}")]
    BadMagic(&'static str),

    /// A typed read past the end of a buffer.
    #[error("read of {size} bytes at offset {offset:#x} exceeds buffer of {len} bytes")]
    OutOfBounds { offset: usize, size: usize, len: usize },

    /// Structurally invalid content: bad table sizes, bad string offsets,
    /// malformed notes and the like.
    #[error("{0}")]
    Malformed(String),

    /// Valid but outside what this crate implements.
    #[error("{0}")]
    Unsupported(String),

    /// The requested stack cannot hold the initial process data.
    #[error("stack size too small")]
    StackTooSmall,
}

impl Error {
    pub(crate) fn out_of_bounds(offset: usize, size: usize, len: usize) -> Error {
        Error::OutOfBounds { offset, size, len }
    }
}

fn hex4(magic: &[u8; 4]) -> String {
    format!("{:02x}{:02x}{:02x}{:02x}", magic[0], magic[1], magic[2], magic[3])
}

/// Severity of a reported condition.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Info,
    Warning,
    Error,
    Fatal,
}

/// Sink for recoverable problems. Parsers and builders call this and then
/// continue where the format allows it; install your own to collect or
/// suppress diagnostics.
pub trait Reporter {
    fn report(&self, level: Level, message: &str);
}

/// Default sink, forwarding to the `tracing` subscriber of the process.
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, level: Level, message: &str) {
        match level {
            Level::Info => tracing::info!("{message}"),
            Level::Warning => tracing::warn!("{message}"),
            Level::Error | Level::Fatal => tracing::error!("{message}"),
        }
    }
}
