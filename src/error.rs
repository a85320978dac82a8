//! Error types used throughout the engine.

use std::{fmt, io};

use crate::PieceIndex;

pub type Result<T> = std::result::Result<T, Error>;

/// The error type used by all parts of the engine.
#[derive(Debug)]
pub enum Error {
    /// The handshake had a zero length protocol string or was truncated.
    BadHandshake,
    /// The peer offered a torrent other than the one we expected. Fatal for
    /// the connection.
    InfoHashMismatch,
    /// The first message after the handshake was not a bitfield.
    BitfieldExpected,
    /// A frame on the wire had a bad length prefix, a payload of the wrong
    /// size, or out of range indices.
    MalformedMessage(String),
    /// A fully assembled piece did not hash to its expected SHA-1 digest.
    PieceIntegrity { index: PieceIndex },
    /// A read deadline was exceeded.
    Timeout,
    /// The underlying connection closed or failed unexpectedly.
    Transport(io::Error),
    /// Session cancellation was requested.
    Cancelled,
    /// The session was constructed with an unsupported configuration.
    Config(String),
    /// The session ended with undelivered pieces and no live workers.
    DownloadFailed,
    /// The metainfo file could not be parsed.
    Metainfo(String),
    /// A piece index was out of range for the torrent.
    InvalidPieceIndex,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BadHandshake => write!(f, "bad handshake"),
            Error::InfoHashMismatch => write!(f, "info hash mismatch"),
            Error::BitfieldExpected => {
                write!(f, "expected bitfield after handshake")
            }
            Error::MalformedMessage(reason) => {
                write!(f, "malformed message: {}", reason)
            }
            Error::PieceIntegrity { index } => {
                write!(f, "piece {} failed integrity check", index)
            }
            Error::Timeout => write!(f, "read deadline exceeded"),
            Error::Transport(e) => write!(f, "transport failure: {}", e),
            Error::Cancelled => write!(f, "session cancelled"),
            Error::Config(reason) => write!(f, "invalid config: {}", reason),
            Error::DownloadFailed => write!(f, "download failed"),
            Error::Metainfo(reason) => {
                write!(f, "invalid metainfo: {}", reason)
            }
            Error::InvalidPieceIndex => write!(f, "invalid piece index"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::Metainfo(e.to_string())
    }
}
