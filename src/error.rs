use std::{fmt, io};

use tokio::sync::mpsc::error::SendError;

/// The crate wide result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type used by all parts of the engine.
#[derive(Debug)]
pub enum Error {
    /// The torrent metainfo could not be parsed as bencode.
    Bencode(serde_bencode::Error),
    /// The torrent metainfo parsed but describes an invalid torrent.
    InvalidMetainfo(&'static str),
    /// The tracker could not be reached or returned an invalid or failure
    /// response during the initial announce.
    Tracker(String),
    /// A torrent with the same info hash is already in the engine.
    AlreadyAdded,
    /// The info hash does not belong to any torrent in the engine.
    InvalidTorrentId,
    /// The peer's handshake advertised a different torrent than ours.
    InvalidPeerInfoHash,
    /// The peer sent a bitfield message at any time other than right after the
    /// handshake, which the standard doesn't allow.
    BitfieldNotAfterHandshake,
    /// A piece index was out of the torrent's bounds.
    InvalidPieceIndex,
    /// A block's offset and length don't fit the torrent's byte range.
    InvalidBlock,
    /// An IO error occurred on a socket or on one of the torrent's files.
    Io(io::Error),
    /// The sending or receiving end of a channel to another task was closed.
    Channel,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Bencode(e) => write!(f, "invalid bencode: {}", e),
            Self::InvalidMetainfo(reason) => {
                write!(f, "invalid metainfo: {}", reason)
            }
            Self::Tracker(reason) => write!(f, "tracker error: {}", reason),
            Self::AlreadyAdded => write!(f, "torrent already added"),
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
            Self::InvalidPeerInfoHash => {
                write!(f, "peer handshake has invalid info hash")
            }
            Self::BitfieldNotAfterHandshake => {
                write!(f, "peer sent bitfield not after handshake")
            }
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::InvalidBlock => write!(f, "invalid block"),
            Self::Io(e) => write!(f, "{}", e),
            Self::Channel => write!(f, "channel to task closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bencode(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl<T> From<SendError<T>> for Error {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}
