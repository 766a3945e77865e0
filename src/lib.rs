// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod conf;
mod disk;
pub mod engine;
pub mod error;
pub mod metainfo;
mod peer;
mod piece_picker;
mod storage_info;
mod torrent;
mod tracker;

use bitvec::prelude::{BitVec, Msb0};

pub use storage_info::FileInfo;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// The type of a file's index.
pub type FileIndex = usize;

/// Each torrent gets a randomly assigned ID that is unique within the
/// application.
pub type TorrentId = u32;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significants
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001` would
/// mean that we have pieces 0, 1, and 7). A truthy boolean value of a piece's
/// position in this vector means that the peer has the piece, while a falsy
/// value means it doesn't have the piece.
pub type Bitfield = BitVec<Msb0, u8>;

/// This is the only block length we're dealing with (except for possibly the
/// last block).  It is the widely used and accepted 16 KiB.
pub(crate) const BLOCK_LEN: u32 = 0x4000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happen at this block level
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. Always 16 KiB (0x4000 bytes), except for
    /// the block that runs into the end of its piece, which may be shorter.
    pub len: u32,
}

/// Returns the length of the block starting at the given offset in a piece of
/// the given length.
///
/// All blocks are the canonical 16 KiB long except the one that runs into the
/// end of the piece.
///
/// # Panics
///
/// Panics if the offset is at or past the end of the piece.
pub(crate) fn block_len_at(piece_len: u32, offset: u32) -> u32 {
    assert!(piece_len > offset);
    std::cmp::min(piece_len - offset, BLOCK_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    // An arbitrary piece length that is an exact multiple of the canonical
    // block length (16 KiB).
    const BLOCK_LEN_MULTIPLE_PIECE_LEN: u32 = 2 * BLOCK_LEN;

    // An arbitrary piece length that is _not_ a multiple of the canonical block
    // length and the amount with which it overlaps the nearest exact multiple
    // value.
    const OVERLAP: u32 = 234;
    const UNEVEN_PIECE_LEN: u32 = 2 * BLOCK_LEN + OVERLAP;

    #[test]
    fn test_block_len_at() {
        assert_eq!(block_len_at(BLOCK_LEN_MULTIPLE_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(
            block_len_at(BLOCK_LEN_MULTIPLE_PIECE_LEN, BLOCK_LEN),
            BLOCK_LEN
        );

        assert_eq!(block_len_at(UNEVEN_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len_at(UNEVEN_PIECE_LEN, BLOCK_LEN), BLOCK_LEN);
        assert_eq!(block_len_at(UNEVEN_PIECE_LEN, 2 * BLOCK_LEN), OVERLAP);
    }

    #[test]
    #[should_panic]
    fn test_block_len_at_end_of_piece_panic() {
        block_len_at(BLOCK_LEN_MULTIPLE_PIECE_LEN, 2 * BLOCK_LEN);
    }
}
