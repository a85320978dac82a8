#[macro_use]
extern crate serde_derive;

pub mod addr;
mod client;
pub mod conf;
pub mod dht;
pub mod error;
pub mod metainfo;
pub mod pathselection;
pub mod peer;
pub mod seeder;
pub mod socket;
#[cfg(test)]
mod testutil;
pub mod torrent;

use bitvec::prelude::{BitVec, Msb0};

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

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
pub type Bitfield = BitVec<u8, Msb0>;

/// The largest number of bytes a single request can ask for.
pub(crate) const MAX_BLOCK_LEN: u32 = 256 * 1024;

/// The number of unfulfilled requests a connection may keep in its pipeline.
pub(crate) const MAX_BACKLOG: u32 = 5;

/// Returns the length of the block starting at the given offset in piece.
///
/// All blocks but the last one in piece are `MAX_BLOCK_LEN` long; the last
/// one is clamped to the bytes remaining in piece.
///
/// # Panics
///
/// Panics if the offset is at or past the end of the piece.
pub(crate) fn block_len(piece_len: u32, offset: u32) -> u32 {
    assert!(piece_len > offset);
    std::cmp::min(piece_len - offset, MAX_BLOCK_LEN)
}

/// Returns the length of the piece at the given index.
///
/// All pieces but the last one are `piece_len` long; the last one covers only
/// the bytes remaining in the download.
pub(crate) fn piece_len(total_len: u64, piece_len: u32, index: PieceIndex) -> u32 {
    let begin = index as u64 * piece_len as u64;
    let end = std::cmp::min(begin + piece_len as u64, total_len);
    debug_assert!(begin < end);
    (end - begin) as u32
}

/// Returns the number of pieces in a download of the given length.
pub(crate) fn piece_count(total_len: u64, piece_len: u32) -> usize {
    // the last piece may be shorter than the rest so we need to round up
    // before dividing to get the piece count
    ((total_len + piece_len as u64 - 1) / piece_len as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    // An arbitrary piece length that is an exact multiple of the maximum
    // block length (256 KiB).
    const BLOCK_LEN_MULTIPLE_PIECE_LEN: u32 = 2 * MAX_BLOCK_LEN;

    // An arbitrary piece length that is _not_ a multiple of the maximum block
    // length and the amount with which it overlaps the nearest exact multiple
    // value.
    const OVERLAP: u32 = 234;
    const UNEVEN_PIECE_LEN: u32 = 2 * MAX_BLOCK_LEN + OVERLAP;

    #[test]
    fn test_block_len() {
        assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 0), MAX_BLOCK_LEN);
        assert_eq!(
            block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, MAX_BLOCK_LEN),
            MAX_BLOCK_LEN
        );

        assert_eq!(block_len(UNEVEN_PIECE_LEN, 0), MAX_BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, MAX_BLOCK_LEN), MAX_BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 2 * MAX_BLOCK_LEN), OVERLAP);
    }

    #[test]
    #[should_panic]
    fn test_block_len_invalid_offset_panic() {
        block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 2 * MAX_BLOCK_LEN);
    }

    #[test]
    fn test_piece_len() {
        // 3 full pieces and a 2 byte runt
        let total_len = 3 * 4 + 2;
        assert_eq!(piece_len(total_len, 4, 0), 4);
        assert_eq!(piece_len(total_len, 4, 2), 4);
        assert_eq!(piece_len(total_len, 4, 3), 2);

        // 300000 bytes in 262144 byte pieces leaves a short last piece
        assert_eq!(piece_len(300_000, 262_144, 0), 262_144);
        assert_eq!(piece_len(300_000, 262_144, 1), 37_856);
    }

    #[test]
    fn test_piece_count() {
        assert_eq!(piece_count(3 * 4 + 2, 4), 4);
        assert_eq!(piece_count(3 * 4, 4), 3);
        assert_eq!(piece_count(300_000, 262_144), 2);
    }
}
