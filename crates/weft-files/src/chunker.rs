//! In-memory chunking for file transfer.
//!
//! Files are split into fixed-size chunks; the last chunk may be shorter. A
//! zero-byte file yields exactly one empty chunk so every transfer has at
//! least one Merkle leaf.

use crate::merkle::CHUNK_SIZE;

/// Number of chunks a file of `size` bytes splits into
///
/// A zero-byte file still occupies one chunk.
#[must_use]
pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    if size == 0 {
        1
    } else {
        size.div_ceil(chunk_size as u64)
    }
}

/// Split `data` into chunks of `chunk_size`
///
/// Returns borrowed slices; empty input yields a single empty chunk.
#[must_use]
pub fn split_chunks(data: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    if data.is_empty() {
        return vec![&[]];
    }
    data.chunks(chunk_size).collect()
}

/// Split `data` using the protocol chunk size
#[must_use]
pub fn split_default(data: &[u8]) -> Vec<&[u8]> {
    split_chunks(data, CHUNK_SIZE)
}
