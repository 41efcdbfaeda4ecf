//! Error types for the file transfer engine.

use thiserror::Error;

/// Errors from Merkle tree construction, serialization, and proofs
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MerkleError {
    /// A tree needs at least one leaf (a zero-byte file has one empty leaf)
    #[error("merkle tree requires at least one leaf")]
    Empty,

    /// Serialized leaf count differs from the expected count
    #[error("leaf count mismatch: expected {expected}, stored {actual}")]
    LeafCountMismatch {
        /// Count the caller expected
        expected: u32,
        /// Count recorded in the serialized tree
        actual: u32,
    },

    /// Serialized bytes do not describe a well-formed tree
    #[error("malformed serialized tree: {0}")]
    Malformed(&'static str),

    /// Leaf index outside the tree
    #[error("leaf index {index} out of range for {leaf_count} leaves")]
    OutOfRange {
        /// Requested leaf index
        index: u32,
        /// Number of leaves in the tree
        leaf_count: u32,
    },

    /// A proof was requested before every sibling hash on the path is known
    #[error("proof for leaf {0} is not yet stable")]
    ProofUnavailable(u32),

    /// The incremental builder has unfilled leaves
    #[error("incremental tree is incomplete")]
    Incomplete,
}

/// Errors from upload/download state machines
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// A chunk's inclusion proof did not verify against the declared root
    #[error("proof verification failed for chunk {chunk_index} of {file_id}")]
    ProofInvalid {
        /// Transfer the chunk belonged to
        file_id: String,
        /// Index of the rejected chunk
        chunk_index: u64,
    },

    /// The stream ended before every chunk arrived
    #[error("transfer incomplete: {received}/{total} chunks received")]
    Incomplete {
        /// Chunks received so far
        received: u64,
        /// Chunks expected in total
        total: u64,
    },

    /// The transfer did not finish within its deadline
    #[error("transfer timed out")]
    Timeout,

    /// A progress frame referenced a chunk index beyond the declared total
    #[error("chunk index {chunk_index} beyond declared total {total_chunks}")]
    UnknownChunkIndex {
        /// Offending index
        chunk_index: u64,
        /// Declared chunk count
        total_chunks: u64,
    },

    /// Chunk sealing or opening failed
    #[error("chunk cipher failure: {0}")]
    Cipher(&'static str),

    /// The outbound message channel closed mid-transfer
    #[error("transfer channel closed")]
    ChannelClosed,

    /// Tree construction failed while preparing the transfer
    #[error(transparent)]
    Merkle(#[from] MerkleError),
}
