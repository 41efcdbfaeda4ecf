//! # Weft File Transfer Engine
//!
//! Content-addressed chunked file transfer with cryptographic verification.
//!
//! Files are split into fixed 64 KiB chunks (65 508 bytes of plaintext when
//! the optional chunk cipher is in use), hashed into a SHA-256 Merkle tree,
//! and shipped as `file-progress` frames carrying per-chunk inclusion
//! proofs. The receiver verifies every chunk against the declared root
//! before storing it, so a transfer cannot be poisoned by a tampered chunk.
//!
//! - [`merkle`]: tree construction, proofs, serialization, and the
//!   incremental builder used by streaming uploads
//! - [`chunker`]: fixed-size chunk splitting
//! - [`cipher`]: optional per-chunk AEAD transform
//! - [`upload`]: batch and streaming sender state machines
//! - [`download`]: proof-verifying receiver state machine

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunker;
pub mod cipher;
pub mod download;
pub mod error;
pub mod merkle;
pub mod upload;

pub use chunker::{chunk_count, split_chunks, split_default};
pub use cipher::{ChunkCipher, ENCRYPTED_CHUNK_SIZE, SEAL_OVERHEAD};
pub use download::{DownloadMetadata, DownloadedFile, FileDownloadHandler};
pub use error::{MerkleError, TransferError};
pub use merkle::{
    CHUNK_SIZE, ContentId, HASH_SIZE, IncrementalMerkle, MerkleNode, MerkleTree,
    ROOT_PARENT_SENTINEL, hash_chunk, verify_proof,
};
pub use upload::{Emission, StreamingUploader, UploadParams, upload_file};
