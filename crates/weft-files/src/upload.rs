//! Sender-side transfer state machines.
//!
//! The batch uploader buffers the whole file, builds the Merkle tree up
//! front, and announces the content id in the initial request. The streaming
//! uploader feeds an incremental tree and emits each chunk as soon as its
//! proof path is stable; the root travels with the final chunk's emission
//! and earlier emissions carry no root.

use std::collections::VecDeque;

use tokio::sync::mpsc;

use weft_proto::{FileDirection, FilePayload, Message};

use crate::chunker::{chunk_count, split_chunks};
use crate::cipher::{ChunkCipher, ENCRYPTED_CHUNK_SIZE};
use crate::error::TransferError;
use crate::merkle::{CHUNK_SIZE, ContentId, IncrementalMerkle, MerkleTree};

/// Static description of an upload
#[derive(Debug, Clone)]
pub struct UploadParams {
    /// Document the transfer frames are addressed to
    pub document: String,
    /// Encryption flag carried by every emitted frame (session consistency)
    pub message_encrypted: bool,
    /// Caller-supplied correlation id
    pub file_id: String,
    /// File name announced in the request
    pub filename: String,
    /// MIME type announced in the request
    pub mime_type: String,
}

impl UploadParams {
    fn request(&self, size: u64, content_id: Option<Vec<u8>>) -> Message {
        Message::file(
            self.document.clone(),
            self.message_encrypted,
            FilePayload::Request {
                direction: FileDirection::Upload,
                file_id: self.file_id.clone(),
                filename: self.filename.clone(),
                size,
                mime_type: self.mime_type.clone(),
                content_id,
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn progress(
        &self,
        chunk_index: u64,
        chunk_data: Vec<u8>,
        total_chunks: u64,
        bytes_uploaded: u64,
        sealed: bool,
        proof: Vec<[u8; 32]>,
    ) -> Message {
        Message::file(
            self.document.clone(),
            self.message_encrypted,
            FilePayload::Progress {
                file_id: self.file_id.clone(),
                chunk_index,
                chunk_data,
                total_chunks,
                bytes_uploaded,
                encrypted: sealed,
                proof,
            },
        )
    }
}

fn effective_chunk_size(cipher: Option<&ChunkCipher>) -> usize {
    if cipher.is_some() {
        ENCRYPTED_CHUNK_SIZE
    } else {
        CHUNK_SIZE
    }
}

/// Upload a fully buffered file
///
/// Sends one `file-request` announcing the content id, then one
/// `file-progress` per chunk with its inclusion proof. Returns the content
/// id (base64 of the Merkle root over the transmitted chunks).
pub async fn upload_file(
    params: &UploadParams,
    data: &[u8],
    cipher: Option<&ChunkCipher>,
    sink: &mpsc::Sender<Message>,
) -> Result<ContentId, TransferError> {
    let plain_chunks = split_chunks(data, effective_chunk_size(cipher));

    let mut wire_chunks: Vec<Vec<u8>> = Vec::with_capacity(plain_chunks.len());
    for chunk in &plain_chunks {
        let wire = match cipher {
            Some(c) => c.seal(chunk)?,
            None => chunk.to_vec(),
        };
        wire_chunks.push(wire);
    }

    let tree = MerkleTree::from_chunks(&wire_chunks)?;
    let content_id = tree.content_id();
    let total_chunks = wire_chunks.len() as u64;

    sink.send(params.request(data.len() as u64, Some(content_id.as_bytes().to_vec())))
        .await
        .map_err(|_| TransferError::ChannelClosed)?;

    let mut bytes_uploaded = 0u64;
    for (index, (wire, plain)) in wire_chunks.into_iter().zip(plain_chunks.iter()).enumerate() {
        bytes_uploaded += plain.len() as u64;
        let proof = tree.proof(index as u32)?;
        let message = params.progress(
            index as u64,
            wire,
            total_chunks,
            bytes_uploaded,
            cipher.is_some(),
            proof,
        );
        sink.send(message)
            .await
            .map_err(|_| TransferError::ChannelClosed)?;
    }

    tracing::debug!(
        file_id = %params.file_id,
        chunks = total_chunks,
        content_id = %content_id,
        "upload complete"
    );
    Ok(content_id)
}

/// One streamed chunk handed to the transport
///
/// `root` is populated only on the final chunk's emission; earlier chunks
/// carry no root because it is not yet known.
#[derive(Debug)]
pub struct Emission {
    /// The frame to deliver
    pub message: Message,
    /// Content id, present on the last chunk only
    pub root: Option<ContentId>,
}

/// Streaming uploader for sources that are not fully buffered.
///
/// The total size must be declared up front so the incremental tree can be
/// allocated; bytes are then fed with [`push`](Self::push) in arbitrary
/// slice sizes and chunks are emitted as soon as their proofs are stable.
pub struct StreamingUploader {
    params: UploadParams,
    cipher: Option<ChunkCipher>,
    sink: mpsc::Sender<Emission>,
    merkle: IncrementalMerkle,
    /// Chunks hashed into the tree but not yet emitted: (leaf, wire bytes, plain len)
    pending: VecDeque<(u32, Vec<u8>, usize)>,
    buffer: Vec<u8>,
    chunk_size: usize,
    total_size: u64,
    total_chunks: u64,
    bytes_uploaded: u64,
}

impl StreamingUploader {
    /// Start a streaming upload of `total_size` bytes
    ///
    /// Sends the initial `file-request` immediately, without a content id.
    pub async fn new(
        params: UploadParams,
        total_size: u64,
        cipher: Option<ChunkCipher>,
        sink: mpsc::Sender<Emission>,
    ) -> Result<Self, TransferError> {
        let chunk_size = effective_chunk_size(cipher.as_ref());
        let total_chunks = chunk_count(total_size, chunk_size);
        let leaf_count =
            u32::try_from(total_chunks).map_err(|_| TransferError::Cipher("file too large"))?;
        let merkle = IncrementalMerkle::new(leaf_count)?;

        sink.send(Emission {
            message: params.request(total_size, None),
            root: None,
        })
        .await
        .map_err(|_| TransferError::ChannelClosed)?;

        Ok(Self {
            params,
            cipher,
            sink,
            merkle,
            pending: VecDeque::new(),
            buffer: Vec::new(),
            chunk_size,
            total_size,
            total_chunks,
            bytes_uploaded: 0,
        })
    }

    /// Total number of chunks this upload will emit
    #[must_use]
    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    /// Feed source bytes; complete chunks are hashed and emitted when stable
    pub async fn push(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= self.chunk_size {
            let plain: Vec<u8> = self.buffer.drain(..self.chunk_size).collect();
            self.process_chunk(&plain).await?;
        }
        Ok(())
    }

    /// Flush the trailing chunk and return the content id
    ///
    /// # Errors
    ///
    /// Returns `TransferError::Incomplete` when fewer bytes were pushed than
    /// the declared total size.
    pub async fn finish(mut self) -> Result<ContentId, TransferError> {
        if !self.buffer.is_empty() || (self.total_size == 0 && self.merkle.filled() == 0) {
            let plain = std::mem::take(&mut self.buffer);
            self.process_chunk(&plain).await?;
        }

        if !self.merkle.is_complete() {
            return Err(TransferError::Incomplete {
                received: u64::from(self.merkle.filled()),
                total: self.total_chunks,
            });
        }

        // Every proof is stable once the last leaf is in
        self.flush_stable().await?;

        let root = self.merkle.root().ok_or(TransferError::Incomplete {
            received: u64::from(self.merkle.filled()),
            total: self.total_chunks,
        })?;
        Ok(ContentId::new(root))
    }

    async fn process_chunk(&mut self, plain: &[u8]) -> Result<(), TransferError> {
        let wire = match &self.cipher {
            Some(c) => c.seal(plain)?,
            None => plain.to_vec(),
        };
        let index = self.merkle.add_chunk(&wire)?;
        self.pending.push_back((index, wire, plain.len()));
        self.flush_stable().await
    }

    async fn flush_stable(&mut self) -> Result<(), TransferError> {
        while let Some((index, _, _)) = self.pending.front() {
            if !self.merkle.can_generate_proof(*index) {
                break;
            }
            let (index, wire, plain_len) = self.pending.pop_front().expect("front checked");
            let proof = self.merkle.proof(index)?;
            self.bytes_uploaded += plain_len as u64;

            let is_last = u64::from(index) == self.total_chunks - 1;
            let root = if is_last {
                self.merkle.root().map(ContentId::new)
            } else {
                None
            };

            let message = self.params.progress(
                u64::from(index),
                wire,
                self.total_chunks,
                self.bytes_uploaded,
                self.cipher.is_some(),
                proof,
            );
            self.sink
                .send(Emission { message, root })
                .await
                .map_err(|_| TransferError::ChannelClosed)?;
        }
        Ok(())
    }
}
