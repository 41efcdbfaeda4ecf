//! Receiver-side transfer state machine.
//!
//! A handler is keyed by the declared Merkle root and fed the decoded
//! request/progress frames for its file id. Every chunk is verified against
//! the root before it is stored; chunks may arrive in any order and
//! duplicate indices are ignored. The transfer resolves once the metadata
//! is present and every chunk has arrived.

use weft_proto::FilePayload;

use crate::chunker::chunk_count;
use crate::cipher::{ChunkCipher, ENCRYPTED_CHUNK_SIZE};
use crate::error::TransferError;
use crate::merkle::{CHUNK_SIZE, ContentId, verify_proof};

/// Transfer metadata from the download-direction `file-request`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadMetadata {
    /// File name
    pub filename: String,
    /// Plaintext size in bytes
    pub size: u64,
    /// MIME type
    pub mime_type: String,
    /// Whether chunks are sealed with the chunk cipher
    pub encrypted: bool,
}

/// A completed download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    /// Metadata from the request
    pub metadata: DownloadMetadata,
    /// Reassembled plaintext
    pub data: Vec<u8>,
}

/// Per-file download state machine
#[derive(Debug)]
pub struct FileDownloadHandler {
    file_id: String,
    expected_root: [u8; 32],
    cipher: Option<ChunkCipher>,
    metadata: Option<DownloadMetadata>,
    chunks: Vec<Option<Vec<u8>>>,
    total_chunks: Option<u64>,
    received: u64,
}

impl FileDownloadHandler {
    /// Create a handler expecting chunks that prove against `expected_root`
    #[must_use]
    pub fn new(file_id: impl Into<String>, expected_root: [u8; 32]) -> Self {
        Self {
            file_id: file_id.into(),
            expected_root,
            cipher: None,
            metadata: None,
            chunks: Vec::new(),
            total_chunks: None,
            received: 0,
        }
    }

    /// Attach the cipher used to open sealed chunks at reassembly
    #[must_use]
    pub fn with_cipher(mut self, cipher: ChunkCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// The file id this handler is correlated with
    #[must_use]
    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// Whether a chunk cipher is attached
    #[must_use]
    pub fn has_cipher(&self) -> bool {
        self.cipher.is_some()
    }

    /// Registry key: the base64 rendering of the expected root
    #[must_use]
    pub fn key(&self) -> String {
        ContentId::new(self.expected_root).to_base64()
    }

    /// Chunks received so far
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Declared chunk total, once known
    #[must_use]
    pub fn total_chunks(&self) -> Option<u64> {
        self.total_chunks
    }

    /// Whether every chunk and the metadata have arrived
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.metadata.is_some() && Some(self.received) == self.total_chunks
    }

    /// Record the request-side metadata; may finalize a transfer whose
    /// chunks all arrived first
    pub fn on_request(
        &mut self,
        metadata: DownloadMetadata,
    ) -> Result<Option<DownloadedFile>, TransferError> {
        let chunk_size = if metadata.encrypted {
            ENCRYPTED_CHUNK_SIZE
        } else {
            CHUNK_SIZE
        };
        let total = chunk_count(metadata.size, chunk_size);
        self.total_chunks = Some(total);
        self.metadata = Some(metadata);
        self.ensure_capacity(total);
        self.try_finalize()
    }

    /// Verify and store one progress frame
    ///
    /// # Errors
    ///
    /// Returns `ProofInvalid` when the chunk does not prove against the
    /// expected root, and `UnknownChunkIndex` when the index is at or past
    /// the declared total.
    pub fn on_progress(
        &mut self,
        payload: &FilePayload,
    ) -> Result<Option<DownloadedFile>, TransferError> {
        let FilePayload::Progress {
            chunk_index,
            chunk_data,
            total_chunks,
            proof,
            ..
        } = payload
        else {
            return Ok(None);
        };

        let total = self.total_chunks.unwrap_or(*total_chunks);
        if *chunk_index >= total {
            return Err(TransferError::UnknownChunkIndex {
                chunk_index: *chunk_index,
                total_chunks: total,
            });
        }

        if !verify_proof(chunk_data, proof, &self.expected_root, *chunk_index) {
            return Err(TransferError::ProofInvalid {
                file_id: self.file_id.clone(),
                chunk_index: *chunk_index,
            });
        }

        if self.total_chunks.is_none() {
            self.total_chunks = Some(total);
        }
        self.ensure_capacity(total);

        let slot = &mut self.chunks[*chunk_index as usize];
        if slot.is_none() {
            *slot = Some(chunk_data.clone());
            self.received += 1;
        }

        self.try_finalize()
    }

    /// The rejection to raise when the stream ends before completion
    #[must_use]
    pub fn incomplete(&self) -> TransferError {
        TransferError::Incomplete {
            received: self.received,
            total: self.total_chunks.unwrap_or(0),
        }
    }

    fn ensure_capacity(&mut self, total: u64) {
        let total = total as usize;
        if self.chunks.len() < total {
            self.chunks.resize_with(total, || None);
        }
    }

    fn try_finalize(&mut self) -> Result<Option<DownloadedFile>, TransferError> {
        let Some(metadata) = self.metadata.clone() else {
            return Ok(None);
        };
        if Some(self.received) != self.total_chunks {
            return Ok(None);
        }

        let missing = TransferError::Incomplete {
            received: self.received,
            total: self.total_chunks.unwrap_or(0),
        };
        let cipher = self.cipher.as_ref();
        let mut data = Vec::with_capacity(metadata.size as usize);
        for slot in &mut self.chunks {
            let wire = slot.take().ok_or_else(|| missing.clone())?;
            if metadata.encrypted {
                let cipher =
                    cipher.ok_or(TransferError::Cipher("no cipher for sealed download"))?;
                data.extend_from_slice(&cipher.open(&wire)?);
            } else {
                data.extend_from_slice(&wire);
            }
        }

        tracing::debug!(
            file_id = %self.file_id,
            bytes = data.len(),
            "download complete"
        );
        Ok(Some(DownloadedFile { metadata, data }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::split_chunks;
    use crate::merkle::MerkleTree;

    fn metadata(size: u64) -> DownloadMetadata {
        DownloadMetadata {
            filename: "test.txt".to_owned(),
            size,
            mime_type: "text/plain".to_owned(),
            encrypted: false,
        }
    }

    fn progress_for(
        tree: &MerkleTree,
        chunks: &[&[u8]],
        index: usize,
    ) -> FilePayload {
        FilePayload::Progress {
            file_id: "f".to_owned(),
            chunk_index: index as u64,
            chunk_data: chunks[index].to_vec(),
            total_chunks: chunks.len() as u64,
            bytes_uploaded: 0,
            encrypted: false,
            proof: tree.proof(index as u32).unwrap(),
        }
    }

    #[test]
    fn test_single_chunk_download() {
        let data = [1u8, 2, 3, 4, 5];
        let chunks = split_chunks(&data, CHUNK_SIZE);
        let tree = MerkleTree::from_chunks(&chunks).unwrap();

        let mut handler = FileDownloadHandler::new("f", tree.root_hash());
        assert!(handler.on_request(metadata(5)).unwrap().is_none());

        let done = handler
            .on_progress(&progress_for(&tree, &chunks, 0))
            .unwrap()
            .expect("download should complete");
        assert_eq!(done.data, data);
        assert!(handler.is_complete());
    }

    #[test]
    fn test_out_of_order_chunks() {
        let data: Vec<u8> = (0..CHUNK_SIZE * 2 + 100).map(|i| i as u8).collect();
        let chunks = split_chunks(&data, CHUNK_SIZE);
        let tree = MerkleTree::from_chunks(&chunks).unwrap();

        let mut handler = FileDownloadHandler::new("f", tree.root_hash());
        handler.on_request(metadata(data.len() as u64)).unwrap();

        assert!(handler.on_progress(&progress_for(&tree, &chunks, 2)).unwrap().is_none());
        assert!(handler.on_progress(&progress_for(&tree, &chunks, 0)).unwrap().is_none());
        let done = handler
            .on_progress(&progress_for(&tree, &chunks, 1))
            .unwrap()
            .expect("complete after last chunk");
        assert_eq!(done.data, data);
    }

    #[test]
    fn test_duplicate_chunk_ignored() {
        let data: Vec<u8> = (0..CHUNK_SIZE + 50).map(|i| i as u8).collect();
        let chunks = split_chunks(&data, CHUNK_SIZE);
        let tree = MerkleTree::from_chunks(&chunks).unwrap();

        let mut handler = FileDownloadHandler::new("f", tree.root_hash());
        handler.on_request(metadata(data.len() as u64)).unwrap();

        handler.on_progress(&progress_for(&tree, &chunks, 0)).unwrap();
        assert_eq!(handler.received(), 1);
        handler.on_progress(&progress_for(&tree, &chunks, 0)).unwrap();
        assert_eq!(handler.received(), 1);
    }

    #[test]
    fn test_tampered_chunk_rejected() {
        let data: Vec<u8> = (0..CHUNK_SIZE + 50).map(|i| i as u8).collect();
        let chunks = split_chunks(&data, CHUNK_SIZE);
        let tree = MerkleTree::from_chunks(&chunks).unwrap();

        let mut handler = FileDownloadHandler::new("f", tree.root_hash());
        handler.on_request(metadata(data.len() as u64)).unwrap();

        // Legitimate proof, replaced chunk bytes
        let tampered = FilePayload::Progress {
            file_id: "f".to_owned(),
            chunk_index: 0,
            chunk_data: vec![0xEE; CHUNK_SIZE],
            total_chunks: 2,
            bytes_uploaded: 0,
            encrypted: false,
            proof: tree.proof(0).unwrap(),
        };
        assert!(matches!(
            handler.on_progress(&tampered),
            Err(TransferError::ProofInvalid { chunk_index: 0, .. })
        ));
        assert_eq!(handler.received(), 0);
    }

    #[test]
    fn test_chunk_index_beyond_total() {
        let data = [1u8; 10];
        let chunks = split_chunks(&data, CHUNK_SIZE);
        let tree = MerkleTree::from_chunks(&chunks).unwrap();

        let mut handler = FileDownloadHandler::new("f", tree.root_hash());
        handler.on_request(metadata(10)).unwrap();

        let stray = FilePayload::Progress {
            file_id: "f".to_owned(),
            chunk_index: 5,
            chunk_data: vec![1; 10],
            total_chunks: 1,
            bytes_uploaded: 0,
            encrypted: false,
            proof: Vec::new(),
        };
        assert!(matches!(
            handler.on_progress(&stray),
            Err(TransferError::UnknownChunkIndex { chunk_index: 5, total_chunks: 1 })
        ));
    }

    #[test]
    fn test_chunks_before_metadata() {
        let data = [9u8; 100];
        let chunks = split_chunks(&data, CHUNK_SIZE);
        let tree = MerkleTree::from_chunks(&chunks).unwrap();

        let mut handler = FileDownloadHandler::new("f", tree.root_hash());
        // Chunk arrives first; no metadata yet, so no completion
        assert!(handler.on_progress(&progress_for(&tree, &chunks, 0)).unwrap().is_none());
        // Metadata arrives and the transfer finalizes
        let done = handler
            .on_request(metadata(100))
            .unwrap()
            .expect("complete once metadata lands");
        assert_eq!(done.data, data);
    }

    #[test]
    fn test_incomplete_stream() {
        let data: Vec<u8> = (0..CHUNK_SIZE * 2).map(|i| i as u8).collect();
        let chunks = split_chunks(&data, CHUNK_SIZE);
        let tree = MerkleTree::from_chunks(&chunks).unwrap();

        let mut handler = FileDownloadHandler::new("f", tree.root_hash());
        handler.on_request(metadata(data.len() as u64)).unwrap();
        handler.on_progress(&progress_for(&tree, &chunks, 0)).unwrap();

        assert_eq!(
            handler.incomplete(),
            TransferError::Incomplete { received: 1, total: 2 }
        );
    }

    #[test]
    fn test_zero_byte_download() {
        let chunks = split_chunks(&[], CHUNK_SIZE);
        let tree = MerkleTree::from_chunks(&chunks).unwrap();

        let mut handler = FileDownloadHandler::new("f", tree.root_hash());
        handler.on_request(metadata(0)).unwrap();
        let done = handler
            .on_progress(&progress_for(&tree, &chunks, 0))
            .unwrap()
            .expect("zero-byte file completes with its single empty chunk");
        assert!(done.data.is_empty());
    }

    #[test]
    fn test_encrypted_download_roundtrip() {
        let cipher = ChunkCipher::new(&[3u8; 32]);
        let data = vec![0x5Au8; 5000];
        let sealed = cipher.seal(&data).unwrap();
        let wire_chunks = vec![sealed.clone()];
        let tree = MerkleTree::from_chunks(&wire_chunks).unwrap();

        let mut handler = FileDownloadHandler::new("f", tree.root_hash())
            .with_cipher(ChunkCipher::new(&[3u8; 32]));
        handler
            .on_request(DownloadMetadata {
                filename: "x".to_owned(),
                size: data.len() as u64,
                mime_type: "application/octet-stream".to_owned(),
                encrypted: true,
            })
            .unwrap();

        let progress = FilePayload::Progress {
            file_id: "f".to_owned(),
            chunk_index: 0,
            chunk_data: sealed,
            total_chunks: 1,
            bytes_uploaded: 0,
            encrypted: true,
            proof: tree.proof(0).unwrap(),
        };
        let done = handler.on_progress(&progress).unwrap().expect("complete");
        assert_eq!(done.data, data);
    }
}
