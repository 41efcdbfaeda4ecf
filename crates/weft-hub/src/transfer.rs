//! Transient transfer handlers hosted by the hub.
//!
//! Downloads this node initiates are keyed by the root-hash string;
//! peer-initiated uploads are keyed by the caller-supplied upload id. Both
//! are removed on completion, failure, or timeout.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use weft_files::{
    ChunkCipher, ContentId, DownloadMetadata, DownloadedFile, FileDownloadHandler, TransferError,
};
use weft_proto::{FileDirection, FilePayload};

use crate::config::TransferConfig;

/// Outcome channel payload for an initiated download
pub type DownloadResult = std::result::Result<DownloadedFile, TransferError>;

/// A peer-initiated upload that finished verifying
#[derive(Debug)]
pub struct CompletedUpload {
    /// Caller-supplied upload id
    pub file_id: String,
    /// Content id derived from the announced root
    pub content_id: ContentId,
    /// Reassembled file
    pub file: DownloadedFile,
}

struct ActiveTransfer {
    handler: Mutex<FileDownloadHandler>,
    done: Mutex<Option<oneshot::Sender<DownloadResult>>>,
    timeout: Mutex<Option<JoinHandle<()>>>,
}

impl ActiveTransfer {
    fn new(handler: FileDownloadHandler, done: Option<oneshot::Sender<DownloadResult>>) -> Self {
        Self {
            handler: Mutex::new(handler),
            done: Mutex::new(done),
            timeout: Mutex::new(None),
        }
    }

    fn resolve(&self, outcome: DownloadResult) {
        if let Some(handle) = self.timeout.lock().expect("timeout lock poisoned").take() {
            handle.abort();
        }
        if let Some(done) = self.done.lock().expect("done lock poisoned").take() {
            let _ = done.send(outcome);
        }
    }
}

/// Registry of in-flight transfer handlers
pub struct TransferHost {
    config: TransferConfig,
    /// Initiated downloads, keyed by base64 root
    downloads: Arc<DashMap<String, Arc<ActiveTransfer>>>,
    /// file_id -> download root key, for routing progress frames
    download_ids: Arc<DashMap<String, String>>,
    /// Peer-initiated uploads, keyed by upload id
    inbound: Arc<DashMap<String, Arc<ActiveTransfer>>>,
    /// Where completed inbound uploads are delivered
    uploads_tx: Mutex<Option<mpsc::Sender<CompletedUpload>>>,
}

impl TransferHost {
    /// Create a host with the given deadlines
    #[must_use]
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            downloads: Arc::new(DashMap::new()),
            download_ids: Arc::new(DashMap::new()),
            inbound: Arc::new(DashMap::new()),
            uploads_tx: Mutex::new(None),
        }
    }

    /// Deliver completed peer uploads to `tx`
    pub fn set_upload_sink(&self, tx: mpsc::Sender<CompletedUpload>) {
        *self.uploads_tx.lock().expect("upload sink lock poisoned") = Some(tx);
    }

    /// Number of in-flight handlers (downloads plus inbound uploads)
    #[must_use]
    pub fn active(&self) -> usize {
        self.downloads.len() + self.inbound.len()
    }

    /// Register a download this node is about to request
    ///
    /// The returned receiver resolves with the reassembled file, a typed
    /// rejection, or `TransferError::Timeout` when the deadline passes.
    pub fn register_download(
        &self,
        file_id: impl Into<String>,
        expected_root: [u8; 32],
        cipher: Option<ChunkCipher>,
    ) -> oneshot::Receiver<DownloadResult> {
        let file_id = file_id.into();
        let mut handler = FileDownloadHandler::new(file_id.clone(), expected_root);
        if let Some(cipher) = cipher {
            handler = handler.with_cipher(cipher);
        }
        let key = handler.key();

        let (done_tx, done_rx) = oneshot::channel();
        let transfer = Arc::new(ActiveTransfer::new(handler, Some(done_tx)));

        self.download_ids.insert(file_id, key.clone());
        self.downloads.insert(key.clone(), Arc::clone(&transfer));
        self.arm_timeout(&transfer, TransferSlot::Download(key));
        done_rx
    }

    fn arm_timeout(&self, transfer: &Arc<ActiveTransfer>, slot: TransferSlot) {
        let deadline = self.config.download_timeout;
        let downloads = Arc::clone(&self.downloads);
        let download_ids = Arc::clone(&self.download_ids);
        let inbound = Arc::clone(&self.inbound);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let removed = match &slot {
                TransferSlot::Download(key) => downloads.remove(key).map(|(_, t)| t),
                TransferSlot::Inbound(id) => inbound.remove(id).map(|(_, t)| t),
            };
            if let Some(transfer) = removed {
                if let TransferSlot::Download(key) = &slot {
                    download_ids.retain(|_, v| v != key);
                }
                tracing::debug!(?slot, "transfer timed out");
                transfer.resolve(Err(TransferError::Timeout));
            }
        });
        *transfer.timeout.lock().expect("timeout lock poisoned") = Some(handle);
    }

    /// Route a decoded file payload to the matching handler, if any
    ///
    /// Frames with no matching handler are ignored; sessions still relay
    /// them to other clients and the fabric.
    pub fn handle_file_payload(&self, payload: &FilePayload) {
        match payload {
            FilePayload::Request {
                direction: FileDirection::Download,
                file_id,
                filename,
                size,
                mime_type,
                content_id: Some(content_id),
            } => {
                let Ok(root) = <[u8; 32]>::try_from(content_id.as_slice()) else {
                    tracing::debug!(file_id = %file_id, "download response with malformed root");
                    return;
                };
                let key = ContentId::new(root).to_base64();
                if let Some(transfer) = self.downloads.get(&key).map(|t| Arc::clone(&t)) {
                    self.feed_request(
                        &transfer,
                        DownloadMetadata {
                            filename: filename.clone(),
                            size: *size,
                            mime_type: mime_type.clone(),
                            encrypted: false,
                        },
                        TransferSlot::Download(key),
                    );
                }
            }
            FilePayload::Request {
                direction: FileDirection::Download,
                file_id,
                content_id: None,
                ..
            } => {
                tracing::debug!(file_id = %file_id, "download request without content id ignored");
            }
            FilePayload::Request {
                direction: FileDirection::Upload,
                file_id,
                filename,
                size,
                mime_type,
                content_id,
            } => {
                let Some(content_id) = content_id else {
                    // Streaming uploads announce their root with the last
                    // chunk; accepting them needs the higher-level protocol
                    tracing::debug!(file_id = %file_id, "upload request without content id ignored");
                    return;
                };
                let Ok(root) = <[u8; 32]>::try_from(content_id.as_slice()) else {
                    tracing::debug!(file_id = %file_id, "upload request with malformed root");
                    return;
                };
                let mut handler = FileDownloadHandler::new(file_id.clone(), root);
                let metadata = DownloadMetadata {
                    filename: filename.clone(),
                    size: *size,
                    mime_type: mime_type.clone(),
                    encrypted: false,
                };
                // Tiny uploads can complete on the request alone (zero-byte
                // files still need their single chunk, so this stays pending)
                match handler.on_request(metadata) {
                    Ok(None) => {
                        let transfer = Arc::new(ActiveTransfer::new(handler, None));
                        self.inbound.insert(file_id.clone(), Arc::clone(&transfer));
                        self.arm_timeout(&transfer, TransferSlot::Inbound(file_id.clone()));
                    }
                    Ok(Some(file)) => self.deliver_upload(file_id, root, file),
                    Err(err) => {
                        tracing::warn!(file_id = %file_id, error = %err, "inbound upload rejected");
                    }
                }
            }
            FilePayload::Progress { file_id, .. } => {
                if let Some(transfer) = self.inbound.get(file_id).map(|t| Arc::clone(&t)) {
                    self.feed_progress(&transfer, payload, TransferSlot::Inbound(file_id.clone()));
                    return;
                }
                let key = self.download_ids.get(file_id).map(|k| k.clone());
                if let Some(key) = key {
                    if let Some(transfer) = self.downloads.get(&key).map(|t| Arc::clone(&t)) {
                        self.feed_progress(&transfer, payload, TransferSlot::Download(key));
                    }
                }
            }
        }
    }

    fn feed_request(
        &self,
        transfer: &Arc<ActiveTransfer>,
        mut metadata: DownloadMetadata,
        slot: TransferSlot,
    ) {
        let outcome = {
            let mut handler = transfer.handler.lock().expect("handler lock poisoned");
            // Sealed transfers are negotiated when the download is
            // registered; the chunk accounting follows the cipher
            metadata.encrypted = handler.has_cipher();
            handler.on_request(metadata)
        };
        self.settle(transfer, outcome, slot);
    }

    fn feed_progress(
        &self,
        transfer: &Arc<ActiveTransfer>,
        payload: &FilePayload,
        slot: TransferSlot,
    ) {
        let outcome = {
            let mut handler = transfer.handler.lock().expect("handler lock poisoned");
            handler.on_progress(payload)
        };
        self.settle(transfer, outcome, slot);
    }

    fn settle(
        &self,
        transfer: &Arc<ActiveTransfer>,
        outcome: Result<Option<DownloadedFile>, TransferError>,
        slot: TransferSlot,
    ) {
        match outcome {
            Ok(None) => {}
            Ok(Some(file)) => {
                self.remove(&slot);
                match slot {
                    TransferSlot::Download(_) => transfer.resolve(Ok(file)),
                    TransferSlot::Inbound(file_id) => {
                        let root = transfer
                            .handler
                            .lock()
                            .expect("handler lock poisoned")
                            .key();
                        if let Some(handle) = transfer
                            .timeout
                            .lock()
                            .expect("timeout lock poisoned")
                            .take()
                        {
                            handle.abort();
                        }
                        match ContentId::from_base64(&root) {
                            Ok(content_id) => {
                                self.deliver_upload(&file_id, *content_id.as_bytes(), file);
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "inbound upload root unreadable");
                            }
                        }
                    }
                }
            }
            Err(err) => {
                // A rejected transfer removes its handler
                self.remove(&slot);
                tracing::warn!(error = %err, "transfer rejected");
                transfer.resolve(Err(err));
            }
        }
    }

    fn remove(&self, slot: &TransferSlot) {
        match slot {
            TransferSlot::Download(key) => {
                self.downloads.remove(key);
                self.download_ids.retain(|_, v| v != key);
            }
            TransferSlot::Inbound(id) => {
                self.inbound.remove(id);
            }
        }
    }

    fn deliver_upload(&self, file_id: &str, root: [u8; 32], file: DownloadedFile) {
        let tx = self
            .uploads_tx
            .lock()
            .expect("upload sink lock poisoned")
            .clone();
        let Some(tx) = tx else {
            tracing::debug!(file_id = %file_id, "completed upload dropped: no sink");
            return;
        };
        let completed = CompletedUpload {
            file_id: file_id.to_owned(),
            content_id: ContentId::new(root),
            file,
        };
        if tx.try_send(completed).is_err() {
            tracing::warn!(file_id = %file_id, "upload sink full; completed upload dropped");
        }
    }

    /// Fail every in-flight transfer (used at shutdown)
    pub fn abort_all(&self) {
        let downloads: Vec<Arc<ActiveTransfer>> = self
            .downloads
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        self.downloads.clear();
        self.download_ids.clear();
        self.inbound.clear();
        for transfer in downloads {
            let incomplete = {
                let handler = transfer.handler.lock().expect("handler lock poisoned");
                handler.incomplete()
            };
            transfer.resolve(Err(incomplete));
        }
    }
}

#[derive(Debug, Clone)]
enum TransferSlot {
    Download(String),
    Inbound(String),
}

impl std::fmt::Debug for TransferHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferHost")
            .field("downloads", &self.downloads.len())
            .field("inbound", &self.inbound.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use weft_files::{CHUNK_SIZE, MerkleTree, split_chunks};

    fn host(timeout: Duration) -> TransferHost {
        TransferHost::new(TransferConfig {
            download_timeout: timeout,
        })
    }

    fn progress(
        file_id: &str,
        tree: &MerkleTree,
        chunks: &[&[u8]],
        index: usize,
    ) -> FilePayload {
        FilePayload::Progress {
            file_id: file_id.to_owned(),
            chunk_index: index as u64,
            chunk_data: chunks[index].to_vec(),
            total_chunks: chunks.len() as u64,
            bytes_uploaded: 0,
            encrypted: false,
            proof: tree.proof(index as u32).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_initiated_download_resolves() {
        let data = vec![7u8; 100];
        let chunks = split_chunks(&data, CHUNK_SIZE);
        let tree = MerkleTree::from_chunks(&chunks).unwrap();

        let host = host(Duration::from_secs(5));
        let rx = host.register_download("dl-1", tree.root_hash(), None);
        assert_eq!(host.active(), 1);

        host.handle_file_payload(&FilePayload::Request {
            direction: FileDirection::Download,
            file_id: "dl-1".to_owned(),
            filename: "f.bin".to_owned(),
            size: data.len() as u64,
            mime_type: "application/octet-stream".to_owned(),
            content_id: Some(tree.root_hash().to_vec()),
        });
        host.handle_file_payload(&progress("dl-1", &tree, &chunks, 0));

        let file = rx.await.unwrap().unwrap();
        assert_eq!(file.data, data);
        assert_eq!(host.active(), 0);
    }

    #[tokio::test]
    async fn test_tampered_download_rejected_and_removed() {
        let data = vec![7u8; 100];
        let chunks = split_chunks(&data, CHUNK_SIZE);
        let tree = MerkleTree::from_chunks(&chunks).unwrap();

        let host = host(Duration::from_secs(5));
        let rx = host.register_download("dl-1", tree.root_hash(), None);

        host.handle_file_payload(&FilePayload::Request {
            direction: FileDirection::Download,
            file_id: "dl-1".to_owned(),
            filename: "f.bin".to_owned(),
            size: data.len() as u64,
            mime_type: "application/octet-stream".to_owned(),
            content_id: Some(tree.root_hash().to_vec()),
        });
        host.handle_file_payload(&FilePayload::Progress {
            file_id: "dl-1".to_owned(),
            chunk_index: 0,
            chunk_data: vec![0xFF; 100],
            total_chunks: 1,
            bytes_uploaded: 0,
            encrypted: false,
            proof: tree.proof(0).unwrap(),
        });

        assert!(matches!(
            rx.await.unwrap(),
            Err(TransferError::ProofInvalid { .. })
        ));
        assert_eq!(host.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_timeout() {
        let host = host(Duration::from_secs(1));
        let rx = host.register_download("dl-1", [9u8; 32], None);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(rx.await.unwrap(), Err(TransferError::Timeout)));
        assert_eq!(host.active(), 0);
    }

    #[tokio::test]
    async fn test_inbound_upload_delivered() {
        let data = vec![1u8, 2, 3, 4, 5];
        let chunks = split_chunks(&data, CHUNK_SIZE);
        let tree = MerkleTree::from_chunks(&chunks).unwrap();

        let host = host(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(4);
        host.set_upload_sink(tx);

        host.handle_file_payload(&FilePayload::Request {
            direction: FileDirection::Upload,
            file_id: "up-1".to_owned(),
            filename: "test.txt".to_owned(),
            size: 5,
            mime_type: "text/plain".to_owned(),
            content_id: Some(tree.root_hash().to_vec()),
        });
        host.handle_file_payload(&progress("up-1", &tree, &chunks, 0));

        let completed = rx.recv().await.unwrap();
        assert_eq!(completed.file_id, "up-1");
        assert_eq!(completed.file.data, data);
        assert_eq!(completed.content_id, tree.content_id());
        assert_eq!(host.active(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_progress_ignored() {
        let host = host(Duration::from_secs(5));
        host.handle_file_payload(&FilePayload::Progress {
            file_id: "nobody".to_owned(),
            chunk_index: 0,
            chunk_data: vec![1],
            total_chunks: 1,
            bytes_uploaded: 0,
            encrypted: false,
            proof: Vec::new(),
        });
        assert_eq!(host.active(), 0);
    }
}
