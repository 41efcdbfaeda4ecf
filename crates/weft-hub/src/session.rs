//! Per-document session: applies messages, drives the sync handshake, fans
//! out to local clients, writes to the store, and replicates through the
//! pub/sub fabric.
//!
//! All session state mutates on one cooperative task at a time: inbound
//! client messages and replication envelopes are each handled to completion
//! before the next begins, and the fields that cross await points sit
//! behind async locks. Sessions for different documents run in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;

use weft_proto::{
    DocPayload, Message, Payload, RpcPayload, RpcRequestType, RpcResult, codec,
};

use crate::client::{Client, ClientId};
use crate::config::SessionConfig;
use crate::dedup::TtlDedup;
use crate::error::{HubError, Result};
use crate::events::{EventBus, MessageSource, SessionEvent};
use crate::pubsub::{PubSub, PubSubEnvelope, document_topic};
use crate::rpc::{
    RpcContext, RpcError, RpcEvent, RpcMethod, RpcRegistry, RpcRequest, RpcWaiters, StreamSend,
};
use crate::store::DocumentStore;

/// Replication provenance attached to messages arriving from pub/sub
#[derive(Debug, Clone)]
pub struct ReplicationMeta {
    /// Node that published the message
    pub source_node_id: String,
    /// Whether the dedup suppressed it
    pub deduped: bool,
}

/// Construction parameters
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Client-facing document name
    pub document: String,
    /// Storage-facing namespaced id (`room/document` when a room is set)
    pub document_id: String,
    /// Encryption flag every applied message must match
    pub encrypted: bool,
    /// This node's id, used for replication loop suppression
    pub node_id: String,
    /// Tuning
    pub config: SessionConfig,
}

/// Snapshot of one session for the stats surface
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionStats {
    /// Client-facing document name
    pub document: String,
    /// Namespaced document id
    pub document_id: String,
    /// Connected client count
    pub clients: usize,
    /// Whether `load` has run
    pub loaded: bool,
    /// Session encryption flag
    pub encrypted: bool,
    /// Live dedup entries
    pub dedup_entries: usize,
}

/// Outcome of an outbound RPC call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCallOutcome {
    /// Stream items received before the response
    pub items: Vec<Vec<u8>>,
    /// Final response payload
    pub payload: Vec<u8>,
}

/// A per-document session
pub struct Session {
    document: String,
    document_id: String,
    encrypted: bool,
    node_id: String,
    config: SessionConfig,

    store: Arc<dyn DocumentStore>,
    pubsub: Arc<dyn PubSub>,
    rpc: Arc<RpcRegistry>,
    waiters: Arc<RpcWaiters>,
    events: EventBus,

    clients: RwLock<HashMap<ClientId, Arc<Client>>>,
    /// Latest awareness frame per client, replayed to late joiners
    awareness: RwLock<HashMap<ClientId, Message>>,
    dedup: Mutex<TtlDedup>,
    ack_waiters: DashMap<String, oneshot::Sender<()>>,
    /// One message is applied to completion before the next begins
    apply_lock: Mutex<()>,

    loaded: AtomicBool,
    disposed: AtomicBool,
    size_warned: AtomicBool,
    size_limited: AtomicBool,

    cleanup: std::sync::Mutex<Option<JoinHandle<()>>>,
    replication: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Registry disposal queue; the session announces itself here when its
    /// quiet period elapses with no clients
    dispose_tx: mpsc::Sender<String>,
}

impl Session {
    /// Create a session; call [`load`](Self::load) before use
    #[must_use]
    pub fn new(
        params: SessionParams,
        store: Arc<dyn DocumentStore>,
        pubsub: Arc<dyn PubSub>,
        rpc: Arc<RpcRegistry>,
        waiters: Arc<RpcWaiters>,
        dispose_tx: mpsc::Sender<String>,
    ) -> Arc<Self> {
        let events = EventBus::new(params.config.event_capacity);
        let dedup = TtlDedup::new(params.config.dedup.clone());
        Arc::new(Self {
            document: params.document,
            document_id: params.document_id,
            encrypted: params.encrypted,
            node_id: params.node_id,
            config: params.config,
            store,
            pubsub,
            rpc,
            waiters,
            events,
            clients: RwLock::new(HashMap::new()),
            awareness: RwLock::new(HashMap::new()),
            dedup: Mutex::new(dedup),
            ack_waiters: DashMap::new(),
            apply_lock: Mutex::new(()),
            loaded: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            size_warned: AtomicBool::new(false),
            size_limited: AtomicBool::new(false),
            cleanup: std::sync::Mutex::new(None),
            replication: std::sync::Mutex::new(None),
            dispose_tx,
        })
    }

    /// Client-facing document name
    #[must_use]
    pub fn document(&self) -> &str {
        &self.document
    }

    /// Namespaced document id
    #[must_use]
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Session encryption flag
    #[must_use]
    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    /// Whether `load` has completed
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Whether the session has been disposed
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Subscribe to lifecycle events
    #[must_use]
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Subscribe to the replication topic and start the replication task.
    /// Idempotent.
    pub async fn load(self: &Arc<Self>) -> Result<()> {
        if self.loaded.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let topic = document_topic(&self.document_id);
        let mut subscription = match self.pubsub.subscribe(&topic).await {
            Ok(sub) => sub,
            Err(err) => {
                self.loaded.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(envelope) = subscription.recv().await {
                let Some(session) = weak.upgrade() else { break };
                session.handle_replicated(envelope).await;
            }
        });
        *self
            .replication
            .lock()
            .expect("replication lock poisoned") = Some(handle);

        tracing::debug!(document_id = %self.document_id, "session loaded");
        Ok(())
    }

    /// Join a client to the local fan-out set
    ///
    /// Cancels any scheduled disposal. Fires `client-join` only when the
    /// client was not already joined, and replays the current awareness
    /// snapshot to the newcomer.
    pub async fn add_client(self: &Arc<Self>, client: Arc<Client>) {
        self.cancel_cleanup();

        let newly_joined = {
            let mut clients = self.clients.write().await;
            clients
                .insert(client.id().to_owned(), Arc::clone(&client))
                .is_none()
        };
        if !newly_joined {
            return;
        }

        client.link_session(self);
        self.events.emit(SessionEvent::ClientJoin {
            client_id: client.id().to_owned(),
        });

        // Late joiners converge presence immediately
        let snapshot: Vec<Message> = {
            let awareness = self.awareness.read().await;
            awareness
                .iter()
                .filter(|(id, _)| id.as_str() != client.id())
                .map(|(_, msg)| msg.clone())
                .collect()
        };
        for message in snapshot {
            if let Err(err) = client.send(&message).await {
                tracing::debug!(
                    client_id = %client.id(),
                    error = %err,
                    "awareness replay failed"
                );
                break;
            }
        }
    }

    /// Remove a client from the fan-out set
    ///
    /// Fires `client-leave`, asynchronously destroys the client, and
    /// schedules disposal when the fan-out becomes empty.
    pub async fn remove_client(self: &Arc<Self>, client_id: &str) {
        let removed = {
            let mut clients = self.clients.write().await;
            clients.remove(client_id)
        };
        self.awareness.write().await.remove(client_id);

        if let Some(client) = removed {
            self.events.emit(SessionEvent::ClientLeave {
                client_id: client_id.to_owned(),
            });
            tokio::spawn(async move { client.destroy().await });
        }

        if self.should_dispose().await {
            self.schedule_cleanup();
        }
    }

    /// Number of joined clients
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Whether the session is empty and eligible for delayed disposal
    pub async fn should_dispose(&self) -> bool {
        !self.is_disposed() && self.clients.read().await.is_empty()
    }

    /// Whether a disposal timer is currently armed
    #[must_use]
    pub fn cleanup_scheduled(&self) -> bool {
        self.cleanup
            .lock()
            .expect("cleanup lock poisoned")
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn cancel_cleanup(&self) {
        if let Some(handle) = self
            .cleanup
            .lock()
            .expect("cleanup lock poisoned")
            .take()
        {
            handle.abort();
        }
    }

    fn schedule_cleanup(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        let weak = Arc::downgrade(self);
        let delay = self.config.cleanup_delay;
        let document_id = self.document_id.clone();
        let dispose_tx = self.dispose_tx.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = weak.upgrade() else { return };
            if session.should_dispose().await {
                let _ = dispose_tx.send(document_id).await;
            }
        });

        let mut guard = self.cleanup.lock().expect("cleanup lock poisoned");
        if let Some(previous) = guard.replace(handle) {
            previous.abort();
        }
    }

    /// Send `message` to every joined client except `exclude`
    ///
    /// Send failures are logged; they do not abort the broadcast.
    pub async fn broadcast(&self, message: &Message, exclude: Option<&str>) {
        let targets: Vec<Arc<Client>> = {
            let clients = self.clients.read().await;
            clients
                .values()
                .filter(|c| Some(c.id()) != exclude)
                .cloned()
                .collect()
        };

        let sends = targets.iter().map(|client| {
            let client = Arc::clone(client);
            async move {
                if let Err(err) = client.send(message).await {
                    tracing::warn!(
                        client_id = %client.id(),
                        error = %err,
                        "broadcast send failed"
                    );
                }
            }
        });
        futures::future::join_all(sends).await;
    }

    /// Write an update to the store and surface size threshold events
    ///
    /// `document-size-warning` and `document-size-limit-exceeded` each fire
    /// at most once until the size drops back below the threshold.
    pub async fn write(&self, update: &[u8]) -> Result<()> {
        self.store.handle_update(&self.document_id, update).await?;
        self.events.emit(SessionEvent::DocumentWrite {
            document_id: self.document_id.clone(),
        });

        match self.store.get_document_metadata(&self.document_id).await {
            Ok(metadata) => {
                let size = metadata.size_bytes.unwrap_or(0);
                if let Some(threshold) = metadata.size_warning_threshold {
                    if size >= threshold {
                        if !self.size_warned.swap(true, Ordering::SeqCst) {
                            self.events.emit(SessionEvent::DocumentSizeWarning {
                                size_bytes: size,
                                threshold,
                            });
                        }
                    } else {
                        self.size_warned.store(false, Ordering::SeqCst);
                    }
                }
                if let Some(limit) = metadata.size_limit {
                    if size >= limit {
                        if !self.size_limited.swap(true, Ordering::SeqCst) {
                            self.events.emit(SessionEvent::DocumentSizeLimitExceeded {
                                size_bytes: size,
                                limit,
                            });
                        }
                    } else {
                        self.size_limited.store(false, Ordering::SeqCst);
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    document_id = %self.document_id,
                    error = %err,
                    "metadata read after write failed"
                );
            }
        }
        Ok(())
    }

    /// Register interest in an ack for `message_id`
    #[must_use]
    pub fn wait_for_ack(&self, message_id: impl Into<String>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.ack_waiters.insert(message_id.into(), tx);
        rx
    }

    /// Apply a message to the session
    ///
    /// `client` is present for messages received from a local connection;
    /// `replication` is present for messages arriving from the fabric.
    pub async fn apply(
        self: &Arc<Self>,
        message: &Message,
        client: Option<&Arc<Client>>,
        replication: Option<&ReplicationMeta>,
    ) -> Result<()> {
        let _applying = self.apply_lock.lock().await;

        if self.is_disposed() {
            return Err(HubError::SessionDisposed(self.document_id.clone()));
        }
        if message.encrypted() != self.encrypted {
            return Err(HubError::EncryptionMismatch {
                document: self.document_id.clone(),
            });
        }

        match message.payload() {
            Payload::Doc(doc) => self.apply_doc(message, doc, client, replication).await,
            Payload::Rpc(rpc) => {
                match client {
                    Some(client) => self.handle_rpc(message, rpc, client).await,
                    // RPC needs a reply channel; replicated RPC is dropped
                    None => {
                        tracing::debug!(
                            document_id = %self.document_id,
                            method = %rpc.method,
                            "rpc without client context dropped"
                        );
                        Ok(())
                    }
                }
            }
            Payload::Ack { message_id } => {
                if let Some((_, waiter)) = self.ack_waiters.remove(message_id) {
                    let _ = waiter.send(());
                } else {
                    tracing::debug!(message_id = %message_id, "ack with no waiter");
                }
                Ok(())
            }
            Payload::Awareness(_) | Payload::File(_) => {
                if matches!(message.payload(), Payload::Awareness(_)) {
                    // Replicated frames carry no client id on the wire; the
                    // latest update per source node is retained instead
                    let snapshot_key = client
                        .map(|c| c.id().to_owned())
                        .or_else(|| {
                            replication.map(|meta| format!("node:{}", meta.source_node_id))
                        });
                    if let Some(key) = snapshot_key {
                        self.awareness
                            .write()
                            .await
                            .insert(key, message.clone());
                    }
                }
                let exclude = client.map(|c| c.id());
                if replication.is_none() {
                    tokio::join!(self.broadcast(message, exclude), self.publish(message));
                } else {
                    self.broadcast(message, exclude).await;
                }
                Ok(())
            }
        }
    }

    async fn apply_doc(
        self: &Arc<Self>,
        message: &Message,
        doc: &DocPayload,
        client: Option<&Arc<Client>>,
        replication: Option<&ReplicationMeta>,
    ) -> Result<()> {
        match doc {
            DocPayload::SyncStep1 { state_vector } => {
                let Some(client) = client else {
                    // Pure replication has nobody to answer
                    tracing::debug!(
                        document_id = %self.document_id,
                        "sync-step-1 without client context dropped"
                    );
                    return Ok(());
                };
                let reply = self
                    .store
                    .handle_sync_step_1(&self.document_id, state_vector)
                    .await?;
                client
                    .send(&self.doc_message(DocPayload::SyncStep2 {
                        update: reply.update,
                    }))
                    .await?;
                client
                    .send(&self.doc_message(DocPayload::SyncStep1 {
                        state_vector: reply.state_vector,
                    }))
                    .await?;
                Ok(())
            }
            DocPayload::SyncStep2 { update } => {
                let exclude = client.map(|c| c.id());
                let store_result = if replication.is_none() {
                    let (_, store_result, ()) = tokio::join!(
                        self.broadcast(message, exclude),
                        self.store.handle_sync_step_2(&self.document_id, update),
                        self.publish(message),
                    );
                    store_result
                } else {
                    let (_, store_result) = tokio::join!(
                        self.broadcast(message, exclude),
                        self.store.handle_sync_step_2(&self.document_id, update),
                    );
                    store_result
                };
                store_result?;

                if let Some(client) = client {
                    if let Err(err) = client.send(&self.doc_message(DocPayload::SyncDone)).await
                    {
                        tracing::debug!(
                            client_id = %client.id(),
                            error = %err,
                            "sync-done send failed"
                        );
                    }
                }
                Ok(())
            }
            DocPayload::Update { update } => {
                self.write(update).await?;

                let exclude = client.map(|c| c.id());
                if replication.is_none() {
                    tokio::join!(self.broadcast(message, exclude), self.publish(message));
                } else {
                    self.broadcast(message, exclude).await;
                }

                self.events.emit(SessionEvent::DocumentMessage {
                    source: if replication.is_some() {
                        MessageSource::Replication
                    } else {
                        MessageSource::Client
                    },
                    deduped: replication.is_some_and(|meta| meta.deduped),
                    source_node_id: replication.map(|meta| meta.source_node_id.clone()),
                });
                Ok(())
            }
            DocPayload::SyncDone | DocPayload::AuthMessage { .. } => {
                tracing::debug!(
                    document_id = %self.document_id,
                    payload_type = doc.discriminant(),
                    "informational doc payload"
                );
                Ok(())
            }
        }
    }

    /// Publish a frame on the replication topic; failures are logged
    async fn publish(&self, message: &Message) {
        let topic = document_topic(&self.document_id);
        if let Err(err) = self
            .pubsub
            .publish(&topic, message.encoded().to_vec(), &self.node_id)
            .await
        {
            tracing::warn!(
                document_id = %self.document_id,
                error = %err,
                "pub/sub publish failed"
            );
        }
    }

    /// Handle one envelope from the fabric
    ///
    /// Frames from this node are dropped before the dedup is consulted.
    /// Malformed frames and mismatched documents are logged and dropped; a
    /// peer message must never tear down a session.
    pub async fn handle_replicated(self: &Arc<Self>, envelope: PubSubEnvelope) {
        if envelope.source_node_id == self.node_id {
            return;
        }

        let message = match codec::decode(&envelope.payload) {
            Ok(codec::Frame::Message(message)) => message,
            Ok(_) => return,
            Err(err) => {
                tracing::warn!(
                    document_id = %self.document_id,
                    error = %err,
                    "replicated frame failed to decode"
                );
                return;
            }
        };

        if message.document() != Some(self.document.as_str()) {
            tracing::debug!(
                document_id = %self.document_id,
                frame_document = ?message.document(),
                "replicated frame for another document dropped"
            );
            return;
        }

        let accepted = {
            let mut dedup = self.dedup.lock().await;
            dedup.should_accept(&self.document_id, message.id())
        };
        if !accepted {
            self.events.emit(SessionEvent::DocumentMessage {
                source: MessageSource::Replication,
                deduped: true,
                source_node_id: Some(envelope.source_node_id),
            });
            return;
        }

        let meta = ReplicationMeta {
            source_node_id: envelope.source_node_id,
            deduped: false,
        };
        if let Err(err) = self.apply(&message, None, Some(&meta)).await {
            tracing::warn!(
                document_id = %self.document_id,
                error = %err,
                "replicated message failed to apply"
            );
        }
    }

    fn doc_message(&self, payload: DocPayload) -> Message {
        Message::doc(self.document.clone(), self.encrypted, payload)
    }

    fn rpc_message(
        &self,
        method: &str,
        request_type: RpcRequestType,
        original_request_id: String,
        result: RpcResult,
    ) -> Message {
        Message::rpc(
            self.document.clone(),
            self.encrypted,
            RpcPayload {
                method: method.to_owned(),
                request_type,
                original_request_id,
                result,
            },
        )
    }

    fn rpc_context(&self, client: &Arc<Client>) -> RpcContext {
        RpcContext {
            document: self.document.clone(),
            document_id: self.document_id.clone(),
            node_id: self.node_id.clone(),
            client_id: Some(client.id().to_owned()),
            user_id: client.context().user_id().map(str::to_owned),
        }
    }

    async fn handle_rpc(
        self: &Arc<Self>,
        message: &Message,
        rpc: &RpcPayload,
        client: &Arc<Client>,
    ) -> Result<()> {
        match rpc.request_type {
            RpcRequestType::Request => self.handle_rpc_request(message, rpc, client).await,
            RpcRequestType::Stream => self.handle_rpc_stream(message, rpc, client).await,
            RpcRequestType::Response => {
                // Responses are correlated by higher-level RPC clients
                let correlate = if rpc.original_request_id.is_empty() {
                    message.id()
                } else {
                    rpc.original_request_id.as_str()
                };
                let codec = self
                    .rpc
                    .get(&rpc.method)
                    .map(|m| m.codec)
                    .unwrap_or_default();
                let event = match &rpc.result {
                    RpcResult::Success { payload } => {
                        RpcEvent::Response(Ok(codec.decode_response(message, payload)))
                    }
                    RpcResult::Error {
                        status_code,
                        details,
                        payload,
                    } => RpcEvent::Response(Err(RpcError {
                        status_code: *status_code,
                        details: details.clone(),
                        payload: payload.clone(),
                    })),
                };
                let _ = self.waiters.notify(correlate, event).await;
                Ok(())
            }
        }
    }

    async fn handle_rpc_request(
        self: &Arc<Self>,
        message: &Message,
        rpc: &RpcPayload,
        client: &Arc<Client>,
    ) -> Result<()> {
        let request_id = message.id().to_owned();
        let method = self.rpc.get(&rpc.method);
        let Some(RpcMethod {
            handler: Some(handler),
            codec,
            ..
        }) = method
        else {
            let error = RpcError::unknown_method(&rpc.method);
            return self
                .send_rpc_response(client, &rpc.method, request_id, Err(error))
                .await;
        };

        let request_payload = match &rpc.result {
            RpcResult::Success { payload } => codec.decode_request(message, payload),
            RpcResult::Error { .. } => Vec::new(),
        };
        let request = RpcRequest {
            method: rpc.method.clone(),
            request_id: request_id.clone(),
            payload: request_payload,
        };

        match handler(request, self.rpc_context(client)).await {
            Ok(mut reply) => {
                if let Some(mut stream) = reply.stream.take() {
                    while let Some(item) = stream.next().await {
                        let bytes = codec.encode_stream(message, &item);
                        let frame = self.rpc_message(
                            &rpc.method,
                            RpcRequestType::Stream,
                            request_id.clone(),
                            RpcResult::Success { payload: bytes },
                        );
                        if let Err(err) = client.send(&frame).await {
                            tracing::warn!(
                                client_id = %client.id(),
                                error = %err,
                                "rpc stream send failed"
                            );
                            break;
                        }
                    }
                }
                let payload = codec.encode_response(message, &reply.payload);
                self.send_rpc_response(client, &rpc.method, request_id, Ok(payload))
                    .await
            }
            Err(error) => {
                self.send_rpc_response(client, &rpc.method, request_id, Err(error))
                    .await
            }
        }
    }

    async fn handle_rpc_stream(
        self: &Arc<Self>,
        message: &Message,
        rpc: &RpcPayload,
        client: &Arc<Client>,
    ) -> Result<()> {
        let correlate = if rpc.original_request_id.is_empty() {
            message.id().to_owned()
        } else {
            rpc.original_request_id.clone()
        };
        let method = self.rpc.get(&rpc.method);
        let codec = method
            .as_ref()
            .map(|m| m.codec.clone())
            .unwrap_or_default();

        // A stream item answering one of our outbound calls?
        if let RpcResult::Success { payload } = &rpc.result {
            let decoded = codec.decode_stream(message, payload);
            if self
                .waiters
                .notify(&correlate, RpcEvent::Stream(decoded))
                .await
            {
                return Ok(());
            }
        }

        let Some(stream_handler) = method.and_then(|m| m.stream_handler) else {
            tracing::debug!(method = %rpc.method, "stream frame with no handler dropped");
            return Ok(());
        };

        let payload = match &rpc.result {
            RpcResult::Success { payload } => codec.decode_stream(message, payload),
            RpcResult::Error { .. } => Vec::new(),
        };
        let request = RpcRequest {
            method: rpc.method.clone(),
            request_id: correlate.clone(),
            payload,
        };

        let send: StreamSend = {
            let session = Arc::clone(self);
            let client = Arc::clone(client);
            let method = rpc.method.clone();
            let correlate = correlate.clone();
            Arc::new(move |bytes: Vec<u8>| {
                let session = Arc::clone(&session);
                let client = Arc::clone(&client);
                let method = method.clone();
                let correlate = correlate.clone();
                Box::pin(async move {
                    let frame = session.rpc_message(
                        &method,
                        RpcRequestType::Stream,
                        correlate,
                        RpcResult::Success { payload: bytes },
                    );
                    client.send(&frame).await
                })
            })
        };

        if let Err(error) = stream_handler(request, self.rpc_context(client), send).await {
            return self
                .send_rpc_response(client, &rpc.method, correlate, Err(error))
                .await;
        }
        Ok(())
    }

    async fn send_rpc_response(
        &self,
        client: &Arc<Client>,
        method: &str,
        original_request_id: String,
        outcome: std::result::Result<Vec<u8>, RpcError>,
    ) -> Result<()> {
        let result = match outcome {
            Ok(payload) => RpcResult::Success { payload },
            Err(error) => RpcResult::Error {
                status_code: error.status_code,
                details: error.details,
                payload: error.payload,
            },
        };
        let frame = self.rpc_message(method, RpcRequestType::Response, original_request_id, result);
        if let Err(err) = client.send(&frame).await {
            tracing::warn!(
                client_id = %client.id(),
                error = %err,
                "rpc response send failed"
            );
        }
        Ok(())
    }

    /// Invoke a method on a connected client and await its response
    ///
    /// Stream items arriving before the response are collected into the
    /// outcome. The call fails with `HubError::RpcTimeout` when the deadline
    /// passes.
    pub async fn rpc_call(
        self: &Arc<Self>,
        client: &Arc<Client>,
        method: &str,
        payload: Vec<u8>,
        timeout: std::time::Duration,
    ) -> Result<RpcCallOutcome> {
        let request = self.rpc_message(
            method,
            RpcRequestType::Request,
            String::new(),
            RpcResult::Success { payload },
        );
        let request_id = request.id().to_owned();
        let mut rx = self.waiters.register(request_id.clone());

        if let Err(err) = client.send(&request).await {
            self.waiters.forget(&request_id);
            return Err(err);
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut items = Vec::new();
        loop {
            tokio::select! {
                () = &mut deadline => {
                    self.waiters.forget(&request_id);
                    return Err(HubError::RpcTimeout(timeout));
                }
                event = rx.recv() => match event {
                    Some(RpcEvent::Stream(item)) => items.push(item),
                    Some(RpcEvent::Response(Ok(payload))) => {
                        return Ok(RpcCallOutcome { items, payload });
                    }
                    Some(RpcEvent::Response(Err(error))) => {
                        return Err(HubError::Rpc {
                            status_code: error.status_code,
                            details: error.details,
                        });
                    }
                    None => return Err(HubError::ClientClosed),
                },
            }
        }
    }

    /// Tear the session down: cancel timers, stop replication (dropping the
    /// subscription), destroy remaining clients, and fire `dispose`.
    /// Idempotent.
    pub async fn dispose(self: &Arc<Self>) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_cleanup();

        if let Some(handle) = self
            .replication
            .lock()
            .expect("replication lock poisoned")
            .take()
        {
            handle.abort();
        }

        let clients: Vec<Arc<Client>> = {
            let mut clients = self.clients.write().await;
            clients.drain().map(|(_, c)| c).collect()
        };
        for client in clients {
            client.destroy().await;
        }
        self.awareness.write().await.clear();

        self.events.emit(SessionEvent::Dispose);
        tracing::info!(document_id = %self.document_id, "session disposed");
    }

    /// Snapshot for the stats surface
    pub async fn stats(&self) -> SessionStats {
        SessionStats {
            document: self.document.clone(),
            document_id: self.document_id.clone(),
            clients: self.client_count().await,
            loaded: self.is_loaded(),
            encrypted: self.encrypted,
            dedup_entries: self.dedup.lock().await.len(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("document_id", &self.document_id)
            .field("encrypted", &self.encrypted)
            .field("loaded", &self.is_loaded())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
