//! Session registry: creates and looks up sessions, routes inbound client
//! frames, and reaps sessions whose quiet period elapsed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use weft_proto::{Context, Frame, Message, Payload, codec};

use crate::client::Client;
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::rpc::{RpcRegistry, RpcWaiters};
use crate::session::{Session, SessionParams, SessionStats};
use crate::store::StorageFactory;
use crate::transfer::TransferHost;

/// Hub-wide statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStats {
    /// This node's id
    pub node_id: String,
    /// Per-session snapshots
    pub sessions: Vec<SessionStats>,
    /// In-flight transfer handlers
    pub active_transfers: usize,
    /// Pending outbound RPC calls
    pub pending_rpc: usize,
}

/// Build the storage-facing document id, namespacing by room when present
#[must_use]
pub fn namespaced_document_id(context: &Context, document: &str) -> String {
    match context.room() {
        Some(room) => format!("{room}/{document}"),
        None => document.to_owned(),
    }
}

/// Session registry and message router
pub struct Registry {
    sessions: DashMap<String, Arc<Session>>,
    factory: Arc<dyn StorageFactory>,
    pubsub: Arc<dyn crate::pubsub::PubSub>,
    rpc: Arc<RpcRegistry>,
    waiters: Arc<RpcWaiters>,
    transfers: TransferHost,
    config: HubConfig,
    node_id: String,
    dispose_tx: mpsc::Sender<String>,
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Registry {
    /// Create a registry with a random node id
    #[must_use]
    pub fn new(
        factory: Arc<dyn StorageFactory>,
        pubsub: Arc<dyn crate::pubsub::PubSub>,
        config: HubConfig,
    ) -> Arc<Self> {
        let mut id_bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        Self::with_node_id(factory, pubsub, config, hex::encode(id_bytes))
    }

    /// Create a registry with an explicit node id
    #[must_use]
    pub fn with_node_id(
        factory: Arc<dyn StorageFactory>,
        pubsub: Arc<dyn crate::pubsub::PubSub>,
        config: HubConfig,
        node_id: String,
    ) -> Arc<Self> {
        let (dispose_tx, mut dispose_rx) = mpsc::channel::<String>(64);
        let transfers = TransferHost::new(config.transfer.clone());

        let registry = Arc::new(Self {
            sessions: DashMap::new(),
            factory,
            pubsub,
            rpc: Arc::new(RpcRegistry::new()),
            waiters: Arc::new(RpcWaiters::new()),
            transfers,
            config,
            node_id,
            dispose_tx,
            reaper: std::sync::Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        // Reaper: sessions announce themselves when their quiet period
        // elapses; double-check emptiness before removal to tolerate a
        // client racing the timer.
        let weak = Arc::downgrade(&registry);
        let reaper = tokio::spawn(async move {
            while let Some(document_id) = dispose_rx.recv().await {
                let Some(registry) = weak.upgrade() else { break };
                registry.reap(&document_id).await;
            }
        });
        *registry.reaper.lock().expect("reaper lock poisoned") = Some(reaper);

        registry
    }

    /// This node's id, used as the pub/sub source
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The shared RPC method registry
    #[must_use]
    pub fn rpc(&self) -> &Arc<RpcRegistry> {
        &self.rpc
    }

    /// The transfer handler host
    #[must_use]
    pub fn transfers(&self) -> &TransferHost {
        &self.transfers
    }

    /// Look up a session by namespaced document id
    #[must_use]
    pub fn get(&self, document_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(document_id).map(|s| Arc::clone(&s))
    }

    /// Number of live sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Look up or create the session for `document` under `context`
    ///
    /// Creation resolves the backing store through the storage factory,
    /// loads the session (subscribing it to the fabric), and registers it.
    pub async fn get_or_create(
        &self,
        context: &Context,
        document: &str,
        encrypted: bool,
    ) -> Result<Arc<Session>> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(HubError::SessionDisposed(document.to_owned()));
        }
        let document_id = namespaced_document_id(context, document);
        if let Some(session) = self.get(&document_id) {
            return Ok(session);
        }

        let store = self
            .factory
            .get_storage(context, document, &document_id)
            .await?;
        let session = Session::new(
            SessionParams {
                document: document.to_owned(),
                document_id: document_id.clone(),
                encrypted,
                node_id: self.node_id.clone(),
                config: self.config.session.clone(),
            },
            store,
            Arc::clone(&self.pubsub),
            Arc::clone(&self.rpc),
            Arc::clone(&self.waiters),
            self.dispose_tx.clone(),
        );
        session.load().await?;

        // Another task may have won the race while we were loading
        match self.sessions.entry(document_id) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                let winner = Arc::clone(existing.get());
                drop(existing);
                session.dispose().await;
                Ok(winner)
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&session));
                tracing::info!(document_id = %session.document_id(), "session created");
                Ok(session)
            }
        }
    }

    /// Remove and dispose a session
    pub async fn remove(&self, document_id: &str) {
        if let Some((_, session)) = self.sessions.remove(document_id) {
            session.dispose().await;
        }
    }

    async fn reap(&self, document_id: &str) {
        let Some(session) = self.get(document_id) else {
            return;
        };
        if session.should_dispose().await {
            self.sessions.remove(document_id);
            session.dispose().await;
            tracing::info!(document_id = %document_id, "idle session reaped");
        }
    }

    /// Handle one inbound frame from a client connection
    ///
    /// Answers pings, routes file payloads to the transfer host, joins the
    /// client to the target session on first contact, and applies the
    /// message. Errors are returned for the caller to log; the session
    /// keeps running.
    pub async fn handle_frame(&self, client: &Arc<Client>, frame: &[u8]) -> Result<()> {
        match codec::decode(frame)? {
            Frame::Ping => {
                client.send_frame(codec::encode_pong().to_vec()).await?;
                Ok(())
            }
            Frame::Pong => Ok(()),
            Frame::Message(message) => self.handle_message(client, message).await,
        }
    }

    /// Route a decoded message from a client
    pub async fn handle_message(&self, client: &Arc<Client>, message: Message) -> Result<()> {
        if let Payload::File(file) = message.payload() {
            self.transfers.handle_file_payload(file);
        }

        let Some(document) = message.document() else {
            // Acks carry no document; deliver to every session the client
            // has joined so a registered waiter resolves
            let sessions = client.joined_sessions();
            if sessions.is_empty() {
                tracing::debug!(client_id = %client.id(), "ack from client with no session");
                return Ok(());
            }
            for session in sessions {
                if let Err(err) = session.apply(&message, Some(client), None).await {
                    tracing::warn!(
                        client_id = %client.id(),
                        document_id = %session.document_id(),
                        error = %err,
                        "ack apply failed"
                    );
                }
            }
            return Ok(());
        };

        let session = self
            .get_or_create(client.context(), document, message.encrypted())
            .await?;
        session.add_client(Arc::clone(client)).await;
        session.apply(&message, Some(client), None).await
    }

    /// Dispose every session concurrently; failures are logged, not
    /// propagated
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.sessions.clear();

        let disposals = sessions.into_iter().map(|session| async move {
            session.dispose().await;
        });
        futures::future::join_all(disposals).await;

        self.transfers.abort_all();
        if let Some(reaper) = self.reaper.lock().expect("reaper lock poisoned").take() {
            reaper.abort();
        }
        tracing::info!(node_id = %self.node_id, "registry destroyed");
    }

    /// Hub-wide statistics snapshot
    pub async fn stats(&self) -> RegistryStats {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut snapshots = Vec::with_capacity(sessions.len());
        for session in sessions {
            snapshots.push(session.stats().await);
        }
        snapshots.sort_by(|a, b| a.document_id.cmp(&b.document_id));

        RegistryStats {
            node_id: self.node_id.clone(),
            sessions: snapshots,
            active_transfers: self.transfers.active(),
            pending_rpc: self.waiters.pending(),
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("node_id", &self.node_id)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
