//! Client connection: owns the write half of a duplex stream.
//!
//! Sends go through a strict FIFO queue drained by a single background
//! worker that writes one frame at a time and awaits write completion
//! before starting the next, so a client observes outbound messages in the
//! order `send` was called. A failed write is reported to that send's
//! caller; later queued frames still attempt delivery unless the writer is
//! unrecoverable.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock, Weak};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use async_trait::async_trait;

use weft_proto::{Context, Message};

use crate::error::{HubError, Result};
use crate::session::Session;

/// Connection-scoped client id
pub type ClientId = String;

/// Failure writing to the transport
#[derive(Debug, Clone)]
pub struct SinkError {
    /// When true, the writer is unrecoverable and every later send fails
    pub fatal: bool,
    /// Description
    pub message: Cow<'static, str>,
}

impl SinkError {
    /// A recoverable write failure
    #[must_use]
    pub fn transient(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            fatal: false,
            message: message.into(),
        }
    }

    /// An unrecoverable writer failure
    #[must_use]
    pub fn fatal(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            fatal: true,
            message: message.into(),
        }
    }
}

/// Write half of a client's duplex stream
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Write one complete frame; resolves when the write finished
    async fn write(&self, frame: Vec<u8>) -> std::result::Result<(), SinkError>;

    /// Release the writer
    async fn close(&self) {}
}

/// Client lifecycle event
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The client was destroyed
    Destroy {
        /// Destroyed client
        client_id: ClientId,
    },
}

impl ClientEvent {
    /// The exact contract name of this event
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Destroy { .. } => "destroy",
        }
    }
}

struct Outbound {
    frame: Vec<u8>,
    done: oneshot::Sender<Result<()>>,
}

/// A connected client
///
/// Ownership rests with the connection acceptor and the session registry;
/// sessions hold `Arc<Client>` in their fan-out maps and the client keeps
/// only weak back references to the sessions it joined, for teardown.
pub struct Client {
    id: ClientId,
    context: Context,
    tx: RwLock<Option<mpsc::Sender<Outbound>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
    events: broadcast::Sender<ClientEvent>,
    sessions: Mutex<Vec<Weak<Session>>>,
}

impl Client {
    /// Create a client over `sink` and start its writer worker
    #[must_use]
    pub fn new(
        id: impl Into<ClientId>,
        context: Context,
        sink: std::sync::Arc<dyn MessageSink>,
    ) -> std::sync::Arc<Self> {
        let id = id.into();
        let (tx, mut rx) = mpsc::channel::<Outbound>(256);
        let (events, _) = broadcast::channel(16);

        let worker_id = id.clone();
        let worker = tokio::spawn(async move {
            let mut broken = false;
            while let Some(Outbound { frame, done }) = rx.recv().await {
                if broken {
                    let _ = done.send(Err(HubError::ClientClosed));
                    continue;
                }
                match sink.write(frame).await {
                    Ok(()) => {
                        let _ = done.send(Ok(()));
                    }
                    Err(err) => {
                        if err.fatal {
                            broken = true;
                            tracing::warn!(
                                client_id = %worker_id,
                                error = %err.message,
                                "client writer unrecoverable"
                            );
                        } else {
                            tracing::debug!(
                                client_id = %worker_id,
                                error = %err.message,
                                "client write failed"
                            );
                        }
                        let _ = done.send(Err(HubError::SendFailed(err.message)));
                    }
                }
            }
            sink.close().await;
        });

        std::sync::Arc::new(Self {
            id,
            context,
            tx: RwLock::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            destroyed: AtomicBool::new(false),
            events,
            sessions: Mutex::new(Vec::new()),
        })
    }

    /// The client id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Connection context (client id, user id, room)
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Whether `destroy` has run
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Subscribe to lifecycle events
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Queue a message; resolves when the frame has been written
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.send_frame(message.encoded().to_vec()).await
    }

    /// Queue a raw frame (used for pong replies)
    pub async fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        let tx = {
            let guard = self.tx.read().expect("send queue lock poisoned");
            guard.clone()
        };
        let Some(tx) = tx else {
            return Err(HubError::ClientClosed);
        };

        let (done, outcome) = oneshot::channel();
        tx.send(Outbound { frame, done })
            .await
            .map_err(|_| HubError::ClientClosed)?;
        outcome.await.map_err(|_| HubError::ClientClosed)?
    }

    /// Remember a joined session for teardown
    pub fn link_session(&self, session: &std::sync::Arc<Session>) {
        let mut sessions = self.sessions.lock().expect("session list lock poisoned");
        sessions.retain(|weak| weak.upgrade().is_some());
        if !sessions
            .iter()
            .any(|weak| weak.upgrade().is_some_and(|s| std::sync::Arc::ptr_eq(&s, session)))
        {
            sessions.push(std::sync::Arc::downgrade(session));
        }
    }

    /// Sessions this client has joined and that are still alive
    ///
    /// Used to route frames that carry no document of their own (acks).
    #[must_use]
    pub fn joined_sessions(&self) -> Vec<std::sync::Arc<Session>> {
        let mut sessions = self.sessions.lock().expect("session list lock poisoned");
        sessions.retain(|weak| weak.upgrade().is_some());
        sessions.iter().filter_map(Weak::upgrade).collect()
    }

    /// Tear down the client: drain the queue, release the writer, unlink
    /// from joined sessions, and fire `destroy`. Idempotent.
    pub fn destroy(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if self.destroyed.swap(true, Ordering::SeqCst) {
                return;
            }

            // Closing the queue lets the worker drain what is already enqueued
            {
                let mut guard = self.tx.write().expect("send queue lock poisoned");
                guard.take();
            }

            let worker = {
                let mut guard = self.worker.lock().expect("worker lock poisoned");
                guard.take()
            };
            if let Some(worker) = worker {
                if let Err(err) = worker.await {
                    tracing::debug!(client_id = %self.id, error = %err, "writer worker ended abnormally");
                }
            }

            let sessions: Vec<Weak<Session>> = {
                let mut guard = self.sessions.lock().expect("session list lock poisoned");
                std::mem::take(&mut *guard)
            };
            for weak in sessions {
                if let Some(session) = weak.upgrade() {
                    session.remove_client(&self.id).await;
                }
            }

            let _ = self.events.send(ClientEvent::Destroy {
                client_id: self.id.clone(),
            });
            tracing::debug!(client_id = %self.id, "client destroyed");
        })
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}
