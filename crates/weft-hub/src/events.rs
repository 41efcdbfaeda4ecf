//! Session lifecycle events.
//!
//! Every observable state change is published on a typed broadcast bus.
//! Event names are part of the public contract and must match exactly.

use tokio::sync::broadcast;

/// Where an applied message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    /// Received from a locally connected client
    Client,
    /// Received from the pub/sub fabric
    Replication,
}

/// A session lifecycle event
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A client joined the fan-out set
    ClientJoin {
        /// Joining client
        client_id: String,
    },
    /// A client left the fan-out set
    ClientLeave {
        /// Leaving client
        client_id: String,
    },
    /// A document message was processed (or suppressed by dedup)
    DocumentMessage {
        /// Local client or replication
        source: MessageSource,
        /// Whether the dedup suppressed it
        deduped: bool,
        /// Originating node for replicated messages
        source_node_id: Option<String>,
    },
    /// An update was written to the document store
    DocumentWrite {
        /// Storage-facing document id
        document_id: String,
    },
    /// Document size crossed the configured warning threshold
    DocumentSizeWarning {
        /// Current size
        size_bytes: u64,
        /// Threshold that was crossed
        threshold: u64,
    },
    /// Document size crossed the configured hard limit
    DocumentSizeLimitExceeded {
        /// Current size
        size_bytes: u64,
        /// Limit that was crossed
        limit: u64,
    },
    /// The session was disposed
    Dispose,
}

impl SessionEvent {
    /// The exact wire-contract name of this event
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ClientJoin { .. } => "client-join",
            Self::ClientLeave { .. } => "client-leave",
            Self::DocumentMessage { .. } => "document-message",
            Self::DocumentWrite { .. } => "document-write",
            Self::DocumentSizeWarning { .. } => "document-size-warning",
            Self::DocumentSizeLimitExceeded { .. } => "document-size-limit-exceeded",
            Self::Dispose => "dispose",
        }
    }
}

/// Broadcast bus for session events
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a bus with the given buffer capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}
