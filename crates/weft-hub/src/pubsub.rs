//! Pub/sub fabric seam.
//!
//! Server nodes replicate document traffic through a publish/subscribe
//! collaborator. The hub only needs two operations: subscribe to a topic and
//! publish raw encoded frames tagged with the originating node id. Topics
//! for document replication are `document/{namespaced_document_id}`.
//!
//! [`MemoryPubSub`] is the in-process reference implementation used by tests
//! and single-binary deployments; production deployments plug in a real
//! fabric behind the same trait.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::Result;

/// Topic for a document's replication stream
#[must_use]
pub fn document_topic(namespaced_document_id: &str) -> String {
    format!("document/{namespaced_document_id}")
}

/// One replicated message
#[derive(Debug, Clone)]
pub struct PubSubEnvelope {
    /// Raw encoded frame bytes
    pub payload: Vec<u8>,
    /// Node that published the message
    pub source_node_id: String,
}

/// An active subscription
///
/// Dropping the subscription unsubscribes from the topic.
pub struct Subscription {
    rx: mpsc::Receiver<PubSubEnvelope>,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Assemble a subscription from a receiver and an unsubscribe hook
    #[must_use]
    pub fn new(
        rx: mpsc::Receiver<PubSubEnvelope>,
        unsubscribe: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            rx,
            unsubscribe: Some(unsubscribe),
        }
    }

    /// Receive the next envelope; `None` once the topic is gone
    pub async fn recv(&mut self) -> Option<PubSubEnvelope> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Publish/subscribe collaborator
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Subscribe to `topic`
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;

    /// Publish raw frame bytes on `topic`, tagged with the publishing node
    async fn publish(&self, topic: &str, payload: Vec<u8>, source_node_id: &str) -> Result<()>;
}

/// Per-subscriber channel capacity
const SUBSCRIBER_BUFFER: usize = 256;

type SubscriberMap = DashMap<String, Vec<(u64, mpsc::Sender<PubSubEnvelope>)>>;

/// In-process pub/sub over per-subscriber channels
#[derive(Debug, Default)]
pub struct MemoryPubSub {
    topics: Arc<SubscriberMap>,
    next_id: AtomicU64,
}

impl MemoryPubSub {
    /// Create an empty fabric
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on `topic`
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |subs| subs.len())
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .entry(topic.to_owned())
            .or_default()
            .push((id, tx));

        let topics = Arc::clone(&self.topics);
        let topic = topic.to_owned();
        let unsubscribe = Box::new(move || {
            if let Some(mut subs) = topics.get_mut(&topic) {
                subs.retain(|(sub_id, _)| *sub_id != id);
            }
        });
        Ok(Subscription::new(rx, unsubscribe))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, source_node_id: &str) -> Result<()> {
        let subscribers: Vec<(u64, mpsc::Sender<PubSubEnvelope>)> = self
            .topics
            .get(topic)
            .map(|subs| subs.clone())
            .unwrap_or_default();

        let envelope = PubSubEnvelope {
            payload,
            source_node_id: source_node_id.to_owned(),
        };
        let mut dead = Vec::new();
        for (id, tx) in &subscribers {
            if tx.send(envelope.clone()).await.is_err() {
                dead.push(*id);
            }
        }
        if !dead.is_empty() {
            if let Some(mut subs) = self.topics.get_mut(topic) {
                subs.retain(|(id, _)| !dead.contains(id));
            }
        }
        Ok(())
    }
}

impl MemoryPubSub {
    /// Wrap in an `Arc<dyn PubSub>`
    #[must_use]
    pub fn shared() -> Arc<dyn PubSub> {
        Arc::new(Self::new())
    }
}
