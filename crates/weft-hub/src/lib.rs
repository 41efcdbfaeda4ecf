//! # Weft Session Engine
//!
//! The hub core: per-document sessions that apply protocol messages, drive
//! the CRDT sync handshake, fan out to local clients, and replicate across
//! server nodes through a publish/subscribe fabric with TTL dedup and loop
//! suppression.
//!
//! External collaborators are seams, not dependencies: the CRDT algebra
//! lives behind [`store::DocumentStore`], the fabric behind
//! [`pubsub::PubSub`], and transports behind [`client::MessageSink`].
//! In-memory reference implementations of the first two back the test suite
//! and single-node deployments.
//!
//! ## Module structure
//!
//! - [`registry`]: session lookup/creation, frame routing, reaping
//! - [`session`]: the per-document protocol state machine
//! - [`client`]: FIFO-ordered client writer and lifecycle
//! - [`dedup`]: TTL-bounded replication dedup
//! - [`events`]: typed session event bus
//! - [`pubsub`] / [`store`]: collaborator seams with memory impls
//! - [`rpc`]: method registry, payload codec hooks, call correlation
//! - [`transfer`]: transient upload/download handler hosting

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod pubsub;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod store;
pub mod transfer;

pub use client::{Client, ClientEvent, ClientId, MessageSink, SinkError};
pub use config::{DedupConfig, HubConfig, SessionConfig, TransferConfig};
pub use dedup::TtlDedup;
pub use error::{HubError, Result};
pub use events::{EventBus, MessageSource, SessionEvent};
pub use pubsub::{MemoryPubSub, PubSub, PubSubEnvelope, Subscription, document_topic};
pub use registry::{Registry, RegistryStats, namespaced_document_id};
pub use rpc::{
    MethodCodec, RpcContext, RpcError, RpcEvent, RpcHandler, RpcMethod, RpcRegistry, RpcReply,
    RpcRequest, RpcWaiters, StreamHandler, StreamSend,
};
pub use session::{ReplicationMeta, RpcCallOutcome, Session, SessionParams, SessionStats};
pub use store::{
    DocumentContent, DocumentMetadata, DocumentStore, MemoryStore, SharedStorageFactory,
    StorageFactory, StoreError, SyncReply, TransactionFn,
};
pub use transfer::{CompletedUpload, DownloadResult, TransferHost};
