//! Message model: tagged payload variants, construction context, and the
//! derived identity.
//!
//! The encoded frame is the canonical identity of a message: `id()` is the
//! base64 of the SHA-256 of the encoded bytes, so two structurally identical
//! messages with different encodings are different identities. Both the
//! encoded form and the id are memoized on first use.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

use crate::codec;
use crate::error::DecodeError;

/// Top-level message type discriminants
///
/// The numeric values are fixed by the wire contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Document synchronization
    Doc = 0,
    /// Presence / awareness updates
    Awareness = 1,
    /// Chunked file transfer
    File = 3,
    /// Request/response/streaming RPC
    Rpc = 4,
    /// Delivery acknowledgment
    Ack = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Doc),
            1 => Ok(Self::Awareness),
            3 => Ok(Self::File),
            4 => Ok(Self::Rpc),
            5 => Ok(Self::Ack),
            _ => Err(DecodeError::Unknown {
                field: "message_type",
                value,
            }),
        }
    }
}

/// Auth message permission outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Permission {
    /// Access granted
    Granted = 0,
    /// Access denied; carries a reason string on the wire
    Denied = 1,
}

impl TryFrom<u8> for Permission {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Granted),
            1 => Ok(Self::Denied),
            _ => Err(DecodeError::Unknown {
                field: "permission",
                value,
            }),
        }
    }
}

/// Body of a `doc` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocPayload {
    /// Sync handshake step 1: sender's state vector
    SyncStep1 {
        /// Opaque CRDT state vector
        state_vector: Vec<u8>,
    },
    /// Sync handshake step 2: the diff computed against a step-1 state vector
    SyncStep2 {
        /// Opaque CRDT update
        update: Vec<u8>,
    },
    /// Incremental document update
    Update {
        /// Opaque CRDT update
        update: Vec<u8>,
    },
    /// Authorization outcome for the document
    AuthMessage {
        /// Granted or denied
        permission: Permission,
        /// Denial reason; present on the wire only when denied
        reason: Option<String>,
    },
    /// Handshake completion marker
    SyncDone,
}

impl DocPayload {
    /// Wire discriminant for this variant
    #[must_use]
    pub fn discriminant(&self) -> u8 {
        match self {
            Self::SyncStep1 { .. } => 0,
            Self::SyncStep2 { .. } => 1,
            Self::Update { .. } => 2,
            Self::AuthMessage { .. } => 3,
            Self::SyncDone => 4,
        }
    }
}

/// Body of an `awareness` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwarenessPayload {
    /// Presence state update
    Update {
        /// Opaque awareness update
        update: Vec<u8>,
    },
}

/// Direction of a file transfer request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileDirection {
    /// Sender is pushing a file to the receiver
    Upload = 0,
    /// Sender is asking the receiver for a file
    Download = 1,
}

impl TryFrom<u8> for FileDirection {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Upload),
            1 => Ok(Self::Download),
            _ => Err(DecodeError::Unknown {
                field: "file_direction",
                value,
            }),
        }
    }
}

/// Body of a `file` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePayload {
    /// Transfer initiation / metadata announcement
    Request {
        /// Upload or download
        direction: FileDirection,
        /// Correlation id for subsequent progress frames
        file_id: String,
        /// File name
        filename: String,
        /// Plaintext size in bytes
        size: u64,
        /// MIME type
        mime_type: String,
        /// Merkle root (content id) when already known
        content_id: Option<Vec<u8>>,
    },
    /// One verified chunk of file content
    Progress {
        /// Correlation id from the request
        file_id: String,
        /// Zero-based chunk index
        chunk_index: u64,
        /// Chunk bytes as transmitted (possibly sealed)
        chunk_data: Vec<u8>,
        /// Total number of chunks in the file
        total_chunks: u64,
        /// Cumulative bytes transferred including this chunk
        bytes_uploaded: u64,
        /// Whether the chunk bytes are sealed with the chunk cipher
        encrypted: bool,
        /// Merkle inclusion proof for this chunk
        proof: Vec<[u8; 32]>,
    },
}

impl FilePayload {
    /// Wire discriminant for this variant
    #[must_use]
    pub fn discriminant(&self) -> u8 {
        match self {
            Self::Request { .. } => 0,
            Self::Progress { .. } => 1,
        }
    }
}

/// RPC message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcRequestType {
    /// Invoke a method
    Request = 0,
    /// One item of a streamed result
    Stream = 1,
    /// Final outcome of a request
    Response = 2,
}

impl TryFrom<u8> for RpcRequestType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Stream),
            2 => Ok(Self::Response),
            _ => Err(DecodeError::Unknown {
                field: "rpc_request_type",
                value,
            }),
        }
    }
}

/// Success-or-error result carried by every RPC frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcResult {
    /// Success; opaque payload bytes
    Success {
        /// Length-prefixed opaque payload
        payload: Vec<u8>,
    },
    /// Error with a status code and human-readable details
    Error {
        /// Numeric status (501 unknown method, 500 handler failure, ...)
        status_code: u64,
        /// Detail string
        details: String,
        /// Optional structured error payload
        payload: Option<Vec<u8>>,
    },
}

/// Body of an `rpc` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcPayload {
    /// Method name
    pub method: String,
    /// Request, stream item, or response
    pub request_type: RpcRequestType,
    /// Id of the originating request; empty for fresh requests
    pub original_request_id: String,
    /// Success or error body
    pub result: RpcResult,
}

/// Type-specific message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Document synchronization body
    Doc(DocPayload),
    /// Awareness body
    Awareness(AwarenessPayload),
    /// File transfer body
    File(FilePayload),
    /// RPC body
    Rpc(RpcPayload),
    /// Acknowledgment of a previously received message
    Ack {
        /// Id of the acknowledged message
        message_id: String,
    },
}

impl Payload {
    /// Top-level type of this body
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Doc(_) => MessageType::Doc,
            Self::Awareness(_) => MessageType::Awareness,
            Self::File(_) => MessageType::File,
            Self::Rpc(_) => MessageType::Rpc,
            Self::Ack { .. } => MessageType::Ack,
        }
    }
}

/// Well-known context keys
pub mod context_keys {
    /// Connection-scoped client id
    pub const CLIENT_ID: &str = "clientId";
    /// Authenticated user id
    pub const USER_ID: &str = "userId";
    /// Room used to namespace document ids server-side
    pub const ROOM: &str = "room";
}

/// Opaque envelope of string key/values attached at construction time.
///
/// The context is never serialized on the wire; it carries connection-scoped
/// facts such as the client id, user id, and room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    entries: BTreeMap<String, String>,
}

impl Context {
    /// Empty context
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Insert a key/value pair, returning self for chaining
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Insert a key/value pair in place
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// The client id, when set
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.get(context_keys::CLIENT_ID)
    }

    /// The user id, when set
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.get(context_keys::USER_ID)
    }

    /// The room, when set
    #[must_use]
    pub fn room(&self) -> Option<&str> {
        self.get(context_keys::ROOM)
    }
}

/// A framed protocol message
///
/// Equality compares the semantic fields (document, encrypted flag, payload);
/// the memoized encoding and context do not participate.
#[derive(Debug, Clone)]
pub struct Message {
    document: Option<String>,
    encrypted: bool,
    payload: Payload,
    context: Context,
    encoded: OnceLock<Vec<u8>>,
    id: OnceLock<String>,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.document == other.document
            && self.encrypted == other.encrypted
            && self.payload == other.payload
    }
}

impl Eq for Message {}

impl Message {
    /// Create a `doc` message
    #[must_use]
    pub fn doc(document: impl Into<String>, encrypted: bool, payload: DocPayload) -> Self {
        Self::from_parts(Some(document.into()), encrypted, Payload::Doc(payload))
    }

    /// Create an `awareness` message
    #[must_use]
    pub fn awareness(document: impl Into<String>, encrypted: bool, update: Vec<u8>) -> Self {
        Self::from_parts(
            Some(document.into()),
            encrypted,
            Payload::Awareness(AwarenessPayload::Update { update }),
        )
    }

    /// Create a `file` message
    #[must_use]
    pub fn file(document: impl Into<String>, encrypted: bool, payload: FilePayload) -> Self {
        Self::from_parts(Some(document.into()), encrypted, Payload::File(payload))
    }

    /// Create an `rpc` message
    #[must_use]
    pub fn rpc(document: impl Into<String>, encrypted: bool, payload: RpcPayload) -> Self {
        Self::from_parts(Some(document.into()), encrypted, Payload::Rpc(payload))
    }

    /// Create an `ack` message
    ///
    /// Acks carry no document; on the wire the document slot is a
    /// zero-length string and decoded acks expose `document() == None`.
    #[must_use]
    pub fn ack(message_id: impl Into<String>) -> Self {
        Self::from_parts(
            None,
            false,
            Payload::Ack {
                message_id: message_id.into(),
            },
        )
    }

    /// Assemble a message from decoded or constructed parts
    #[must_use]
    pub fn from_parts(document: Option<String>, encrypted: bool, payload: Payload) -> Self {
        Self {
            document,
            encrypted,
            payload,
            context: Context::new(),
            encoded: OnceLock::new(),
            id: OnceLock::new(),
        }
    }

    /// Attach a context, returning self for chaining
    #[must_use]
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Document name; `None` for acks
    #[must_use]
    pub fn document(&self) -> Option<&str> {
        self.document.as_deref()
    }

    /// Whether the payload bytes are encrypted end-to-end
    #[must_use]
    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    /// Type-specific body
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Top-level message type
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Construction-time context (never on the wire)
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The canonical encoded frame, computed once
    pub fn encoded(&self) -> &[u8] {
        self.encoded.get_or_init(|| codec::encode_message(self))
    }

    /// Derived identity: base64(SHA-256(encoded frame)), computed once
    pub fn id(&self) -> &str {
        self.id
            .get_or_init(|| BASE64.encode(Sha256::digest(self.encoded())))
    }

    /// Seed the memoized encoding with bytes received off the wire
    ///
    /// Used by the decoder so that re-encoding a decoded message reproduces
    /// the exact frame it arrived in, keeping the derived id stable.
    pub(crate) fn set_encoded(&self, frame: Vec<u8>) {
        let _ = self.encoded.set(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_discriminants() {
        assert_eq!(MessageType::Doc as u8, 0);
        assert_eq!(MessageType::Awareness as u8, 1);
        assert_eq!(MessageType::File as u8, 3);
        assert_eq!(MessageType::Rpc as u8, 4);
        assert_eq!(MessageType::Ack as u8, 5);
    }

    #[test]
    fn test_message_type_rejects_gap() {
        // 2 sits in the gap between awareness and file
        assert!(matches!(
            MessageType::try_from(2),
            Err(DecodeError::Unknown { field: "message_type", value: 2 })
        ));
    }

    #[test]
    fn test_doc_payload_discriminants() {
        assert_eq!(DocPayload::SyncStep1 { state_vector: vec![] }.discriminant(), 0);
        assert_eq!(DocPayload::SyncStep2 { update: vec![] }.discriminant(), 1);
        assert_eq!(DocPayload::Update { update: vec![] }.discriminant(), 2);
        assert_eq!(
            DocPayload::AuthMessage { permission: Permission::Granted, reason: None }
                .discriminant(),
            3
        );
        assert_eq!(DocPayload::SyncDone.discriminant(), 4);
    }

    #[test]
    fn test_ack_has_no_document() {
        let ack = Message::ack("abc");
        assert_eq!(ack.document(), None);
        assert_eq!(ack.message_type(), MessageType::Ack);
    }

    #[test]
    fn test_context_is_not_identity() {
        let a = Message::doc("d", false, DocPayload::SyncDone);
        let b = Message::doc("d", false, DocPayload::SyncDone)
            .with_context(Context::new().with(context_keys::CLIENT_ID, "c1"));
        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_id_memoized() {
        let msg = Message::doc("doc", false, DocPayload::SyncDone);
        let first = msg.id().to_owned();
        assert_eq!(msg.id(), first);
    }
}
