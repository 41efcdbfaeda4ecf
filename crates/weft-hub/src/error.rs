//! Error types for the session engine.

use std::borrow::Cow;

use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by sessions, clients, and the registry
#[derive(Debug, Error)]
pub enum HubError {
    /// Message encryption flag differs from the session flag
    #[error("encryption flag mismatch for document {document}")]
    EncryptionMismatch {
        /// Document the message was addressed to
        document: String,
    },

    /// Surfaced from the document store as-is
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A peer frame failed to decode
    #[error(transparent)]
    Decode(#[from] weft_proto::DecodeError),

    /// File transfer failure
    #[error(transparent)]
    Transfer(#[from] weft_files::TransferError),

    /// The client's writer has been destroyed
    #[error("client connection closed")]
    ClientClosed,

    /// A write to the client's transport failed
    #[error("client send failed: {0}")]
    SendFailed(Cow<'static, str>),

    /// Pub/sub fabric failure
    #[error("pub/sub error: {0}")]
    PubSub(Cow<'static, str>),

    /// Operation attempted on a disposed session
    #[error("session disposed: {0}")]
    SessionDisposed(String),

    /// A message that requires a document was missing one
    #[error("message has no document")]
    MissingDocument,

    /// An RPC call did not complete within its deadline
    #[error("rpc call timed out after {0:?}")]
    RpcTimeout(std::time::Duration),

    /// An RPC call ended with an error response
    #[error("rpc error {status_code}: {details}")]
    Rpc {
        /// Status code from the response
        status_code: u64,
        /// Detail string from the response
        details: String,
    },
}

/// Result alias for hub operations
pub type Result<T> = std::result::Result<T, HubError>;
