//! RPC method registry, payload codec hooks, and client-side correlation.
//!
//! Methods are registered by name with an optional request handler, an
//! optional stream handler, and per-direction payload codec hooks. A hook
//! returning `None` means "not handled": the opaque length-prefixed payload
//! is used as-is, preserving forward compatibility.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::mpsc;

use weft_proto::Message;

use crate::error::HubError;

/// An RPC failure carried inside a response frame
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("rpc error {status_code}: {details}")]
pub struct RpcError {
    /// Numeric status code
    pub status_code: u64,
    /// Human-readable details
    pub details: String,
    /// Optional structured payload
    pub payload: Option<Vec<u8>>,
}

impl RpcError {
    /// Unknown method: status 501
    #[must_use]
    pub fn unknown_method(method: &str) -> Self {
        Self {
            status_code: 501,
            details: format!("method not implemented: {method}"),
            payload: None,
        }
    }

    /// Uncaught handler failure: status 500
    #[must_use]
    pub fn internal(details: impl Into<String>) -> Self {
        Self {
            status_code: 500,
            details: details.into(),
            payload: None,
        }
    }
}

/// Decoded request handed to a handler
#[derive(Debug, Clone)]
pub struct RpcRequest {
    /// Method name from the frame
    pub method: String,
    /// Derived id of the request message, used to correlate the response
    pub request_id: String,
    /// Request payload after the decode hook (or the opaque bytes)
    pub payload: Vec<u8>,
}

/// Enriched invocation context
#[derive(Debug, Clone)]
pub struct RpcContext {
    /// Raw document name the request arrived on
    pub document: String,
    /// Namespaced document id
    pub document_id: String,
    /// This node's id
    pub node_id: String,
    /// Requesting client, when the request came from a connection
    pub client_id: Option<String>,
    /// Authenticated user, when known
    pub user_id: Option<String>,
}

/// Successful handler outcome
pub struct RpcReply {
    /// Final response payload
    pub payload: Vec<u8>,
    /// Items to send as `stream` frames before the response
    pub stream: Option<BoxStream<'static, Vec<u8>>>,
}

impl RpcReply {
    /// A plain payload reply
    #[must_use]
    pub fn payload(payload: Vec<u8>) -> Self {
        Self {
            payload,
            stream: None,
        }
    }

    /// A streaming reply followed by a final payload
    #[must_use]
    pub fn streaming(stream: BoxStream<'static, Vec<u8>>, payload: Vec<u8>) -> Self {
        Self {
            payload,
            stream: Some(stream),
        }
    }
}

impl std::fmt::Debug for RpcReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcReply")
            .field("payload_len", &self.payload.len())
            .field("streaming", &self.stream.is_some())
            .finish()
    }
}

/// Request handler: consumes a request, produces a reply or an error
pub type RpcHandler = Arc<
    dyn Fn(RpcRequest, RpcContext) -> BoxFuture<'static, Result<RpcReply, RpcError>>
        + Send
        + Sync,
>;

/// Async callback a stream handler uses to push items to the peer
pub type StreamSend =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<(), HubError>> + Send + Sync>;

/// Handler for inbound `requestType=stream` frames
pub type StreamHandler = Arc<
    dyn Fn(RpcRequest, RpcContext, StreamSend) -> BoxFuture<'static, Result<(), RpcError>>
        + Send
        + Sync,
>;

/// A payload codec hook; `None` means "fall back to the opaque payload"
pub type PayloadHook = Arc<dyn Fn(&Message, &[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Optional per-direction payload codec hooks for one method
#[derive(Clone, Default)]
pub struct MethodCodec {
    /// Applied to response payloads before framing
    pub encode_response: Option<PayloadHook>,
    /// Applied to stream item payloads before framing
    pub encode_stream: Option<PayloadHook>,
    /// Applied to request payloads after decoding
    pub decode_request: Option<PayloadHook>,
    /// Applied to stream item payloads after decoding
    pub decode_stream: Option<PayloadHook>,
    /// Applied to response payloads after decoding
    pub decode_response: Option<PayloadHook>,
}

impl MethodCodec {
    fn apply(hook: Option<&PayloadHook>, message: &Message, bytes: &[u8]) -> Vec<u8> {
        hook.and_then(|h| h(message, bytes))
            .unwrap_or_else(|| bytes.to_vec())
    }

    /// Encode a response payload, falling back to the raw bytes
    #[must_use]
    pub fn encode_response(&self, message: &Message, bytes: &[u8]) -> Vec<u8> {
        Self::apply(self.encode_response.as_ref(), message, bytes)
    }

    /// Encode a stream item payload, falling back to the raw bytes
    #[must_use]
    pub fn encode_stream(&self, message: &Message, bytes: &[u8]) -> Vec<u8> {
        Self::apply(self.encode_stream.as_ref(), message, bytes)
    }

    /// Decode a request payload, falling back to the raw bytes
    #[must_use]
    pub fn decode_request(&self, message: &Message, bytes: &[u8]) -> Vec<u8> {
        Self::apply(self.decode_request.as_ref(), message, bytes)
    }

    /// Decode a stream item payload, falling back to the raw bytes
    #[must_use]
    pub fn decode_stream(&self, message: &Message, bytes: &[u8]) -> Vec<u8> {
        Self::apply(self.decode_stream.as_ref(), message, bytes)
    }

    /// Decode a response payload, falling back to the raw bytes
    #[must_use]
    pub fn decode_response(&self, message: &Message, bytes: &[u8]) -> Vec<u8> {
        Self::apply(self.decode_response.as_ref(), message, bytes)
    }
}

impl std::fmt::Debug for MethodCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodCodec").finish_non_exhaustive()
    }
}

/// One registered method
#[derive(Clone, Default)]
pub struct RpcMethod {
    /// Request handler
    pub handler: Option<RpcHandler>,
    /// Inbound stream handler
    pub stream_handler: Option<StreamHandler>,
    /// Payload codec hooks
    pub codec: MethodCodec,
}

impl std::fmt::Debug for RpcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcMethod")
            .field("has_handler", &self.handler.is_some())
            .field("has_stream_handler", &self.stream_handler.is_some())
            .finish()
    }
}

/// Method registry shared by every session of a hub
#[derive(Debug, Default)]
pub struct RpcRegistry {
    methods: DashMap<String, RpcMethod>,
}

impl RpcRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method definition, replacing any existing one
    pub fn register(&self, name: impl Into<String>, method: RpcMethod) {
        self.methods.insert(name.into(), method);
    }

    /// Register a plain request handler
    pub fn register_handler(&self, name: impl Into<String>, handler: RpcHandler) {
        self.register(
            name,
            RpcMethod {
                handler: Some(handler),
                ..RpcMethod::default()
            },
        );
    }

    /// Look up a method definition
    #[must_use]
    pub fn get(&self, name: &str) -> Option<RpcMethod> {
        self.methods.get(name).map(|m| m.clone())
    }

    /// Registered method names
    #[must_use]
    pub fn method_names(&self) -> Vec<String> {
        self.methods.iter().map(|e| e.key().clone()).collect()
    }
}

/// Event routed to a pending RPC call
#[derive(Debug, Clone)]
pub enum RpcEvent {
    /// One streamed item (after the decode hook)
    Stream(Vec<u8>),
    /// Terminal outcome
    Response(Result<Vec<u8>, RpcError>),
}

/// Pending outbound calls, keyed by the request message id.
///
/// Responses correlate on `original_request_id`; a `Response` event removes
/// the waiter.
#[derive(Debug, Default)]
pub struct RpcWaiters {
    waiting: DashMap<String, mpsc::Sender<RpcEvent>>,
}

/// Per-call event buffer
const WAITER_BUFFER: usize = 64;

impl RpcWaiters {
    /// Empty waiter table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call and receive its event stream
    #[must_use]
    pub fn register(&self, request_id: impl Into<String>) -> mpsc::Receiver<RpcEvent> {
        let (tx, rx) = mpsc::channel(WAITER_BUFFER);
        self.waiting.insert(request_id.into(), tx);
        rx
    }

    /// Drop a pending call without resolving it
    pub fn forget(&self, request_id: &str) {
        self.waiting.remove(request_id);
    }

    /// Route an event to the pending call, if any
    ///
    /// Returns `true` when a waiter consumed the event. A terminal
    /// `Response` removes the waiter.
    pub async fn notify(&self, request_id: &str, event: RpcEvent) -> bool {
        let terminal = matches!(event, RpcEvent::Response(_));
        let Some(tx) = self.waiting.get(request_id).map(|e| e.clone()) else {
            return false;
        };
        let delivered = tx.send(event).await.is_ok();
        if terminal {
            self.waiting.remove(request_id);
        }
        delivered
    }

    /// Number of calls still pending
    #[must_use]
    pub fn pending(&self) -> usize {
        self.waiting.len()
    }
}
