//! Network seam
//!
//! A [`Transport`] opens channels to a node; an [`RpcChannel`] probes for
//! readiness and carries calls with opaque byte payloads. The production
//! implementation is [`grpc::GrpcTransport`] (tonic over TLS).

pub mod grpc;

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tonic::{Request, Status};

use crate::credentials::TransportCredentials;

pub use grpc::GrpcTransport;

/// Errors from the transport layer
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid endpoint {0}")]
    InvalidEndpoint(String),

    #[error(transparent)]
    Tonic(#[from] tonic::transport::Error),

    #[error("Channel closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// Messages of a streaming call
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send>>;

/// An open server-streaming call.
///
/// Yields messages until the call ends: `None` on a clean end of stream,
/// `Some(Err(status))` for a terminal status. After [`cancel`] the stream
/// keeps being polled until it reports the terminal status, which is a
/// `Cancelled` status once the cancellation is confirmed.
///
/// [`cancel`]: StreamingCall::cancel
pub struct StreamingCall {
    messages: MessageStream,
    canceller: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamingCall {
    pub fn new(messages: MessageStream, canceller: impl FnOnce() + Send + 'static) -> Self {
        Self {
            messages,
            canceller: Some(Box::new(canceller)),
        }
    }

    /// Request cancellation; only the first call has an effect
    pub fn cancel(&mut self) {
        if let Some(canceller) = self.canceller.take() {
            canceller();
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.canceller.is_none()
    }
}

impl Stream for StreamingCall {
    type Item = Result<Bytes, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.messages.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for StreamingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingCall")
            .field("cancel_requested", &self.is_cancel_requested())
            .finish()
    }
}

/// A channel to one node
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Wait until the channel can carry calls
    async fn ready(&self) -> Result<(), TransportError>;

    async fn unary(&self, path: &str, request: Request<Bytes>) -> Result<Bytes, Status>;

    async fn server_streaming(
        &self,
        path: &str,
        request: Request<Bytes>,
    ) -> Result<StreamingCall, Status>;

    /// Release the channel's network resources
    async fn close(&self);
}

/// Opens channels
pub trait Transport: Send + Sync + 'static {
    /// Instantiate a channel to `host`; no I/O happens until [`RpcChannel::ready`]
    fn open(
        &self,
        host: &str,
        credentials: &TransportCredentials,
    ) -> Result<Box<dyn RpcChannel>, TransportError>;
}
