//! tonic transport over TLS
//!
//! Calls are issued through `tonic::client::Grpc` with a pass-through
//! codec, so payloads stay opaque protobuf bytes.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes};
use tokio::sync::{oneshot, Mutex};
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};
use tracing::{debug, info};

use super::{RpcChannel, StreamingCall, Transport, TransportError};
use crate::credentials::TransportCredentials;

/// Codec that moves message bodies as raw bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawCodec;
    type Decoder = RawCodec;

    fn encoder(&mut self) -> Self::Encoder {
        RawCodec
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawCodec
    }
}

impl Encoder for RawCodec {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put(item);
        Ok(())
    }
}

impl Decoder for RawCodec {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

/// Production transport: tonic channels secured with the node's certificate
#[derive(Debug, Clone, Default)]
pub struct GrpcTransport;

impl GrpcTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for GrpcTransport {
    fn open(
        &self,
        host: &str,
        credentials: &TransportCredentials,
    ) -> Result<Box<dyn RpcChannel>, TransportError> {
        let uri = if host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{}", host.trim_start_matches("http://"))
        };

        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", uri, e)))?
            .tls_config(credentials.tls_config())?;

        debug!(uri = %uri, "Opened gRPC endpoint");

        Ok(Box::new(GrpcChannel {
            uri,
            endpoint,
            channel: Mutex::new(None),
        }))
    }
}

/// A tonic channel, connected by [`RpcChannel::ready`]
pub struct GrpcChannel {
    uri: String,
    endpoint: Endpoint,
    channel: Mutex<Option<Channel>>,
}

impl GrpcChannel {
    async fn grpc(&self) -> Result<tonic::client::Grpc<Channel>, Status> {
        let channel = self
            .channel
            .lock()
            .await
            .clone()
            .ok_or_else(|| Status::unavailable(format!("channel to {} is not connected", self.uri)))?;

        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("service not ready: {}", e)))?;
        Ok(grpc)
    }
}

fn path_and_query(path: &str) -> Result<PathAndQuery, Status> {
    PathAndQuery::try_from(path)
        .map_err(|e| Status::invalid_argument(format!("invalid method path {}: {}", path, e)))
}

#[async_trait]
impl RpcChannel for GrpcChannel {
    async fn ready(&self) -> Result<(), TransportError> {
        let channel = self.endpoint.connect().await?;
        *self.channel.lock().await = Some(channel);
        info!(uri = %self.uri, "gRPC channel ready");
        Ok(())
    }

    async fn unary(&self, path: &str, request: Request<Bytes>) -> Result<Bytes, Status> {
        let path = path_and_query(path)?;
        let mut grpc = self.grpc().await?;
        let response = grpc.unary(request, path, RawCodec).await?;
        Ok(response.into_inner())
    }

    async fn server_streaming(
        &self,
        path: &str,
        request: Request<Bytes>,
    ) -> Result<StreamingCall, Status> {
        let path = path_and_query(path)?;
        let mut grpc = self.grpc().await?;
        let inner = grpc.server_streaming(request, path, RawCodec).await?.into_inner();

        // Dropping the tonic stream resets the HTTP/2 stream; the reset is
        // reported back to the reader as a Cancelled status.
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let messages = futures::stream::unfold(Some((inner, cancel_rx)), |state| async move {
            let (mut inner, mut cancel_rx) = state?;
            tokio::select! {
                _ = &mut cancel_rx => {
                    drop(inner);
                    Some((Err(Status::cancelled("Cancelled on client")), None))
                }
                message = inner.message() => match message {
                    Ok(Some(message)) => Some((Ok(message), Some((inner, cancel_rx)))),
                    Ok(None) => None,
                    Err(status) => Some((Err(status), None)),
                },
            }
        });

        Ok(StreamingCall::new(Box::pin(messages), move || {
            let _ = cancel_tx.send(());
        }))
    }

    async fn close(&self) {
        if self.channel.lock().await.take().is_some() {
            debug!(uri = %self.uri, "gRPC channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_and_query_validation() {
        assert!(path_and_query("/lnrpc.Lightning/GetInfo").is_ok());
        assert!(path_and_query("not a path").is_err());
    }

    #[tokio::test]
    async fn test_unconnected_channel_rejects_calls() {
        let channel = GrpcChannel {
            uri: "https://127.0.0.1:10009".to_string(),
            endpoint: Endpoint::from_static("https://127.0.0.1:10009"),
            channel: Mutex::new(None),
        };

        let status = channel
            .unary("/lnrpc.Lightning/GetInfo", Request::new(Bytes::new()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }
}
