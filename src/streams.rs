//! Stream registrar driven by `[[service.streams]]`

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::connection::ServiceClient;
use crate::error::{NodeLinkError, Result};
use crate::lifecycle::StreamRegistrar;
use crate::subscription::SubscriptionRegistry;

/// Opens the streams listed in a service's configuration and logs what
/// they deliver
#[derive(Debug, Clone, Default)]
pub struct ConfiguredStreams {
    streams: Vec<StreamConfig>,
}

impl ConfiguredStreams {
    pub fn new(streams: Vec<StreamConfig>) -> Self {
        Self { streams }
    }

    pub fn streams(&self) -> &[StreamConfig] {
        &self.streams
    }
}

fn request_body(stream: &StreamConfig) -> Result<Bytes> {
    hex::decode(stream.request_hex.trim())
        .map(Bytes::from)
        .map_err(|e| {
            NodeLinkError::Config(format!("stream {}: invalid request_hex: {}", stream.name, e))
        })
}

async fn open(
    stream: &StreamConfig,
    client: &ServiceClient,
    registry: &SubscriptionRegistry,
) -> Result<()> {
    let body = request_body(stream)?;
    let call = client.server_streaming(&stream.method, body).await?;
    registry
        .register(&stream.name, call, |subscription: &str, message: Bytes| {
            debug!(subscription = %subscription, bytes = message.len(), "Stream message");
        })
        .await?;
    info!(subscription = %stream.name, method = %stream.method, "Subscribed");
    Ok(())
}

/// Registration is all or nothing: if one stream cannot be opened, the ones
/// already opened are cancelled before the error is returned.
#[async_trait]
impl StreamRegistrar for ConfiguredStreams {
    async fn register_streams(
        &self,
        client: &ServiceClient,
        registry: &SubscriptionRegistry,
    ) -> Result<()> {
        for (i, stream) in self.streams.iter().enumerate() {
            if let Err(e) = open(stream, client, registry).await {
                warn!(subscription = %stream.name, error = %e, "Cancelling streams opened so far");
                for opened in &self.streams[..i] {
                    registry.cancel_one(&opened.name).await;
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(request_hex: &str) -> StreamConfig {
        StreamConfig {
            name: "invoices".to_string(),
            method: "SubscribeInvoices".to_string(),
            request_hex: request_hex.to_string(),
        }
    }

    #[test]
    fn test_empty_request_is_default_message() {
        assert!(request_body(&stream("")).unwrap().is_empty());
    }

    #[test]
    fn test_request_hex_decodes() {
        assert_eq!(request_body(&stream("0801")).unwrap(), Bytes::from_static(&[8, 1]));
    }

    #[test]
    fn test_bad_request_hex_is_config_error() {
        let err = request_body(&stream("zz")).unwrap_err();
        assert!(matches!(err, NodeLinkError::Config(_)));
        assert!(err.to_string().contains("invoices"));
    }
}
