//! Connection establisher
//!
//! Turns a [`ServiceConfig`] into a ready [`ClientHandle`]:
//! 1. resolve the schema version and service factory
//! 2. build transport credentials from the certificate
//! 3. optionally wait for, then stack, the secret-token call credential
//! 4. open a channel to the node
//! 5. probe readiness under a deadline, closing the channel on failure

use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tonic::Request;
use tracing::{debug, info, warn};

use crate::config::{ServiceConfig, TimingConfig};
use crate::credentials::{self, CallCredential, CredentialSet, TransportCredentials};
use crate::error::{NodeLinkError, Result};
use crate::schema::{ClientFactory, InterfaceLoader, MethodKind, SchemaVersion};
use crate::transport::{RpcChannel, StreamingCall, Transport};

/// Options for one connection attempt
#[derive(Debug, Clone, Default)]
pub struct EstablishOptions {
    /// Schema version to use instead of the latest
    pub version: Option<SchemaVersion>,
    pub use_secret_token: bool,
    pub wait_for_secret_token: bool,
}

/// Cloneable view of a ready connection, handed to stream registrars
#[derive(Clone)]
pub struct ServiceClient {
    factory: Arc<ClientFactory>,
    channel: Arc<dyn RpcChannel>,
    call_credential: Option<CallCredential>,
}

impl ServiceClient {
    pub fn factory(&self) -> &ClientFactory {
        &self.factory
    }

    fn request(&self, message: Bytes) -> Request<Bytes> {
        let mut request = Request::new(message);
        if let Some(credential) = &self.call_credential {
            credential.apply(&mut request);
        }
        request
    }

    /// Issue a unary call
    pub async fn unary(&self, method: &str, message: Bytes) -> Result<Bytes> {
        let path = self.factory.path(method, MethodKind::Unary)?;
        self.channel
            .unary(&path, self.request(message))
            .await
            .map_err(|status| NodeLinkError::Rpc {
                method: method.to_string(),
                status,
            })
    }

    /// Open a server-streaming call
    pub async fn server_streaming(&self, method: &str, message: Bytes) -> Result<StreamingCall> {
        let path = self.factory.path(method, MethodKind::ServerStreaming)?;
        debug!(method = %method, "Opening stream");
        self.channel
            .server_streaming(&path, self.request(message))
            .await
            .map_err(|status| NodeLinkError::Rpc {
                method: method.to_string(),
                status,
            })
    }
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("service", &self.factory.service_name())
            .field("version", &self.factory.version().to_string())
            .field("call_credential", &self.call_credential)
            .finish()
    }
}

/// Task aborted when dropped
#[derive(Debug)]
pub struct ScopedTask(JoinHandle<()>);

impl ScopedTask {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self(handle)
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for ScopedTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A ready connection to one node
#[derive(Debug)]
pub struct ClientHandle {
    host: String,
    client: ServiceClient,
    settle: Option<ScopedTask>,
}

impl ClientHandle {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn version(&self) -> &SchemaVersion {
        self.client.factory.version()
    }

    pub fn client(&self) -> ServiceClient {
        self.client.clone()
    }

    /// Tie a task to this connection's lifetime
    pub fn attach(&mut self, task: ScopedTask) {
        self.settle = Some(task);
    }

    /// Abort the attached task, if any
    pub fn detach(&mut self) {
        self.settle.take();
    }

    /// Abort attached work and release the channel
    pub async fn close(mut self) {
        self.detach();
        self.client.channel.close().await;
        debug!(host = %self.host, "Client handle closed");
    }
}

/// Establish a ready connection
pub async fn establish(
    config: &ServiceConfig,
    options: &EstablishOptions,
    timing: &TimingConfig,
    transport: &dyn Transport,
) -> Result<ClientHandle> {
    // 1. Schema
    let loader = InterfaceLoader::new(&config.schema_dir);
    let factory = loader.load(options.version.as_ref(), &config.rpc_service)?;
    debug!(
        service = %config.id,
        version = %factory.version(),
        rpc_service = %factory.service_name(),
        "Resolved schema"
    );

    // 2. Transport security
    let tls = TransportCredentials::from_source(&config.cert, config.tls_domain.as_deref())?;

    // 3. Call credential
    let call = if options.use_secret_token {
        if options.wait_for_secret_token {
            credentials::wait_for_secret(
                &config.secret_path,
                timing.secret_wait(),
                timing.secret_poll(),
            )
            .await?;
        }
        Some(CallCredential::from_file(&config.secret_path, &config.secret_header)?)
    } else {
        None
    };
    let credentials = CredentialSet::combine(tls, call);

    // 4. Channel
    let channel: Arc<dyn RpcChannel> = Arc::from(
        transport
            .open(&config.host, &credentials.transport)
            .map_err(|source| NodeLinkError::Connection {
                host: config.host.clone(),
                source,
            })?,
    );

    // 5. Readiness probe
    let deadline = timing.ready_deadline();
    match tokio::time::timeout(deadline, channel.ready()).await {
        Ok(Ok(())) => {}
        Ok(Err(source)) => {
            warn!(service = %config.id, host = %config.host, error = %source, "Readiness probe failed");
            channel.close().await;
            return Err(NodeLinkError::Connection {
                host: config.host.clone(),
                source,
            });
        }
        Err(_) => {
            warn!(service = %config.id, host = %config.host, ?deadline, "Readiness probe timed out");
            channel.close().await;
            return Err(NodeLinkError::Timeout {
                operation: "readiness probe",
                after: deadline,
            });
        }
    }

    info!(
        service = %config.id,
        host = %config.host,
        version = %factory.version(),
        secret_token = credentials.call.is_some(),
        "Connection established"
    );

    Ok(ClientHandle {
        host: config.host.clone(),
        client: ServiceClient {
            factory: Arc::new(factory),
            channel,
            call_credential: credentials.call,
        },
        settle: None,
    })
}
