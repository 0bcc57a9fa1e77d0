//! In-memory transport and fixtures shared by the integration tests

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tonic::{Request, Status};

use nodelink::config::{CertSource, Environment, ServiceConfig, StreamConfig, TimingConfig};
use nodelink::credentials::TransportCredentials;
use nodelink::transport::{RpcChannel, StreamingCall, Transport, TransportError};

pub const DESCRIPTOR: &str = r#"{
    "package": "lnrpc",
    "services": [{
        "name": "Lightning",
        "methods": [
            { "name": "GetInfo", "kind": "unary" },
            { "name": "SubscribeInvoices", "kind": "server_streaming" },
            { "name": "SubscribeTransactions", "kind": "server_streaming" }
        ]
    }]
}"#;

/// How a fake channel answers the readiness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Refused,
    Hang,
}

/// A call seen by a fake channel
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub path: String,
    /// Value of the `macaroon` header, if sent
    pub secret: Option<String>,
}

/// Test-side control over one open stream
#[derive(Clone)]
pub struct StreamControl {
    pub path: String,
    pub tx: mpsc::UnboundedSender<Result<Bytes, Status>>,
    pub cancels: Arc<AtomicUsize>,
}

impl StreamControl {
    pub fn send(&self, message: &'static [u8]) {
        let _ = self.tx.send(Ok(Bytes::from_static(message)));
    }

    /// End the stream without an error
    pub fn end(&self) {
        let _ = self.tx.send(Err(Status::ok("")));
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeState {
    opened: AtomicUsize,
    closed: AtomicUsize,
    readiness: Mutex<Option<Readiness>>,
    /// Confirm cancellations as soon as they are requested
    confirm_cancels: AtomicBool,
    calls: Mutex<Vec<RecordedCall>>,
    streams: Mutex<Vec<StreamControl>>,
    /// Log of channel and stream events, in order
    log: Mutex<Vec<String>>,
}

/// Transport that never touches the network
#[derive(Clone)]
pub struct FakeTransport {
    state: Arc<FakeState>,
}

impl FakeTransport {
    pub fn new(readiness: Readiness) -> Self {
        let state = FakeState::default();
        *state.readiness.lock().unwrap() = Some(readiness);
        state.confirm_cancels.store(true, Ordering::SeqCst);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn set_readiness(&self, readiness: Readiness) {
        *self.state.readiness.lock().unwrap() = Some(readiness);
    }

    /// Hold cancelled streams open until the test ends them
    pub fn hold_cancels(&self) {
        self.state.confirm_cancels.store(false, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn streams(&self) -> Vec<StreamControl> {
        self.state.streams.lock().unwrap().clone()
    }

    pub fn log(&self) -> Vec<String> {
        self.state.log.lock().unwrap().clone()
    }
}

impl Transport for FakeTransport {
    fn open(
        &self,
        host: &str,
        _credentials: &TransportCredentials,
    ) -> Result<Box<dyn RpcChannel>, TransportError> {
        if host.is_empty() {
            return Err(TransportError::InvalidEndpoint(host.to_string()));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        self.state.log.lock().unwrap().push("open".to_string());
        Ok(Box::new(FakeChannel {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeChannel {
    state: Arc<FakeState>,
    closed: AtomicBool,
}

impl FakeChannel {
    fn record<T>(&self, path: &str, request: &Request<T>) {
        let secret = request
            .metadata()
            .get("macaroon")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.state.calls.lock().unwrap().push(RecordedCall {
            path: path.to_string(),
            secret,
        });
    }
}

#[async_trait]
impl RpcChannel for FakeChannel {
    async fn ready(&self) -> Result<(), TransportError> {
        let readiness = self.state.readiness.lock().unwrap().unwrap_or(Readiness::Ready);
        match readiness {
            Readiness::Ready => Ok(()),
            Readiness::Refused => Err(TransportError::Other("connection refused".to_string())),
            Readiness::Hang => futures::future::pending().await,
        }
    }

    async fn unary(&self, path: &str, request: Request<Bytes>) -> Result<Bytes, Status> {
        self.record(path, &request);
        Ok(Bytes::new())
    }

    async fn server_streaming(
        &self,
        path: &str,
        request: Request<Bytes>,
    ) -> Result<StreamingCall, Status> {
        self.record(path, &request);

        let (tx, rx) = mpsc::unbounded_channel::<Result<Bytes, Status>>();
        let cancels = Arc::new(AtomicUsize::new(0));
        let control = StreamControl {
            path: path.to_string(),
            tx: tx.clone(),
            cancels: cancels.clone(),
        };
        self.state.streams.lock().unwrap().push(control);

        // An `Ok` status stands in for a clean end of stream
        let messages = futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Some(Err(status)) if status.code() == tonic::Code::Ok => None,
                Some(item) => Some((item, rx)),
                None => None,
            }
        });

        let state = self.state.clone();
        let name = path.to_string();
        let canceller = move || {
            cancels.fetch_add(1, Ordering::SeqCst);
            state.log.lock().unwrap().push(format!("cancel {}", name));
            if state.confirm_cancels.load(Ordering::SeqCst) {
                let _ = tx.send(Err(Status::cancelled("Cancelled on client")));
            }
        };

        Ok(StreamingCall::new(Box::pin(messages), canceller))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closed.fetch_add(1, Ordering::SeqCst);
            self.state.log.lock().unwrap().push("close".to_string());
        }
    }
}

/// Files a service needs on disk
pub struct Fixture {
    pub dir: TempDir,
    pub config: ServiceConfig,
}

impl Fixture {
    pub fn new(id: &str, environment: Environment) -> Self {
        let dir = TempDir::new().unwrap();
        let schema_dir = dir.path().join("schemas");
        std::fs::create_dir(&schema_dir).unwrap();
        std::fs::write(schema_dir.join("lightning-v0.17.0.json"), DESCRIPTOR).unwrap();

        let config = ServiceConfig {
            id: id.to_string(),
            host: "127.0.0.1:10009".to_string(),
            cert: CertSource::Path(cert_path()),
            secret_path: dir.path().join("admin.macaroon"),
            schema_dir,
            environment,
            rpc_service: "lnrpc.Lightning".to_string(),
            schema_version: None,
            tls_domain: None,
            secret_header: "macaroon".to_string(),
            streams: Vec::new(),
        };
        Self { dir, config }
    }

    pub fn write_secret(&self, secret: &[u8]) {
        std::fs::write(&self.config.secret_path, secret).unwrap();
    }

    pub fn with_stream(mut self, name: &str, method: &str) -> Self {
        self.config.streams.push(StreamConfig {
            name: name.to_string(),
            method: method.to_string(),
            request_hex: String::new(),
        });
        self
    }
}

pub fn cert_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/tls.cert")
}

/// Timing with the shipped defaults
pub fn timing() -> TimingConfig {
    TimingConfig::default()
}
