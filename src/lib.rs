//! nodelink: lifecycle manager for a gRPC client to a long-lived node
//!
//! A [`NodeService`] connects to one node, authenticates with its TLS
//! certificate and an optional secret token, opens named streams once the
//! connection has settled, and tears them down with confirmed cancellation
//! on disconnect.

pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod schema;
pub mod streams;
pub mod subscription;
pub mod transport;

pub use config::{Config, ServiceConfig, TimingConfig};
pub use error::{NodeLinkError, Result};
pub use events::ServiceEvent;
pub use lifecycle::{LifecycleState, NoStreams, NodeService, StreamRegistrar, Transition};
pub use streams::ConfiguredStreams;
pub use subscription::SubscriptionRegistry;
pub use transport::{GrpcTransport, Transport};
