//! Error taxonomy for the connection core

use std::path::PathBuf;
use std::time::Duration;

use crate::lifecycle::{LifecycleState, Transition};
use crate::transport::TransportError;

/// Errors raised while loading schemas, negotiating credentials,
/// connecting, or driving the service lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum NodeLinkError {
    #[error("No schema descriptor found in {}: {reason}", dir.display())]
    SchemaNotFound { dir: PathBuf, reason: String },

    #[error("Invalid schema descriptor {}: {reason}", path.display())]
    Schema { path: PathBuf, reason: String },

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Connection to {host} failed: {source}")]
    Connection {
        host: String,
        #[source]
        source: TransportError,
    },

    #[error("Cannot {transition} while {state}")]
    InvalidTransition {
        transition: Transition,
        state: LifecycleState,
    },

    #[error("{0} interrupted before it completed")]
    Interrupted(Transition),

    #[error("Subscription already registered: {0}")]
    DuplicateSubscription(String),

    #[error("Method {method} is not a {expected} method of {service}")]
    UnknownMethod {
        service: String,
        method: String,
        expected: &'static str,
    },

    #[error("Call to {method} failed: {status}")]
    Rpc {
        method: String,
        status: tonic::Status,
    },

    #[error("Config error: {0}")]
    Config(String),
}

impl NodeLinkError {
    /// Whether this error ended a connect attempt by exceeding a deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T, E = NodeLinkError> = std::result::Result<T, E>;
