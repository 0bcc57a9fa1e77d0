//! Lifecycle states and the transition table

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{NodeLinkError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LifecycleState {
    /// Disconnected and free to connect (initial)
    Ready = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnecting,
            _ => Self::Ready,
        }
    }

    /// Whether a transition is in flight
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = NodeLinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ready" => Ok(Self::Ready),
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            "disconnecting" => Ok(Self::Disconnecting),
            other => Err(NodeLinkError::Config(format!("unknown state {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Connect,
    Disconnect,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transition {
    type Err = NodeLinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "connect" => Ok(Self::Connect),
            "disconnect" => Ok(Self::Disconnect),
            other => Err(NodeLinkError::Config(format!("unknown transition {:?}", other))),
        }
    }
}

/// Side effect run while a transition is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Build credentials and a ready client handle
    Establish,
    /// Start the settle timer that registers streams
    ScheduleRegistration,
    /// Abort the settle timer and cancel every subscription
    CancelSubscriptions,
    /// Close the client handle
    ReleaseClient,
}

/// A planned transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub transition: Transition,
    pub from: LifecycleState,
    /// State held while effects run
    pub pending: LifecycleState,
    pub on_success: LifecycleState,
    pub on_failure: LifecycleState,
    /// Effects that must complete before the transition does
    pub before: &'static [Effect],
    /// Effects started once the new state is in place
    pub after: &'static [Effect],
}

/// Plan `transition` from `state`, or reject it
pub fn plan(state: LifecycleState, transition: Transition) -> Result<Step> {
    match (state, transition) {
        (LifecycleState::Ready, Transition::Connect) => Ok(Step {
            transition,
            from: state,
            pending: LifecycleState::Connecting,
            on_success: LifecycleState::Connected,
            on_failure: LifecycleState::Ready,
            before: &[Effect::Establish],
            after: &[Effect::ScheduleRegistration],
        }),
        // Teardown is best effort: it always ends disconnected
        (LifecycleState::Connected, Transition::Disconnect) => Ok(Step {
            transition,
            from: state,
            pending: LifecycleState::Disconnecting,
            on_success: LifecycleState::Ready,
            on_failure: LifecycleState::Ready,
            before: &[Effect::CancelSubscriptions, Effect::ReleaseClient],
            after: &[],
        }),
        _ => Err(NodeLinkError::InvalidTransition { transition, state }),
    }
}
