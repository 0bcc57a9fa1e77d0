//! Service lifecycle state machine
//!
//! A [`NodeService`] owns one node connection and cycles between `ready`
//! and `connected`:
//!
//! ```text
//!   ready ──connect──▶ connecting ──ok──▶ connected
//!     ▲                    │ err              │
//!     └────────────────────┘                  │
//!     ▲                                       │
//!     └──── disconnecting ◀──disconnect───────┘
//! ```
//!
//! Transitions are planned by [`state::plan`] and claimed atomically, so a
//! request that arrives while another transition is in flight is rejected
//! rather than queued.

pub mod state;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::config::{ServiceConfig, TimingConfig};
use crate::connection::{self, ClientHandle, EstablishOptions, ScopedTask, ServiceClient};
use crate::error::{NodeLinkError, Result};
use crate::events::{EventBus, ServiceEvent};
use crate::schema::SchemaVersion;
use crate::subscription::SubscriptionRegistry;
use crate::transport::Transport;

pub use state::{Effect, LifecycleState, Step, Transition};

/// Opens the named streams of a concrete service once it is connected
#[async_trait]
pub trait StreamRegistrar: Send + Sync + 'static {
    async fn register_streams(
        &self,
        client: &ServiceClient,
        registry: &SubscriptionRegistry,
    ) -> Result<()>;
}

/// Registrar for services that open no streams
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStreams;

#[async_trait]
impl StreamRegistrar for NoStreams {
    async fn register_streams(&self, _: &ServiceClient, _: &SubscriptionRegistry) -> Result<()> {
        Ok(())
    }
}

struct Inner<R> {
    config: ServiceConfig,
    timing: TimingConfig,
    transport: Arc<dyn Transport>,
    registrar: R,
    state: AtomicU8,
    handle: Mutex<Option<ClientHandle>>,
    registry: SubscriptionRegistry,
    events: EventBus,
}

impl<R> Inner<R> {
    fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Lifecycle manager for one node endpoint
pub struct NodeService<R: StreamRegistrar = NoStreams> {
    inner: Arc<Inner<R>>,
}

impl<R: StreamRegistrar> Clone for NodeService<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: StreamRegistrar> NodeService<R> {
    pub fn new(
        config: ServiceConfig,
        timing: TimingConfig,
        transport: Arc<dyn Transport>,
        registrar: R,
    ) -> Self {
        let events = EventBus::new(config.id.clone());
        let registry = SubscriptionRegistry::new(events.clone());

        Self {
            inner: Arc::new(Inner {
                config,
                timing,
                transport,
                registrar,
                state: AtomicU8::new(LifecycleState::Ready as u8),
                handle: Mutex::new(None),
                registry,
                events,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state()
    }

    pub fn is_in_state(&self, state: LifecycleState) -> bool {
        self.state() == state
    }

    /// Whether `transition` is allowed from the current state
    pub fn can(&self, transition: Transition) -> bool {
        state::plan(self.state(), transition).is_ok()
    }

    /// [`is_in_state`](Self::is_in_state) by state name; unknown names are false
    pub fn is(&self, name: &str) -> bool {
        name.parse().map(|s| self.is_in_state(s)).unwrap_or(false)
    }

    /// [`can`](Self::can) by transition name; unknown names are false
    pub fn can_transition(&self, name: &str) -> bool {
        name.parse().map(|t| self.can(t)).unwrap_or(false)
    }

    /// Observe lifecycle and subscription events
    pub fn events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    /// Names of the active subscriptions
    pub async fn subscriptions(&self) -> Vec<String> {
        self.inner.registry.names().await
    }

    /// Schema version of the live connection
    pub async fn schema_version(&self) -> Option<SchemaVersion> {
        self.inner
            .handle
            .lock()
            .await
            .as_ref()
            .map(|h| h.version().clone())
    }

    /// Client for the live connection
    pub async fn client(&self) -> Option<ServiceClient> {
        self.inner.handle.lock().await.as_ref().map(ClientHandle::client)
    }

    /// `ready → connected`
    pub async fn connect(&self) -> Result<()> {
        self.apply(Transition::Connect).await
    }

    /// `connected → ready`
    pub async fn disconnect(&self) -> Result<()> {
        self.apply(Transition::Disconnect).await
    }

    /// Claim and drive one transition.
    ///
    /// Once claimed, the transition runs in its own task and always settles
    /// the state, even if the caller stops waiting for it.
    async fn apply(&self, transition: Transition) -> Result<()> {
        let step = state::plan(self.state(), transition)?;

        // Claim the transition; losing the race means another one is in flight
        if let Err(current) = self.inner.state.compare_exchange(
            step.from as u8,
            step.pending as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(NodeLinkError::InvalidTransition {
                transition,
                state: LifecycleState::from_u8(current),
            });
        }

        let service = self.clone();
        let task = tokio::spawn(async move { service.drive(step).await });

        match task.await {
            Ok(result) => result,
            Err(e) => {
                self.inner.set_state(step.on_failure);
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
                Err(NodeLinkError::Interrupted(transition))
            }
        }
    }

    async fn drive(&self, step: Step) -> Result<()> {
        let transition = step.transition;
        match transition {
            Transition::Connect => self.inner.events.connecting(),
            Transition::Disconnect => self.inner.events.disconnecting(),
        }

        for effect in step.before {
            if let Err(e) = self.run(*effect).await {
                warn!(
                    service = %self.id(),
                    transition = %transition,
                    effect = ?effect,
                    error = %e,
                    "Transition failed"
                );
                self.inner.set_state(step.on_failure);
                return Err(e);
            }
        }

        self.inner.set_state(step.on_success);
        match transition {
            Transition::Connect => self.inner.events.connected(),
            Transition::Disconnect => self.inner.events.disconnected(),
        }

        for effect in step.after {
            if let Err(e) = self.run(*effect).await {
                warn!(service = %self.id(), effect = ?effect, error = %e, "Post-transition effect failed");
            }
        }
        Ok(())
    }

    async fn run(&self, effect: Effect) -> Result<()> {
        match effect {
            Effect::Establish => {
                let settings = self.inner.config.connection_settings();
                let version = self
                    .inner
                    .config
                    .schema_version
                    .as_deref()
                    .map(str::parse::<SchemaVersion>)
                    .transpose()?;
                let options = EstablishOptions {
                    version,
                    use_secret_token: settings.use_secret_token,
                    wait_for_secret_token: settings.wait_for_secret_token,
                };
                debug!(service = %self.id(), ?settings, "Establishing connection");

                let handle = connection::establish(
                    &self.inner.config,
                    &options,
                    &self.inner.timing,
                    self.inner.transport.as_ref(),
                )
                .await?;
                *self.inner.handle.lock().await = Some(handle);
            }
            Effect::ScheduleRegistration => {
                let mut guard = self.inner.handle.lock().await;
                if let Some(handle) = guard.as_mut() {
                    let task = tokio::spawn(register_after_settle(self.inner.clone(), handle.client()));
                    handle.attach(ScopedTask::new(task));
                }
            }
            Effect::CancelSubscriptions => {
                if let Some(handle) = self.inner.handle.lock().await.as_mut() {
                    handle.detach();
                }
                self.inner.registry.cancel_all().await;
            }
            Effect::ReleaseClient => {
                let handle = self.inner.handle.lock().await.take();
                if let Some(handle) = handle {
                    handle.close().await;
                }
            }
        }
        Ok(())
    }
}

/// Wait out the settle delay, then register streams if still connected
async fn register_after_settle<R: StreamRegistrar>(inner: Arc<Inner<R>>, client: ServiceClient) {
    tokio::time::sleep(inner.timing.settle_delay()).await;

    // Checked after the delay: a disconnect during it skips registration
    if inner.state() != LifecycleState::Connected {
        debug!(service = %inner.config.id, state = %inner.state(), "Skipping stream registration");
        return;
    }

    match inner.registrar.register_streams(&client, &inner.registry).await {
        Ok(()) => {
            let subscriptions = inner.registry.len().await;
            info!(service = %inner.config.id, subscriptions, "Streams registered");
        }
        Err(e) => warn!(service = %inner.config.id, error = %e, "Stream registration failed"),
    }
}
