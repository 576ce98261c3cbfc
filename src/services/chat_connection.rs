//! Connection supervisor: one logical socket per local identity, kept alive
//! with capped exponential backoff.
//!
//! Every `connect`, `reconnect` and `close` bumps a generation counter. The
//! background task only touches state or fires callbacks while its
//! generation is current, so nothing from a superseded or closed connection
//! leaks out after the call that replaced it returns.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::chat_transport::{Connector, Link, LinkEvent, Outgoing};
use super::config::{ChatConfig, ReconnectSettings};
use crate::error::{ChatError, Result};

/// Close code used for deliberate shutdowns.
pub const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before reconnect attempt number `attempt` (1-based).
    Reconnecting { attempt: u32 },
    /// Gave up. Only an explicit `reconnect` leaves this state.
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether a connection attempt is in flight or scheduled.
    fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Reconnecting { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max)`, attempt counted from zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for ReconnectPolicy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            max_retries: settings.max_retries,
        }
    }
}

type FrameHandler = Box<dyn Fn(&str) + Send + Sync>;
type StateHandler = Box<dyn Fn(&ConnectionState) + Send + Sync>;

struct Inner {
    state: ConnectionState,
    local_id: Option<String>,
    generation: u64,
    outgoing: Option<mpsc::UnboundedSender<Outgoing>>,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    inner: Mutex<Inner>,
    frame_handlers: RwLock<Vec<FrameHandler>>,
    state_handlers: RwLock<Vec<StateHandler>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify_state(&self, state: &ConnectionState) {
        let handlers = self.state_handlers.read().unwrap_or_else(|e| e.into_inner());
        for handler in handlers.iter() {
            handler(state);
        }
    }

    /// Apply a state change if `generation` is still current. Handlers run
    /// under the lock so a concurrent `close` cannot interleave.
    fn transition(
        &self,
        generation: u64,
        state: ConnectionState,
        outgoing: Option<mpsc::UnboundedSender<Outgoing>>,
    ) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        inner.outgoing = outgoing;
        if inner.state != state {
            log::info!("Connection state: {:?} -> {:?}", inner.state, state);
            inner.state = state.clone();
            self.notify_state(&state);
        }
        true
    }

    fn dispatch_frame(&self, generation: u64, text: &str) -> bool {
        let inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        let handlers = self.frame_handlers.read().unwrap_or_else(|e| e.into_inner());
        for handler in handlers.iter() {
            handler(text);
        }
        drop(inner);
        true
    }
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    config: ChatConfig,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
}

impl ConnectionSupervisor {
    pub fn new(connector: Arc<dyn Connector>, config: &ChatConfig) -> Self {
        Self {
            connector,
            config: config.clone(),
            policy: ReconnectPolicy::from(&config.reconnect),
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    local_id: None,
                    generation: 0,
                    outgoing: None,
                    task: None,
                }),
                frame_handlers: RwLock::new(Vec::new()),
                state_handlers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Register a callback for every inbound text frame. Callbacks run on the
    /// supervisor's task and must not call back into the supervisor.
    pub fn on_frame<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.shared
            .frame_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(handler));
    }

    /// Register a callback for state changes. Same restrictions as [`Self::on_frame`].
    pub fn on_state_change<F>(&self, handler: F)
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.shared
            .state_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(handler));
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().state.is_connected()
    }

    pub fn local_id(&self) -> Option<String> {
        self.shared.lock().local_id.clone()
    }

    /// Open the connection for `local_id`. No-op while already connected or
    /// connecting for the same id; a different id replaces the current connection.
    /// Connection errors are not returned: they feed the retry schedule.
    pub fn connect(&self, local_id: &str) -> Result<()> {
        let url = self.config.websocket_url(local_id)?.to_string();
        let mut inner = self.shared.lock();
        if inner.local_id.as_deref() == Some(local_id) && inner.state.is_active() {
            log::debug!("Already connected or connecting as {}", local_id);
            return Ok(());
        }
        if inner.state.is_active() {
            log::info!(
                "Switching connection from {:?} to {}",
                inner.local_id,
                local_id
            );
            Self::shutdown_locked(&mut inner, NORMAL_CLOSURE, "switching user");
        }
        inner.local_id = Some(local_id.to_string());
        self.start_locked(&mut inner, url);
        Ok(())
    }

    /// Re-arm after the connection gave up (or was closed). Resets the attempt counter.
    pub fn reconnect(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        let Some(local_id) = inner.local_id.clone() else {
            return Err(ChatError::ConnectionFailed(
                "No identity to reconnect".to_string(),
            ));
        };
        if inner.state.is_active() {
            return Ok(());
        }
        let url = self.config.websocket_url(&local_id)?.to_string();
        log::info!("Reconnect requested for {}", local_id);
        self.start_locked(&mut inner, url);
        Ok(())
    }

    /// Send a pre-serialized frame. Fails with `TransportUnavailable` unless open.
    pub fn send(&self, text: &str) -> Result<()> {
        let inner = self.shared.lock();
        match (&inner.state, &inner.outgoing) {
            (ConnectionState::Connected, Some(tx)) => tx
                .send(Outgoing::Text(text.to_string()))
                .map_err(|_| ChatError::TransportUnavailable("NOT_CONNECTED".to_string())),
            _ => Err(ChatError::TransportUnavailable("NOT_CONNECTED".to_string())),
        }
    }

    /// Deliberate close. Never triggers a reconnect; no callbacks fire after it returns.
    pub fn close(&self, code: u16, reason: &str) {
        let mut inner = self.shared.lock();
        let was_active = inner.state.is_active();
        Self::shutdown_locked(&mut inner, code, reason);
        if was_active {
            log::info!("Connection closed ({} {})", code, reason);
            inner.state = ConnectionState::Disconnected;
            self.shared.notify_state(&ConnectionState::Disconnected);
        }
    }

    fn shutdown_locked(inner: &mut Inner, code: u16, reason: &str) {
        inner.generation += 1;
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        if let Some(tx) = inner.outgoing.take() {
            let _ = tx.send(Outgoing::Close {
                code,
                reason: reason.to_string(),
            });
        }
        inner.state = ConnectionState::Disconnected;
    }

    fn start_locked(&self, inner: &mut Inner, url: String) {
        inner.generation += 1;
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        inner.outgoing = None;
        inner.state = ConnectionState::Connecting;
        self.shared.notify_state(&ConnectionState::Connecting);

        let generation = inner.generation;
        let shared = self.shared.clone();
        let connector = self.connector.clone();
        let policy = self.policy.clone();
        inner.task = Some(tokio::spawn(async move {
            run_connection(shared, connector, policy, url, generation).await;
        }));
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        Self::shutdown_locked(&mut inner, NORMAL_CLOSURE, "supervisor dropped");
    }
}

/// Connect, pump frames, and retry unclean closures until the policy gives up.
async fn run_connection(
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    url: String,
    generation: u64,
) {
    let mut attempt: u32 = 0;
    loop {
        let reason = match connector.connect(&url).await {
            Ok(Link {
                outgoing,
                mut incoming,
            }) => {
                if !shared.transition(generation, ConnectionState::Connected, Some(outgoing)) {
                    return;
                }
                attempt = 0;

                let (clean, reason) = loop {
                    match incoming.recv().await {
                        Some(LinkEvent::Text(text)) => {
                            log::debug!("Frame received ({} bytes)", text.len());
                            if !shared.dispatch_frame(generation, &text) {
                                return;
                            }
                        }
                        Some(LinkEvent::Closed {
                            clean,
                            code,
                            reason,
                        }) => {
                            log::info!(
                                "Connection closed by peer (clean: {}, code: {:?}, reason: {})",
                                clean,
                                code,
                                reason
                            );
                            break (clean, reason);
                        }
                        None => break (false, "link dropped".to_string()),
                    }
                };

                if clean {
                    shared.transition(generation, ConnectionState::Disconnected, None);
                    return;
                }
                reason
            }
            Err(e) => {
                log::warn!("Connect to {} failed: {}", url, e);
                e.to_string()
            }
        };

        if attempt >= policy.max_retries {
            log::warn!("Giving up on {} after {} retries", url, attempt);
            shared.transition(
                generation,
                ConnectionState::Failed {
                    reason: format!("Gave up after {} retries: {}", attempt, reason),
                },
                None,
            );
            return;
        }

        let delay = policy.delay(attempt);
        attempt += 1;
        log::info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay,
            attempt,
            policy.max_retries
        );
        if !shared.transition(generation, ConnectionState::Reconnecting { attempt }, None) {
            return;
        }
        tokio::time::sleep(delay).await;
    }
}
