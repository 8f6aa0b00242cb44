//! Persistent push connection with automatic reconnection.
//!
//! [`LiveUpdateChannel`] owns one connection at a time. Every timer it runs
//! (session, keepalive, reconnect) is a [`ScheduledTask`], and background
//! work only holds a weak reference to the channel, so `disconnect()` or
//! dropping the last handle tears everything down.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use async_trait::async_trait;
use jobline_platform::{
    Breadcrumb, BreadcrumbLevel, DiagnosticsSink, TracingDiagnostics, record_best_effort,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{
    backoff::ReconnectBackoff,
    error::{ChannelError, HandlerError},
    scheduler::ScheduledTask,
    state_machine::{ChannelTrigger, ConnectionStateMachine, Transition, TransitionError},
    subscriptions::{Subscription, SubscriptionRegistry},
    types::{ConnectionState, InboundEvent, OutboundMessage, event_types},
};

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_LIVE_PATH: &str = "/ws";
/// WebSocket normal-closure code.
pub const NORMAL_CLOSURE: u16 = 1000;

const BREADCRUMB_CATEGORY: &str = "live";

/// One open push connection.
#[async_trait]
pub trait LiveConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError>;
    /// Next text frame. `None` means the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<String, ChannelError>>;
    async fn close(&mut self, code: u16);
}

/// Opens push connections.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn LiveConnection>, ChannelError>;
}

/// Host, scheme and path the channel connects to; the port is supplied per `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOrigin {
    host: String,
    secure: bool,
    path: String,
}

impl ChannelOrigin {
    pub fn new(host: impl Into<String>, secure: bool) -> Self {
        Self {
            host: host.into(),
            secure,
            path: DEFAULT_LIVE_PATH.to_owned(),
        }
    }

    /// Derive host and scheme from an HTTP base URL (`https` selects `wss`).
    pub fn from_base_url(base: &Url) -> Result<Self, ChannelError> {
        let host = base
            .host_str()
            .ok_or_else(|| ChannelError::InvalidUrl(format!("{base} has no host")))?;
        Ok(Self::new(host, base.scheme() == "https"))
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn url_for_port(&self, port: u16) -> Result<Url, ChannelError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        Url::parse(&format!("{scheme}://{host}:{port}{path}"))
            .map_err(|err| ChannelError::InvalidUrl(err.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct LiveChannelConfig {
    pub origin: ChannelOrigin,
    pub keepalive_interval: Duration,
    pub backoff: ReconnectBackoff,
}

impl LiveChannelConfig {
    pub fn new(origin: ChannelOrigin) -> Self {
        Self {
            origin,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            backoff: ReconnectBackoff::default(),
        }
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }
}

struct ChannelRuntime {
    machine: ConnectionStateMachine,
    backoff: ReconnectBackoff,
    url: Option<Url>,
    /// Bumped whenever a new attempt starts or the channel is torn down;
    /// callbacks from older sessions compare against it and bail out.
    generation: u64,
    session: Option<ScheduledTask>,
    reconnect_timer: Option<ScheduledTask>,
    outbound: Option<mpsc::UnboundedSender<OutboundMessage>>,
}

/// State changes waiting for delivery, in the order they were applied.
#[derive(Default)]
struct StateFeed {
    pending: VecDeque<ConnectionState>,
    /// Set while one thread is delivering; others only enqueue.
    draining: bool,
}

struct ChannelShared {
    keepalive_interval: Duration,
    origin: ChannelOrigin,
    connector: Arc<dyn LiveConnector>,
    subscriptions: SubscriptionRegistry,
    diagnostics: Arc<dyn DiagnosticsSink>,
    runtime: Mutex<ChannelRuntime>,
    /// Always locked after `runtime` when both are held.
    feed: Mutex<StateFeed>,
}

/// Push channel: lifecycle state machine, reconnect with jittered backoff,
/// keepalive pings and per-event-type fan-out.
///
/// Cloning yields another handle to the same channel. Dropping the last
/// handle cancels every pending task and closes the connection.
#[derive(Clone)]
pub struct LiveUpdateChannel {
    shared: Arc<ChannelShared>,
}

impl LiveUpdateChannel {
    pub fn new(config: LiveChannelConfig, connector: Arc<dyn LiveConnector>) -> Self {
        Self::with_diagnostics(config, connector, Arc::new(TracingDiagnostics))
    }

    pub fn with_diagnostics(
        config: LiveChannelConfig,
        connector: Arc<dyn LiveConnector>,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                keepalive_interval: config.keepalive_interval,
                origin: config.origin,
                connector,
                subscriptions: SubscriptionRegistry::new(),
                diagnostics,
                runtime: Mutex::new(ChannelRuntime {
                    machine: ConnectionStateMachine::default(),
                    backoff: config.backoff,
                    url: None,
                    generation: 0,
                    session: None,
                    reconnect_timer: None,
                    outbound: None,
                }),
                feed: Mutex::new(StateFeed::default()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().machine.state()
    }

    /// Consecutive reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().backoff.attempt()
    }

    /// Open the channel on `port`.
    ///
    /// `None` leaves the channel disabled. Already connected or connecting
    /// is a no-op. While reconnecting, the pending timer is dropped and an
    /// attempt starts immediately.
    pub fn connect(&self, port: Option<u16>) -> Result<(), ChannelError> {
        let Some(port) = port else {
            debug!("live channel disabled: no port configured");
            return Ok(());
        };

        {
            let mut rt = self.shared.lock();
            if matches!(
                rt.machine.state(),
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                debug!(state = %rt.machine.state(), "connect ignored");
                return Ok(());
            }
            let url = self.shared.origin.url_for_port(port)?;
            info!(%url, "connecting live channel");
            rt.url = Some(url);
            let changed = changed_state(rt.machine.apply(ChannelTrigger::Connect));
            rt.reconnect_timer = None;
            self.shared.start_attempt(&mut rt);
            self.shared.queue_state(changed);
        }
        self.shared.flush_states();
        Ok(())
    }

    /// Close the connection with a normal-closure code, cancel every timer
    /// and stay disconnected until `connect` or `manual_reconnect`.
    pub fn disconnect(&self) {
        {
            let mut rt = self.shared.lock();
            rt.generation += 1;
            rt.reconnect_timer = None;
            rt.outbound = None;
            rt.session = None;
            let changed = changed_state(rt.machine.apply(ChannelTrigger::Disconnect));
            if changed.is_some() {
                info!("live channel disconnected");
            }
            self.shared.queue_state(changed);
        }
        self.shared.flush_states();
    }

    /// Reset the reconnect budget and attempt immediately when disconnected
    /// or reconnecting. Requires an earlier `connect` with a port.
    pub fn manual_reconnect(&self) {
        {
            let mut rt = self.shared.lock();
            if rt.url.is_none() {
                debug!("manual reconnect ignored: channel was never connected");
                return;
            }
            let transition = rt.machine.apply(ChannelTrigger::ManualReconnect);
            if matches!(transition, Ok(Transition::Ignored)) {
                debug!(state = %rt.machine.state(), "manual reconnect ignored");
                return;
            }
            info!("manual reconnect requested");
            rt.backoff.reset();
            rt.reconnect_timer = None;
            self.shared.start_attempt(&mut rt);
            self.shared.queue_state(changed_state(transition));
        }
        self.shared.flush_states();
    }

    /// Queue `message` on the open connection.
    pub fn send(&self, message: OutboundMessage) -> Result<(), ChannelError> {
        let rt = self.shared.lock();
        let outbound = match (rt.machine.state(), rt.outbound.as_ref()) {
            (ConnectionState::Connected, Some(outbound)) => outbound,
            _ => return Err(ChannelError::NotConnected),
        };
        outbound.send(message).map_err(|_| ChannelError::Closed)
    }

    /// Register a handler for one event type.
    pub fn on<F>(&self, event_type: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&InboundEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.shared.subscriptions.on(event_type, handler)
    }

    /// Register a handler for connection state transitions.
    pub fn on_state_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectionState) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.shared.subscriptions.on_state_change(handler)
    }
}

impl ChannelShared {
    fn lock(&self) -> MutexGuard<'_, ChannelRuntime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_attempt(self: &Arc<Self>, rt: &mut ChannelRuntime) {
        rt.generation += 1;
        rt.outbound = None;
        let Some(url) = rt.url.clone() else {
            return;
        };
        let generation = rt.generation;
        let channel = Arc::downgrade(self);
        let keepalive = self.keepalive_interval;
        let connector = self.connector.clone();
        rt.session = Some(ScheduledTask::spawn(move |stop| {
            run_session(channel, connector, generation, url, keepalive, stop)
        }));
    }

    /// Returns `false` when the session is stale and must close itself.
    fn connection_opened(
        &self,
        generation: u64,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) -> bool {
        {
            let mut rt = self.lock();
            if rt.generation != generation {
                return false;
            }
            rt.backoff.reset();
            rt.reconnect_timer = None;
            rt.outbound = Some(outbound);
            self.queue_state(changed_state(rt.machine.apply(ChannelTrigger::Opened)));
        }
        info!("live channel connected");
        self.flush_states();
        true
    }

    fn connection_lost(self: &Arc<Self>, generation: u64, err: &ChannelError) {
        {
            let mut rt = self.lock();
            if rt.generation != generation {
                return;
            }
            warn!(error = %err, state = %rt.machine.state(), "live connection lost");
            rt.outbound = None;
            rt.session = None;
            let changed = self.schedule_reconnect(&mut rt);
            self.queue_state(changed);
        }
        self.flush_states();
    }

    fn schedule_reconnect(self: &Arc<Self>, rt: &mut ChannelRuntime) -> Option<ConnectionState> {
        let Some(delay) = rt.backoff.next_delay() else {
            warn!(
                attempts = rt.backoff.attempt(),
                "reconnect attempts exhausted; staying disconnected"
            );
            rt.reconnect_timer = None;
            return changed_state(rt.machine.apply(ChannelTrigger::Lost { retry: false }));
        };

        let attempt = rt.backoff.attempt();
        info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        let generation = rt.generation;
        let channel = Arc::downgrade(self);
        rt.reconnect_timer = Some(ScheduledTask::after(delay, async move {
            if let Some(channel) = channel.upgrade() {
                channel.reconnect_due(generation);
            }
        }));
        changed_state(rt.machine.apply(ChannelTrigger::Lost { retry: true }))
    }

    fn reconnect_due(self: &Arc<Self>, generation: u64) {
        let mut rt = self.lock();
        if rt.generation != generation || rt.machine.state() != ConnectionState::Reconnecting {
            return;
        }
        debug!(attempt = rt.backoff.attempt(), "reconnect attempt starting");
        rt.reconnect_timer = None;
        self.start_attempt(&mut rt);
    }

    fn handle_frame(&self, text: &str) {
        let event = match InboundEvent::parse(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "dropping malformed live message");
                return;
            }
        };
        if event.event_type == event_types::PONG {
            trace!("keepalive acknowledged");
        }
        let report = self.subscriptions.dispatch_event(&event);
        trace!(
            event_type = %event.event_type,
            delivered = report.delivered,
            failed = report.failed,
            "live event dispatched"
        );
    }

    fn lock_feed(&self) -> MutexGuard<'_, StateFeed> {
        self.feed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a state change. Callers hold the runtime lock, so the queue
    /// order is the order transitions were applied.
    fn queue_state(&self, changed: Option<ConnectionState>) {
        if let Some(state) = changed {
            self.lock_feed().pending.push_back(state);
        }
    }

    /// Deliver queued state changes in order. Must be called without the
    /// runtime lock held. If another thread is already delivering, it picks
    /// up whatever this caller queued; a handler that re-enters the channel
    /// therefore never blocks on its own delivery.
    fn flush_states(&self) {
        {
            let mut feed = self.lock_feed();
            if feed.draining {
                return;
            }
            feed.draining = true;
        }
        loop {
            let next = {
                let mut feed = self.lock_feed();
                let next = feed.pending.pop_front();
                if next.is_none() {
                    feed.draining = false;
                }
                next
            };
            match next {
                Some(state) => self.deliver_state(state),
                None => return,
            }
        }
    }

    fn deliver_state(&self, state: ConnectionState) {
        let level = match state {
            ConnectionState::Disconnected => BreadcrumbLevel::Warning,
            _ => BreadcrumbLevel::Info,
        };
        record_best_effort(
            self.diagnostics.as_ref(),
            Breadcrumb::new(BREADCRUMB_CATEGORY, level, format!("live channel {state}"))
                .with_data("state", state),
        );
        self.subscriptions.notify_state(state);
    }
}

fn changed_state(result: Result<Transition, TransitionError>) -> Option<ConnectionState> {
    match result {
        Ok(Transition::Changed(state)) => Some(state),
        Ok(_) => None,
        Err(err) => {
            debug!(error = %err, "ignored live channel transition");
            None
        }
    }
}

async fn run_session(
    channel: Weak<ChannelShared>,
    connector: Arc<dyn LiveConnector>,
    generation: u64,
    url: Url,
    keepalive_interval: Duration,
    stop: CancellationToken,
) {
    let opened = tokio::select! {
        _ = stop.cancelled() => return,
        result = connector.connect(&url) => result,
    };
    let mut conn = match opened {
        Ok(conn) => conn,
        Err(err) => {
            if let Some(channel) = channel.upgrade() {
                channel.connection_lost(generation, &err);
            }
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let current = channel
        .upgrade()
        .is_some_and(|channel| channel.connection_opened(generation, outbound_tx.clone()));
    if !current {
        conn.close(NORMAL_CLOSURE).await;
        return;
    }
    let _keepalive = ScheduledTask::every(keepalive_interval, move || {
        outbound_tx.send(OutboundMessage::Ping).is_ok()
    });

    let failure = loop {
        tokio::select! {
            _ = stop.cancelled() => {
                conn.close(NORMAL_CLOSURE).await;
                break None;
            }
            Some(message) = outbound_rx.recv() => {
                if let OutboundMessage::Ping = message {
                    trace!("sending keepalive ping");
                }
                if let Err(err) = conn.send_text(message.to_text()).await {
                    break Some(err);
                }
            }
            frame = conn.recv() => match frame {
                Some(Ok(text)) => match channel.upgrade() {
                    Some(channel) => channel.handle_frame(&text),
                    None => {
                        conn.close(NORMAL_CLOSURE).await;
                        break None;
                    }
                },
                Some(Err(err)) => break Some(err),
                None => break Some(ChannelError::Closed),
            },
        }
    };

    if let Some(err) = failure
        && let Some(channel) = channel.upgrade()
    {
        channel.connection_lost(generation, &err);
    }
}
