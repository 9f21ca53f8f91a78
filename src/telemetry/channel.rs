//! Telemetry Channel Event Loop
//!
//! A single task owns the connection state and processes, one at a time:
//! caller commands, transport events, the reconnect timer and the heartbeat
//! timer. Nothing else mutates that state.
//!
//! Each connection attempt runs in its own transport task and tags every event
//! with a generation number. Only the active generation is honoured, so a
//! replaced or torn-down transport can never deliver anything.

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::fmt;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

use super::backoff::ReconnectPolicy;
use super::payload::{decode_frame, TelemetryPayload};
use super::transport::{Connector, TransportLink};
use super::TelemetryError;

/// Default synthetic heartbeat interval
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Whether the channel may run without an authenticated session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessPolicy {
    /// Open regardless of login state
    #[default]
    Anonymous,
    /// `open` fails until a session token is supplied via `authorize`
    RequireSession,
}

/// Channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Synthetic heartbeat period while not connected
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub access: AccessPolicy,
    /// Emit heartbeats before the first `open`
    pub heartbeat_when_idle: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect: ReconnectPolicy::default(),
            access: AccessPolicy::Anonymous,
            heartbeat_when_idle: true,
        }
    }
}

impl ChannelConfig {
    /// Create from the crate configuration
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            reconnect: config.reconnect_policy(),
            access: if config.telemetry_require_session {
                AccessPolicy::RequireSession
            } else {
                AccessPolicy::Anonymous
            },
            heartbeat_when_idle: true,
        }
    }
}

/// Observable channel state
#[derive(Debug, Clone, Default)]
pub struct ChannelSnapshot {
    pub state: ConnectionState,
    pub endpoint: Option<String>,
    /// Delay before the pending reconnect attempt
    pub retry_delay: Option<Duration>,
    /// Transport attempts made since creation
    pub attempts: u64,
    /// Most recent payload delivered to listeners
    pub last_payload: Option<TelemetryPayload>,
}

type DataCallback = Box<dyn Fn(&TelemetryPayload) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&TelemetryError) + Send + Sync>;

enum Command {
    Open {
        endpoint: String,
        reply: oneshot::Sender<Result<(), TelemetryError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Send {
        text: String,
        reply: oneshot::Sender<Result<(), TelemetryError>>,
    },
    Authorize {
        token: Option<String>,
        reply: oneshot::Sender<()>,
    },
    OnData(DataCallback),
    OnError(ErrorCallback),
}

enum LinkEvent {
    Opened,
    Frame(String),
    /// `None` when the peer closed cleanly
    Closed(Option<TelemetryError>),
}

struct TaggedEvent {
    generation: u64,
    event: LinkEvent,
}

// ============================================================================
// Handle
// ============================================================================

/// Handle to a telemetry channel
///
/// Clone is cheap - all clones drive the same event loop. The loop stops when
/// the last handle is dropped.
#[derive(Clone)]
pub struct TelemetryChannel {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ChannelSnapshot>,
}

impl TelemetryChannel {
    /// Spawn the event loop. Must be called inside a tokio runtime.
    pub fn new(connector: Arc<dyn Connector>, config: ChannelConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ChannelSnapshot::default());

        let event_loop = EventLoop::new(connector, config, snapshot_tx, events_tx);
        tokio::spawn(event_loop.run(commands_rx, events_rx));

        Self {
            commands: commands_tx,
            snapshot: snapshot_rx,
        }
    }

    /// Start connecting. No-op when already active on the same endpoint.
    pub async fn open(&self, endpoint: impl Into<String>) -> Result<(), TelemetryError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Open {
            endpoint: endpoint.into(),
            reply,
        })?;
        rx.await.map_err(|_| TelemetryError::ChannelClosed)?
    }

    /// Tear down the transport and cancel all timers.
    ///
    /// Once this returns no further payloads are delivered. Safe to call from
    /// any state, any number of times.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.request(Command::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Write a JSON message on the live transport
    pub async fn send(&self, message: &serde_json::Value) -> Result<(), TelemetryError> {
        let text = serde_json::to_string(message).map_err(|e| TelemetryError::Decode(e.to_string()))?;
        let (reply, rx) = oneshot::channel();
        self.request(Command::Send { text, reply })?;
        rx.await.map_err(|_| TelemetryError::ChannelClosed)?
    }

    /// Supply (or withdraw) the session token used for connecting
    pub async fn authorize(&self, token: Option<String>) {
        let (reply, rx) = oneshot::channel();
        if self.request(Command::Authorize { token, reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Register a listener for every payload, live or synthetic, in event order
    pub fn on_data<F>(&self, callback: F)
    where
        F: Fn(&TelemetryPayload) + Send + Sync + 'static,
    {
        let _ = self.request(Command::OnData(Box::new(callback)));
    }

    /// Register a listener for transport and decode failures
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&TelemetryError) + Send + Sync + 'static,
    {
        let _ = self.request(Command::OnError(Box::new(callback)));
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified on every state or payload change
    pub fn watch(&self) -> watch::Receiver<ChannelSnapshot> {
        self.snapshot.clone()
    }

    fn request(&self, command: Command) -> Result<(), TelemetryError> {
        self.commands
            .send(command)
            .map_err(|_| TelemetryError::ChannelClosed)
    }
}

// ============================================================================
// Event loop
// ============================================================================

struct ActiveTransport {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
    handle: JoinHandle<()>,
}

impl ActiveTransport {
    fn shutdown(self) {
        self.handle.abort();
    }
}

struct EventLoop {
    connector: Arc<dyn Connector>,
    config: ChannelConfig,
    snapshot_tx: watch::Sender<ChannelSnapshot>,
    events_tx: mpsc::UnboundedSender<TaggedEvent>,

    state: ConnectionState,
    endpoint: Option<String>,
    token: Option<String>,
    generation: u64,
    active: Option<ActiveTransport>,
    failures: u32,
    attempts: u64,
    retry_delay: Option<Duration>,
    last_payload: Option<TelemetryPayload>,

    reconnect_timer: Option<Pin<Box<Sleep>>>,
    heartbeat_timer: Option<Interval>,
    /// Heartbeats run only while this is set and we are not Connected
    fallback_enabled: bool,
    heartbeats: u64,
    started: Instant,

    data_listeners: Vec<DataCallback>,
    error_listeners: Vec<ErrorCallback>,
}

impl EventLoop {
    fn new(
        connector: Arc<dyn Connector>,
        config: ChannelConfig,
        snapshot_tx: watch::Sender<ChannelSnapshot>,
        events_tx: mpsc::UnboundedSender<TaggedEvent>,
    ) -> Self {
        let fallback_enabled = config.heartbeat_when_idle;
        Self {
            connector,
            config,
            snapshot_tx,
            events_tx,
            state: ConnectionState::Disconnected,
            endpoint: None,
            token: None,
            generation: 0,
            active: None,
            failures: 0,
            attempts: 0,
            retry_delay: None,
            last_payload: None,
            reconnect_timer: None,
            heartbeat_timer: None,
            fallback_enabled,
            heartbeats: 0,
            started: Instant::now(),
            data_listeners: Vec::new(),
            error_listeners: Vec::new(),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<TaggedEvent>,
    ) {
        self.sync_heartbeat();

        loop {
            // Commands, then transport events, then timers: a live frame that
            // lands together with a heartbeat tick is always handled first.
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(tagged) = events.recv() => self.handle_event(tagged),
                _ = wait_for(&mut self.reconnect_timer) => self.on_reconnect_timer(),
                _ = tick(&mut self.heartbeat_timer) => self.on_heartbeat(),
            }
        }

        self.teardown();
        debug!("Telemetry event loop stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open { endpoint, reply } => {
                let result = self.open(endpoint);
                let _ = reply.send(result);
            }
            Command::Close { reply } => {
                self.close();
                let _ = reply.send(());
            }
            Command::Send { text, reply } => {
                let _ = reply.send(self.send(text));
            }
            Command::Authorize { token, reply } => {
                self.authorize(token);
                let _ = reply.send(());
            }
            Command::OnData(callback) => self.data_listeners.push(callback),
            Command::OnError(callback) => self.error_listeners.push(callback),
        }
    }

    fn open(&mut self, endpoint: String) -> Result<(), TelemetryError> {
        if self.config.access == AccessPolicy::RequireSession && self.token.is_none() {
            warn!("Refusing to open telemetry channel without a session");
            return Err(TelemetryError::Unauthorized);
        }

        if self.state != ConnectionState::Disconnected {
            if self.endpoint.as_deref() == Some(endpoint.as_str()) {
                debug!("Telemetry channel already {} on {}", self.state, endpoint);
                return Ok(());
            }
            info!("Switching telemetry endpoint to {}", endpoint);
            self.teardown();
        }

        self.endpoint = Some(endpoint);
        self.fallback_enabled = true;
        self.start_attempt(ConnectionState::Connecting);
        Ok(())
    }

    fn close(&mut self) {
        if self.state != ConnectionState::Disconnected {
            info!("Closing telemetry channel");
        }
        self.teardown();
        self.fallback_enabled = false;
        self.set_state(ConnectionState::Disconnected);
    }

    fn send(&mut self, text: String) -> Result<(), TelemetryError> {
        match &self.active {
            Some(active) if self.state == ConnectionState::Connected => active
                .outbound
                .send(text)
                .map_err(|_| TelemetryError::NotConnected),
            _ => Err(TelemetryError::NotConnected),
        }
    }

    fn authorize(&mut self, token: Option<String>) {
        self.token = token;
        if self.token.is_none()
            && self.config.access == AccessPolicy::RequireSession
            && self.state != ConnectionState::Disconnected
        {
            info!("Session withdrawn, closing telemetry channel");
            self.close();
        }
    }

    /// Drop the active transport and pending reconnect
    fn teardown(&mut self) {
        if let Some(active) = self.active.take() {
            debug!("Tearing down transport #{}", active.generation);
            active.shutdown();
        }
        self.reconnect_timer = None;
        self.retry_delay = None;
        self.failures = 0;
    }

    fn start_attempt(&mut self, state: ConnectionState) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };

        // Exactly one transport at a time
        if let Some(previous) = self.active.take() {
            previous.shutdown();
        }

        self.generation += 1;
        self.attempts += 1;
        let generation = self.generation;
        debug!("Transport attempt #{} to {}", generation, endpoint);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_link(
            generation,
            self.connector.clone(),
            endpoint,
            self.token.clone(),
            self.events_tx.clone(),
            outbound_rx,
        ));

        self.active = Some(ActiveTransport {
            generation,
            outbound: outbound_tx,
            handle,
        });
        self.set_state(state);
    }

    fn handle_event(&mut self, tagged: TaggedEvent) {
        if self.active.as_ref().map(|a| a.generation) != Some(tagged.generation) {
            debug!("Dropping event from stale transport #{}", tagged.generation);
            return;
        }

        match tagged.event {
            LinkEvent::Opened => {
                self.failures = 0;
                self.retry_delay = None;
                self.set_state(ConnectionState::Connected);
            }
            LinkEvent::Frame(text) => self.on_frame(&text),
            LinkEvent::Closed(error) => self.on_link_closed(error),
        }
    }

    fn on_frame(&mut self, text: &str) {
        for decoded in decode_frame(text) {
            match decoded {
                Ok(body) => self.deliver(TelemetryPayload::live(body)),
                Err(e) => {
                    warn!("Dropping telemetry frame: {}", e);
                    self.report(&e);
                }
            }
        }
        self.publish();
    }

    fn on_link_closed(&mut self, error: Option<TelemetryError>) {
        // The transport task has already finished
        self.active = None;

        match &error {
            Some(e) => {
                warn!("Telemetry transport lost: {}", e);
                self.report(e);
            }
            None => info!("Telemetry transport closed by peer"),
        }

        let delay = self.config.reconnect.delay(self.failures);
        self.failures = self.failures.saturating_add(1);
        self.retry_delay = Some(delay);
        self.reconnect_timer = Some(Box::pin(tokio::time::sleep(delay)));
        info!("Reconnecting in {:?} (attempt {})", delay, self.failures);

        self.set_state(ConnectionState::Reconnecting);
    }

    fn on_reconnect_timer(&mut self) {
        self.reconnect_timer = None;
        if self.state == ConnectionState::Reconnecting {
            self.start_attempt(ConnectionState::Reconnecting);
        }
    }

    fn on_heartbeat(&mut self) {
        if self.state == ConnectionState::Connected || !self.fallback_enabled {
            return;
        }
        self.heartbeats += 1;
        let payload = TelemetryPayload::heartbeat(self.heartbeats, self.started.elapsed().as_secs());
        self.deliver(payload);
        self.publish();
    }

    fn deliver(&mut self, payload: TelemetryPayload) {
        for listener in &self.data_listeners {
            listener(&payload);
        }
        self.last_payload = Some(payload);
    }

    fn report(&self, error: &TelemetryError) {
        for listener in &self.error_listeners {
            listener(error);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Telemetry state {} -> {}", self.state, state);
            self.state = state;
        }
        self.sync_heartbeat();
        self.publish();
    }

    /// Run the heartbeat timer exactly when the fallback should be producing
    fn sync_heartbeat(&mut self) {
        let wanted = self.fallback_enabled && self.state != ConnectionState::Connected;

        if wanted && self.heartbeat_timer.is_none() {
            let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.heartbeat_timer = Some(interval);
        } else if !wanted {
            self.heartbeat_timer = None;
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(ChannelSnapshot {
            state: self.state,
            endpoint: self.endpoint.clone(),
            retry_delay: self.retry_delay,
            attempts: self.attempts,
            last_payload: self.last_payload.clone(),
        });
    }
}

async fn wait_for(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

/// One transport attempt: connect, then pump frames both ways until either side ends
async fn run_link(
    generation: u64,
    connector: Arc<dyn Connector>,
    endpoint: String,
    token: Option<String>,
    events: mpsc::UnboundedSender<TaggedEvent>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let emit = |event: LinkEvent| events.send(TaggedEvent { generation, event }).is_ok();

    let TransportLink {
        mut incoming,
        mut outgoing,
    } = match connector.connect(&endpoint, token.as_deref()).await {
        Ok(link) => link,
        Err(e) => {
            emit(LinkEvent::Closed(Some(e)));
            return;
        }
    };

    if !emit(LinkEvent::Opened) {
        return;
    }

    loop {
        tokio::select! {
            frame = incoming.next() => match frame {
                Some(Ok(text)) => {
                    if !emit(LinkEvent::Frame(text)) {
                        return;
                    }
                }
                Some(Err(e)) => {
                    emit(LinkEvent::Closed(Some(e)));
                    return;
                }
                None => {
                    emit(LinkEvent::Closed(None));
                    return;
                }
            },
            message = outbound.recv() => match message {
                Some(text) => {
                    if let Err(e) = outgoing.send(text).await {
                        emit(LinkEvent::Closed(Some(e)));
                        return;
                    }
                }
                None => {
                    let _ = outgoing.close().await;
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            serde_json::to_string(&ConnectionState::Connected).unwrap(),
            "\"connected\""
        );
    }

    #[test]
    fn test_channel_config_default() {
        let config = ChannelConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.access, AccessPolicy::Anonymous);
        assert!(config.heartbeat_when_idle);
    }

    #[test]
    fn test_snapshot_default_is_disconnected() {
        let snapshot = ChannelSnapshot::default();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert_eq!(snapshot.attempts, 0);
        assert!(snapshot.last_payload.is_none());
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_loop() {
        struct NeverConnect;

        #[async_trait::async_trait]
        impl Connector for NeverConnect {
            async fn connect(&self, _: &str, _: Option<&str>) -> Result<TransportLink, TelemetryError> {
                pending().await
            }
        }

        let channel = TelemetryChannel::new(Arc::new(NeverConnect), ChannelConfig::default());
        let mut watch = channel.watch();
        channel.open("ws://nowhere").await.unwrap();
        assert_eq!(channel.state(), ConnectionState::Connecting);
        watch.borrow_and_update();

        drop(channel);
        // Sender side goes away once the loop exits
        let closed = tokio::time::timeout(Duration::from_secs(2), watch.changed()).await;
        assert!(matches!(closed, Ok(Err(_))));
    }
}
