//! Tokio driver for the session state machine
//!
//! [`SessionManager::start`] spawns a single actor task that owns the socket,
//! the retry timer and the liveness interval. Callers talk to it through a
//! cloneable [`SessionHandle`] and receive [`SessionEvent`]s, in transport
//! order, on one unbounded queue.

use super::backoff::Backoff;
use super::endpoint::{build_uri, redact, Channel, SessionIdentity};
use super::machine::{ConnectionState, Notification, SessionAction, SessionCore};
use crate::config::{ClientConfig, NoToken, TokenProvider};
use crate::error::{ErrorReporter, Result, SessionError};
use crate::protocol::{ClientMessage, ServerMessage};
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, info_span, trace, warn, Instrument};
use url::Url;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// What the session's consumer sees
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Opened,
    Closed { reason: String },
    Error { reason: String },
    Message(ServerMessage),
    /// A frame accepted by [`SessionHandle::send`] never reached the socket
    SendFailed { frame: String, reason: String },
}

impl From<Notification> for SessionEvent {
    fn from(notification: Notification) -> Self {
        match notification {
            Notification::Opened => SessionEvent::Opened,
            Notification::Closed { reason } => SessionEvent::Closed { reason },
            Notification::Error { reason } => SessionEvent::Error { reason },
        }
    }
}

/// Session counters
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatistics {
    pub session_id: u32,
    pub state: ConnectionState,
    pub connection_attempts: u64,
    pub successful_connections: u64,
    pub messages_received: u64,
    pub malformed_messages: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub last_connected: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Delay the next retry would wait
    #[serde(with = "humantime_serde")]
    pub current_backoff: Duration,
}

/// What handles read without asking the actor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Published {
    state: ConnectionState,
    generation: u64,
}

/// Builder for one logical session
pub struct SessionManager {
    server: Url,
    identity: SessionIdentity,
    token: Arc<dyn TokenProvider>,
    backoff: Backoff,
    connect_timeout: Duration,
    liveness: Option<Duration>,
}

impl SessionManager {
    pub fn new(server: Url, channel: Channel) -> Self {
        Self {
            server,
            identity: SessionIdentity::new(channel),
            token: Arc::new(NoToken),
            backoff: Backoff::default(),
            connect_timeout: Duration::from_secs(10),
            liveness: None,
        }
    }

    /// Validated configuration to manager; liveness checking starts with the
    /// session when enabled
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.validate()?;

        let manager = Self::new(config.server.clone(), config.channel.clone())
            .with_shared_token_provider(Arc::from(config.token.provider()))
            .with_reconnect(config.reconnect.floor, config.reconnect.ceiling)
            .with_connect_timeout(config.reconnect.connect_timeout);

        Ok(if config.liveness.enabled {
            manager.with_liveness_check(config.liveness.interval)
        } else {
            manager
        })
    }

    pub fn with_token_provider<P: TokenProvider + 'static>(self, provider: P) -> Self {
        self.with_shared_token_provider(Arc::new(provider))
    }

    pub fn with_shared_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token = provider;
        self
    }

    pub fn with_reconnect(mut self, floor: Duration, ceiling: Duration) -> Self {
        self.backoff = Backoff::new(floor, ceiling);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Pin the session id instead of drawing a random one
    pub fn with_session_id(mut self, session_id: u32) -> Self {
        self.identity.session_id = session_id;
        self
    }

    pub fn with_liveness_check(mut self, interval: Duration) -> Self {
        self.liveness = Some(interval);
        self
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Spawn the session actor. The session stays disconnected until the
    /// first [`SessionHandle::connect`] or liveness tick.
    pub fn start(self) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(Published {
            state: ConnectionState::Disconnected,
            generation: 0,
        });

        let identity = Arc::new(self.identity.clone());
        let span = info_span!(
            "session",
            session_id = identity.session_id,
            channel = %identity.channel
        );

        let mut actor = SessionActor {
            core: SessionCore::new(self.backoff),
            server: self.server,
            identity: self.identity,
            token: self.token,
            connect_timeout: self.connect_timeout,
            events: event_tx,
            state_tx,
            transport_tx,
            sink: None,
            socket_task: None,
            retry_at: None,
            liveness: None,
            stats: Counters::default(),
        };
        if let Some(interval) = self.liveness {
            actor.start_liveness(interval);
        }

        tokio::spawn(actor.run(command_rx, transport_rx).instrument(span));

        let handle = SessionHandle {
            commands: command_tx,
            published: state_rx,
            identity,
        };
        (handle, event_rx)
    }
}

enum Command {
    Connect,
    Send(String),
    SetVisible(bool),
    StartLiveness(Duration),
    Statistics(oneshot::Sender<SessionStatistics>),
    Shutdown(oneshot::Sender<()>),
}

enum TransportEvent {
    Opened { generation: u64, sink: WsSink },
    ConnectFailed { generation: u64, reason: String },
    Message { generation: u64, text: String },
    Error { generation: u64, reason: String },
    Closed { generation: u64, reason: String },
}

/// Cheap, cloneable access to a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    published: watch::Receiver<Published>,
    identity: Arc<SessionIdentity>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Connect => "Connect",
            Command::Send(_) => "Send",
            Command::SetVisible(_) => "SetVisible",
            Command::StartLiveness(_) => "StartLiveness",
            Command::Statistics(_) => "Statistics",
            Command::Shutdown(_) => "Shutdown",
        };
        f.write_str(name)
    }
}

impl SessionHandle {
    /// Start a connection attempt unless one is in flight or open
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Queue a text frame on the open socket.
    ///
    /// Fails with [`SessionError::NotConnected`] when the session is not
    /// open, after asking it to connect. A frame accepted here that the
    /// socket then fails to take comes back as [`SessionEvent::SendFailed`].
    pub fn send(&self, frame: impl Into<String>) -> Result<()> {
        if !self.is_connected() {
            self.connect();
            return Err(SessionError::not_connected(format!(
                "session is {}",
                self.state()
            )));
        }

        self.commands
            .send(Command::Send(frame.into()))
            .map_err(|_| SessionError::closed("session actor stopped"))
    }

    pub fn send_message(&self, message: &ClientMessage) -> Result<()> {
        self.send(message.to_frame()?)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        self.published.borrow().state
    }

    /// Generation of the latest connection attempt, published together
    /// with the state
    pub fn generation(&self) -> u64 {
        self.published.borrow().generation
    }

    /// Report host visibility; returning to visible reconnects a lapsed
    /// session
    pub fn set_visible(&self, visible: bool) {
        self.command(Command::SetVisible(visible));
    }

    /// Reconnect every `interval` whenever the session is not open.
    /// Replaces a running check.
    pub fn start_liveness_check(&self, interval: Duration) {
        self.command(Command::StartLiveness(interval));
    }

    pub async fn statistics(&self) -> Result<SessionStatistics> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Statistics(reply))
            .map_err(|_| SessionError::closed("session actor stopped"))?;
        response
            .await
            .map_err(|_| SessionError::closed("session actor stopped"))
    }

    /// Close the socket and stop the actor; no reconnect follows
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(reply))
            .map_err(|_| SessionError::closed("session actor already stopped"))?;
        done.await
            .map_err(|_| SessionError::closed("session actor stopped"))
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Resolves once the session reaches `target`
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<()> {
        let mut published = self.published.clone();
        published
            .wait_for(|current| current.state == target)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::closed("session actor stopped"))
    }

    fn command(&self, command: Command) {
        if let Err(e) = self.commands.send(command) {
            trace!(command = ?e.0, "session actor stopped, command dropped");
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    connection_attempts: u64,
    successful_connections: u64,
    messages_received: u64,
    malformed_messages: u64,
    frames_sent: u64,
    frames_dropped: u64,
    last_connected: Option<DateTime<Utc>>,
}

struct SessionActor {
    core: SessionCore,
    server: Url,
    identity: SessionIdentity,
    token: Arc<dyn TokenProvider>,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
    state_tx: watch::Sender<Published>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    sink: Option<WsSink>,
    socket_task: Option<JoinHandle<()>>,
    retry_at: Option<Instant>,
    liveness: Option<Interval>,
    stats: Counters,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        debug!(server = %self.server, "session actor started");

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("all session handles dropped");
                        self.stop().await;
                        break;
                    };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                Some(event) = transport.recv() => self.handle_transport(event).await,
                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    let actions = self.core.on_retry_elapsed();
                    self.apply(actions).await;
                }
                _ = tick(&mut self.liveness) => {
                    let actions = self.core.on_liveness_tick();
                    self.apply(actions).await;
                }
            }
        }

        debug!("session actor stopped");
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Connect => {
                let actions = self.core.connect();
                self.apply(actions).await;
            }
            Command::Send(frame) => self.send_frame(frame).await,
            Command::SetVisible(visible) => {
                debug!(visible, "visibility changed");
                let actions = self.core.set_visible(visible);
                self.apply(actions).await;
            }
            Command::StartLiveness(interval) => self.start_liveness(interval),
            Command::Statistics(reply) => {
                let _ = reply.send(self.statistics());
            }
            Command::Shutdown(done) => {
                self.stop().await;
                let _ = done.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened { generation, sink } => {
                let actions = self.core.on_open(generation);
                if actions.is_empty() {
                    let mut sink = sink;
                    let _ = sink.close().await;
                    return;
                }

                self.sink = Some(sink);
                self.stats.successful_connections += 1;
                self.stats.last_connected = Some(Utc::now());
                info!(generation, "session open");
                self.apply(actions).await;
            }
            TransportEvent::ConnectFailed { generation, reason } => {
                let actions = self.core.on_connect_failed(generation, &reason);
                if !actions.is_empty() {
                    ErrorReporter::log_error(
                        &SessionError::connection(reason.as_str()),
                        "session",
                        "connect",
                    );
                    self.socket_task = None;
                }
                self.apply(actions).await;
            }
            TransportEvent::Message { generation, text } => {
                if generation != self.core.generation() || !self.core.is_connected() {
                    trace!(generation, "dropping frame from superseded socket");
                    return;
                }
                self.stats.messages_received += 1;

                match ServerMessage::decode(&text) {
                    Ok(message) => {
                        debug!(kind = message.kind(), "message received");
                        self.emit(SessionEvent::Message(message));
                    }
                    Err(e) => {
                        self.stats.malformed_messages += 1;
                        ErrorReporter::log_error(&e, "session", "decode_message");
                    }
                }
            }
            TransportEvent::Error { generation, reason } => {
                let actions = self.core.on_transport_error(generation, &reason);
                if !actions.is_empty() {
                    warn!(generation, reason = %reason, "socket error");
                }
                self.apply(actions).await;
            }
            TransportEvent::Closed { generation, reason } => {
                let actions = self.core.on_closed(generation, &reason);
                if !actions.is_empty() {
                    info!(generation, reason = %reason, "session closed");
                    self.sink = None;
                    self.socket_task = None;
                }
                self.apply(actions).await;
            }
        }
    }

    async fn apply(&mut self, actions: Vec<SessionAction>) {
        // Publish before notifying so handles agree with the events they see
        self.state_tx.send_replace(Published {
            state: self.core.state(),
            generation: self.core.generation(),
        });

        for action in actions {
            match action {
                SessionAction::OpenSocket { generation } => self.open_socket(generation),
                SessionAction::CloseSocket { generation } => {
                    debug!(generation, "closing socket");
                    self.close_socket().await;
                }
                SessionAction::ScheduleRetry { delay } => {
                    self.retry_at = Some(Instant::now() + delay);
                }
                SessionAction::CancelRetry => self.retry_at = None,
                SessionAction::Notify(notification) => self.emit(notification.into()),
            }
        }
    }

    fn open_socket(&mut self, generation: u64) {
        self.stats.connection_attempts += 1;
        self.drop_socket();

        // Resolved per attempt, tokens rotate
        let token = match self.token.token() {
            Ok(token) => token,
            Err(e) => {
                ErrorReporter::log_error(&e, "session", "resolve_token");
                None
            }
        };

        let uri = match build_uri(&self.server, &self.identity, token.as_deref()) {
            Ok(uri) => uri,
            Err(e) => {
                let _ = self.transport_tx.send(TransportEvent::ConnectFailed {
                    generation,
                    reason: e.to_string(),
                });
                return;
            }
        };

        info!(generation, uri = %redact(&uri), "connecting");
        self.socket_task = Some(tokio::spawn(
            run_socket(
                generation,
                uri,
                self.connect_timeout,
                self.transport_tx.clone(),
            )
            .in_current_span(),
        ));
    }

    async fn close_socket(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "close handshake failed"),
                Err(_) => debug!("close handshake timed out"),
            }
        }
        if let Some(task) = self.socket_task.take() {
            task.abort();
        }
    }

    fn drop_socket(&mut self) {
        self.sink = None;
        if let Some(task) = self.socket_task.take() {
            task.abort();
        }
    }

    async fn send_frame(&mut self, frame: String) {
        if !self.core.is_connected() || self.sink.is_none() {
            warn!(state = %self.core.state(), "session not open, frame dropped");
            let reason = format!("session is {}", self.core.state());
            self.fail_send(frame, reason);
            let actions = self.core.connect();
            self.apply(actions).await;
            return;
        }
        let Some(sink) = self.sink.as_mut() else {
            return;
        };

        match sink.send(Message::Text(frame.clone())).await {
            Ok(()) => self.stats.frames_sent += 1,
            Err(e) => {
                let reason = format!("send failed: {e}");
                ErrorReporter::log_error(&SessionError::from(e), "session", "send");
                self.fail_send(frame, reason.clone());

                let generation = self.core.generation();
                let mut actions = self.core.on_transport_error(generation, &reason);
                actions.extend(self.core.on_closed(generation, &reason));
                self.drop_socket();
                self.apply(actions).await;
            }
        }
    }

    fn fail_send(&mut self, frame: String, reason: String) {
        self.stats.frames_dropped += 1;
        self.emit(SessionEvent::SendFailed { frame, reason });
    }

    fn start_liveness(&mut self, interval: Duration) {
        if interval.is_zero() {
            warn!("ignoring zero liveness interval");
            return;
        }
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.liveness = Some(ticker);
        debug!(interval_ms = interval.as_millis() as u64, "liveness check started");
    }

    async fn stop(&mut self) {
        let actions = self.core.shutdown();
        self.apply(actions).await;

        if self.core.state() == ConnectionState::Closing {
            let actions = self
                .core
                .on_closed(self.core.generation(), "session shut down");
            self.apply(actions).await;
        }

        self.drop_socket();
        self.retry_at = None;
        self.liveness = None;
        info!("session shut down");
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("session event receiver dropped");
        }
    }

    fn statistics(&self) -> SessionStatistics {
        SessionStatistics {
            session_id: self.identity.session_id,
            state: self.core.state(),
            connection_attempts: self.stats.connection_attempts,
            successful_connections: self.stats.successful_connections,
            messages_received: self.stats.messages_received,
            malformed_messages: self.stats.malformed_messages,
            frames_sent: self.stats.frames_sent,
            frames_dropped: self.stats.frames_dropped,
            last_connected: self.stats.last_connected,
            consecutive_failures: self.core.backoff().consecutive_failures(),
            current_backoff: self.core.backoff().current(),
        }
    }
}

/// One physical socket: handshake, hand the write half to the actor, then
/// forward every inbound frame until the socket closes.
async fn run_socket(
    generation: u64,
    uri: Url,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let stream = match tokio::time::timeout(connect_timeout, connect_async(uri.as_str())).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            let _ = events.send(TransportEvent::ConnectFailed {
                generation,
                reason: format!("WebSocket connection failed: {e}"),
            });
            return;
        }
        Err(_) => {
            let _ = events.send(TransportEvent::ConnectFailed {
                generation,
                reason: format!(
                    "WebSocket handshake timed out after {}ms",
                    connect_timeout.as_millis()
                ),
            });
            return;
        }
    };

    let (sink, mut stream) = stream.split();
    if events
        .send(TransportEvent::Opened { generation, sink })
        .is_err()
    {
        return;
    }

    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if events
                    .send(TransportEvent::Message { generation, text })
                    .is_err()
                {
                    return;
                }
            }
            Some(Ok(Message::Binary(bytes))) => {
                debug!(len = bytes.len(), "ignoring binary frame");
            }
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|frame| frame.reason.into_owned())
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or_else(|| "closed by server".to_string());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                let reason = e.to_string();
                let _ = events.send(TransportEvent::Error {
                    generation,
                    reason: reason.clone(),
                });
                break reason;
            }
            None => break "connection closed".to_string(),
        }
    };

    let _ = events.send(TransportEvent::Closed { generation, reason });
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
