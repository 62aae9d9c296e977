//! # Connection Manager
//!
//! The manager is a single tokio task (the actor) that exclusively owns the
//! presence link, the connection state machine, the retry context and every
//! timer. [`PresenceClient`] is only a handle: each call turns into a command
//! on the actor's queue and returns immediately. Outcomes are observed through
//! the status watch, the presence view and the event stream.
//!
//! ## Lifecycle
//!
//! 1. `connect()` resolves the bearer token up front and fails fast with
//!    [`PresenceError::Unauthenticated`] when there is none.
//! 2. If another manager sharing the same [`LinkRegistry`] already has an open
//!    link, this manager adopts it instead of opening a second socket.
//! 3. Otherwise the primary (proxied) endpoint is tried. If it fails before
//!    opening, the direct endpoint is tried once.
//! 4. On open the `authenticate` frame goes out. After the settle delay the
//!    privacy flag (when enabled) and a snapshot request follow and the
//!    heartbeat and resync timers start. The retry budget is only refilled
//!    once the server answers with a valid frame.
//! 5. On close the reason decides: normal closure, logout and capacity
//!    refusals are terminal; anything else is retried with exponential
//!    backoff until the budget runs out.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::{EndpointKind, Endpoints, PresenceConfig};
use crate::core::backoff::BackoffPolicy;
use crate::core::dispatcher::{Dispatched, Dispatcher};
use crate::core::events::{Notice, PresenceEvent};
use crate::core::periodic::{HeartbeatKeeper, ResyncScheduler};
use crate::core::registry::{LinkRegistry, ManagerId, SharedLinkEvent};
use crate::core::store::PresenceView;
use crate::core::throttle::Throttler;
use crate::credentials::{redact, CredentialSource};
use crate::error::PresenceError;
use crate::preferences::PreferenceStore;
use crate::protocol::{OutboundFrame, TaskAction};
use crate::transport::{Connector, LinkEvent, LinkId, TransportEvent, TransportHandle, TransportSink, CLOSE_NORMAL};

/// Close reason sent when the user signs out.
pub const USER_LOGOUT_REASON: &str = "user_logout";
/// Close reason sent by an explicit `disconnect()`.
pub const CLIENT_DISCONNECT_REASON: &str = "client_disconnect";
/// Close reason the service uses when it is full.
pub const MAX_CONNECTIONS_REASON: &str = "max_connections_reached";
/// Close reason the service uses when this user has too many connections.
pub const MAX_USER_CONNECTIONS_REASON: &str = "max_user_connections_reached";
/// Close code used when a link stays silent past the handshake timeout.
pub const HANDSHAKE_TIMEOUT_CODE: u16 = 4000;
/// Close reason used when a link stays silent past the handshake timeout.
pub const HANDSHAKE_TIMEOUT_REASON: &str = "handshake_timeout";

const EVENT_CAPACITY: usize = 256;

/// State of the presence channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No channel.
    #[default]
    Disconnected,
    /// A link is being opened or a shared link is being waited for.
    Connecting,
    /// The channel can carry frames.
    Open,
    /// The channel is being torn down.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "connected",
            ConnectionState::Closing => "closing",
        };
        f.write_str(label)
    }
}

/// Snapshot of everything a UI needs to render connection state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    /// Channel state.
    pub state: ConnectionState,
    /// `state == Open`.
    pub is_connected: bool,
    /// `state == Connecting`.
    pub is_loading: bool,
    /// A retry is scheduled or in flight.
    pub is_reconnecting: bool,
    /// Last error worth showing, cleared when the channel settles.
    pub error: Option<String>,
    /// Retries used from the current budget.
    pub reconnect_attempts: u32,
    /// Local privacy flag.
    pub privacy_mode: bool,
}

/// Retry bookkeeping for one run of consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReconnectContext {
    attempts: u32,
    max_attempts: u32,
    is_reconnecting: bool,
}

impl ReconnectContext {
    fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            is_reconnecting: false,
        }
    }

    fn reset(&mut self) {
        self.attempts = 0;
        self.is_reconnecting = false;
    }

    fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// How a close is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseKind {
    /// Do not reconnect; optionally tell the user why.
    Terminal(Option<Notice>),
    /// Reconnect if the budget allows.
    Retryable,
}

pub(crate) fn classify_close(code: u16, reason: &str) -> CloseKind {
    match reason {
        MAX_CONNECTIONS_REASON => CloseKind::Terminal(Some(Notice::ServerAtCapacity)),
        MAX_USER_CONNECTIONS_REASON => CloseKind::Terminal(Some(Notice::UserConnectionLimit)),
        USER_LOGOUT_REASON => CloseKind::Terminal(None),
        _ if code == CLOSE_NORMAL => CloseKind::Terminal(None),
        _ => CloseKind::Retryable,
    }
}

/// Collaborators a client is built from.
#[derive(Clone)]
pub struct ClientDeps {
    /// Opens links.
    pub connector: Arc<dyn Connector>,
    /// Supplies the bearer token.
    pub credentials: Arc<dyn CredentialSource>,
    /// Persists the privacy flag.
    pub preferences: Arc<dyn PreferenceStore>,
    /// Size-one pool shared with other managers.
    pub registry: LinkRegistry,
}

impl ClientDeps {
    /// Bundles collaborators with a private registry.
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialSource>,
        preferences: Arc<dyn PreferenceStore>,
    ) -> Self {
        Self {
            connector,
            credentials,
            preferences,
            registry: LinkRegistry::new(),
        }
    }

    /// Shares links through `registry` instead.
    pub fn with_registry(mut self, registry: LinkRegistry) -> Self {
        self.registry = registry;
        self
    }
}

#[derive(Debug)]
enum Command {
    Connect,
    Unauthenticated,
    Disconnect,
    Cleanup,
    Send(OutboundFrame),
    SetPrivacy(bool),
    RequestUpdate,
    PublishTask { action: TaskAction, task: Value },
}

#[derive(Debug)]
enum Internal {
    Settled(LinkId),
    HandshakeTimeout(LinkId),
    ReconnectDue,
    HeartbeatDue,
    ResyncDue,
    SendPrivacy(bool),
}

/// A link this manager opened.
struct OwnedLink {
    id: LinkId,
    endpoint: EndpointKind,
    handle: TransportHandle,
    token: String,
    opened: bool,
    settled: bool,
}

enum Channel {
    Idle,
    Owned(OwnedLink),
    /// Another manager's link is opening; adopt it once it opens.
    Following,
    /// Riding on another manager's open link.
    Adopted(TransportHandle),
}

/// Handle on a running presence client. Cheap to clone.
#[derive(Clone)]
pub struct PresenceClient {
    commands: mpsc::UnboundedSender<Command>,
    credentials: Arc<dyn CredentialSource>,
    status: watch::Receiver<ConnectionStatus>,
    events: broadcast::Sender<PresenceEvent>,
    view: PresenceView,
}

impl PresenceClient {
    /// Validates `config` and starts the manager task. Must be called inside a
    /// tokio runtime. When `logout` fires, the client disconnects with the
    /// logout reason and clears its state.
    pub fn spawn(
        config: PresenceConfig,
        deps: ClientDeps,
        logout: Option<broadcast::Receiver<()>>,
    ) -> Result<Self, PresenceError> {
        config.validate()?;
        let endpoints = config.endpoints()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let privacy_mode = deps.preferences.load_privacy_mode();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus {
            privacy_mode,
            ..ConnectionStatus::default()
        });

        let dispatcher = Dispatcher::new(events.clone());
        let view = dispatcher.view();
        let shared_rx = deps.registry.subscribe();
        let id = deps.registry.register_manager();

        let throttle_tx = internal_tx.clone();
        let throttle = Throttler::new(config.privacy_throttle(), move |enabled| {
            let _ = throttle_tx.send(Internal::SendPrivacy(enabled));
        });

        let client = Self {
            commands: command_tx,
            credentials: Arc::clone(&deps.credentials),
            status: status_rx,
            events: events.clone(),
            view,
        };

        let actor = ManagerActor {
            id,
            backoff: config.backoff(),
            reconnect: ReconnectContext::new(config.max_reconnect_attempts),
            heartbeat: HeartbeatKeeper::new(config.heartbeat_interval()),
            resync: ResyncScheduler::new(config.resync_interval()),
            config,
            endpoints,
            deps,
            dispatcher,
            events,
            status_tx,
            link_tx,
            internal_tx,
            next_link: 1,
            channel: Channel::Idle,
            state: ConnectionState::Disconnected,
            error: None,
            privacy_mode,
            reconnect_timer: None,
            settle_timer: None,
            handshake_timer: None,
            throttle,
        };

        log::info!("Presence manager {} started", id);
        tokio::spawn(actor.run(command_rx, link_rx, internal_rx, shared_rx, logout));
        Ok(client)
    }

    fn send(&self, command: Command) -> Result<(), PresenceError> {
        self.commands.send(command).map_err(|_| PresenceError::ClientStopped)
    }

    /// Starts connecting. Fails fast, without any network I/O, when no bearer
    /// token is available.
    pub fn connect(&self) -> Result<(), PresenceError> {
        if self.credentials.bearer_token().is_none() {
            log::warn!("Presence connect refused: no credential available");
            self.send(Command::Unauthenticated)?;
            return Err(PresenceError::Unauthenticated);
        }
        self.send(Command::Connect)
    }

    /// Cancels any pending retry, closes the channel and clears presence.
    /// Idempotent.
    pub fn disconnect(&self) -> Result<(), PresenceError> {
        self.send(Command::Disconnect)
    }

    /// What the logout listener does: stop timers and disconnect with the
    /// logout reason.
    pub fn cleanup(&self) -> Result<(), PresenceError> {
        self.send(Command::Cleanup)
    }

    /// Best-effort send. Dropped with a warning when the channel is not open.
    pub fn send_frame(&self, frame: OutboundFrame) -> Result<(), PresenceError> {
        self.send(Command::Send(frame))
    }

    /// Persists the privacy flag and mirrors it to the server (throttled).
    pub fn set_privacy_mode(&self, enabled: bool) -> Result<(), PresenceError> {
        self.send(Command::SetPrivacy(enabled))
    }

    /// Asks the server for a fresh snapshot.
    pub fn request_update(&self) -> Result<(), PresenceError> {
        self.send(Command::RequestUpdate)
    }

    /// Announces a task start or completion to other users.
    pub fn publish_task_update(&self, action: TaskAction, task: Value) -> Result<(), PresenceError> {
        self.send(Command::PublishTask { action, task })
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Watch receiver for status changes.
    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Whether the channel is open.
    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected
    }

    /// Local privacy flag.
    pub fn privacy_mode(&self) -> bool {
        self.status.borrow().privacy_mode
    }

    /// Subscribes to presence events.
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    /// Read-only presence view.
    pub fn presence(&self) -> PresenceView {
        self.view.clone()
    }
}

struct ManagerActor {
    id: ManagerId,
    config: PresenceConfig,
    endpoints: Endpoints,
    backoff: BackoffPolicy,
    deps: ClientDeps,
    dispatcher: Dispatcher,
    events: broadcast::Sender<PresenceEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    next_link: LinkId,
    channel: Channel,
    state: ConnectionState,
    error: Option<String>,
    privacy_mode: bool,
    reconnect: ReconnectContext,
    reconnect_timer: Option<CancellationToken>,
    settle_timer: Option<CancellationToken>,
    handshake_timer: Option<CancellationToken>,
    heartbeat: HeartbeatKeeper,
    resync: ResyncScheduler,
    throttle: Throttler<bool>,
}

async fn logout_signal(rx: &mut Option<broadcast::Receiver<()>>) {
    loop {
        let Some(receiver) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match receiver.recv().await {
            Ok(()) | Err(RecvError::Lagged(_)) => return,
            Err(RecvError::Closed) => *rx = None,
        }
    }
}

impl ManagerActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
        mut shared_rx: broadcast::Receiver<SharedLinkEvent>,
        mut logout: Option<broadcast::Receiver<()>>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        log::debug!("Presence manager {}: all handles dropped", self.id);
                        self.disconnect(CLIENT_DISCONNECT_REASON);
                        break;
                    }
                },
                Some(event) = link_rx.recv() => self.handle_link_event(event),
                Some(internal) = internal_rx.recv() => self.handle_internal(internal),
                shared = shared_rx.recv() => match shared {
                    Ok(event) => self.handle_shared(event),
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Presence manager {} missed {} shared link event(s)", self.id, skipped);
                    }
                    Err(RecvError::Closed) => {}
                },
                _ = logout_signal(&mut logout) => {
                    log::info!("Logout received, cleaning up presence manager {}", self.id);
                    self.disconnect(USER_LOGOUT_REASON);
                }
            }
        }
        log::info!("Presence manager {} stopped", self.id);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Unauthenticated => {
                self.error = Some(PresenceError::Unauthenticated.to_string());
                self.publish_status();
            }
            Command::Disconnect => self.disconnect(CLIENT_DISCONNECT_REASON),
            Command::Cleanup => self.disconnect(USER_LOGOUT_REASON),
            Command::Send(frame) => self.send_frame(frame),
            Command::SetPrivacy(enabled) => self.set_privacy_mode(enabled),
            Command::RequestUpdate => self.send_frame(OutboundFrame::RequestSnapshot),
            Command::PublishTask { action, task } => self.send_frame(OutboundFrame::TaskUpdate { action, task }),
        }
    }

    fn connect(&mut self) {
        match &self.channel {
            Channel::Owned(link) if link.opened => {
                log::debug!("Presence link {} already open, refreshing", link.id);
                self.send_frame(OutboundFrame::RequestSnapshot);
            }
            Channel::Adopted(_) => {
                log::debug!("Shared presence link already adopted, refreshing");
                self.send_frame(OutboundFrame::RequestSnapshot);
            }
            Channel::Owned(_) | Channel::Following => {
                log::debug!("Presence connect ignored: already connecting");
            }
            Channel::Idle if self.reconnect_timer.is_some() => {
                log::debug!("Presence connect ignored: reconnect already scheduled");
            }
            Channel::Idle => {
                self.error = None;
                self.open_channel();
            }
        }
    }

    /// Opens, follows or adopts a link. Also the target of scheduled retries.
    fn open_channel(&mut self) {
        if let Some(handle) = self.deps.registry.open_link(self.id) {
            self.adopt(handle);
            return;
        }
        if self.deps.registry.is_occupied() {
            log::info!("Presence manager {} waiting for a shared link that is still opening", self.id);
            self.channel = Channel::Following;
            self.set_state(ConnectionState::Connecting);
            return;
        }
        let Some(token) = self.deps.credentials.bearer_token() else {
            log::warn!("Presence manager {}: credential disappeared, not connecting", self.id);
            self.reconnect.reset();
            self.error = Some(PresenceError::Unauthenticated.to_string());
            self.set_state(ConnectionState::Disconnected);
            return;
        };
        self.open_owned(EndpointKind::Primary, token);
    }

    fn open_owned(&mut self, endpoint: EndpointKind, token: String) {
        let id = self.next_link;
        self.next_link += 1;
        let url = self.endpoints.get(endpoint).clone();
        log::info!("Presence link {}: connecting to {:?} endpoint {}", id, endpoint, url);

        let sink = TransportSink::new(id, self.link_tx.clone());
        let handle = self.deps.connector.open(&url, sink);
        self.deps.registry.claim(self.id, id, handle.clone());
        self.channel = Channel::Owned(OwnedLink {
            id,
            endpoint,
            handle,
            token,
            opened: false,
            settled: false,
        });
        self.set_state(ConnectionState::Connecting);
    }

    fn adopt(&mut self, handle: TransportHandle) {
        log::info!("Presence manager {} adopting the shared link", self.id);
        handle.send_text(OutboundFrame::RequestSnapshot.to_text());
        self.channel = Channel::Adopted(handle);
        self.reconnect.is_reconnecting = false;
        self.error = None;
        self.set_state(ConnectionState::Open);
        self.emit(PresenceEvent::Connected);
    }

    fn owned_link(&mut self, id: LinkId) -> Option<&mut OwnedLink> {
        match &mut self.channel {
            Channel::Owned(link) if link.id == id => Some(link),
            _ => None,
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        let LinkEvent { link: id, event } = event;
        let Some(link) = self.owned_link(id) else {
            log::trace!("Dropping event from abandoned presence link {}: {:?}", id, event);
            return;
        };

        match event {
            TransportEvent::Opened => {
                link.opened = true;
                let handle = link.handle.clone();
                let token = link.token.clone();
                log::info!("Presence link {} open, authenticating with {}", id, redact(&token));
                self.deps.registry.mark_open(self.id, id);
                self.set_state(ConnectionState::Open);
                handle.send_text(OutboundFrame::Authenticate { token }.to_text());

                let settle = self.config.settle_delay();
                self.settle_timer = Some(self.fire_after(settle, Internal::Settled(id)));
                if let Some(timeout) = self.config.handshake_timeout() {
                    self.handshake_timer = Some(self.fire_after(timeout, Internal::HandshakeTimeout(id)));
                }
            }
            TransportEvent::Message(text) => {
                self.deps.registry.publish(self.id, &text);
                self.handle_frame(&text);
            }
            TransportEvent::Error(message) => {
                if !link.opened && link.endpoint == EndpointKind::Primary {
                    let token = link.token.clone();
                    log::warn!("Primary presence endpoint failed ({}), trying the direct endpoint", message);
                    self.open_owned(EndpointKind::Fallback, token);
                } else {
                    log::warn!("Presence link {} error: {}", id, message);
                    self.error = Some(message);
                    self.publish_status();
                }
            }
            TransportEvent::Closed { code, reason } => {
                if !link.opened && link.endpoint == EndpointKind::Primary {
                    let token = link.token.clone();
                    log::warn!(
                        "Primary presence endpoint closed before opening ({} {}), trying the direct endpoint",
                        code,
                        reason
                    );
                    self.open_owned(EndpointKind::Fallback, token);
                } else {
                    self.on_owned_closed(code, reason);
                }
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let dispatched = self.dispatcher.dispatch(text);
        if !dispatched.is_valid() {
            return;
        }
        self.disarm_handshake_timer();
        match dispatched {
            // An error reply is not proof the channel works, so the budget stays.
            Dispatched::ServerError(message) => {
                self.error = Some(message);
                self.publish_status();
            }
            _ => self.confirm_channel(),
        }
    }

    /// The server answered on the current channel: the retry budget is refilled.
    fn confirm_channel(&mut self) {
        if self.reconnect.attempts == 0 && !self.reconnect.is_reconnecting {
            return;
        }
        log::info!(
            "Presence channel confirmed after {} retry attempt(s)",
            self.reconnect.attempts
        );
        self.reconnect.reset();
        self.publish_status();
    }

    fn on_owned_closed(&mut self, code: u16, reason: String) {
        let Channel::Owned(link) = std::mem::replace(&mut self.channel, Channel::Idle) else {
            return;
        };
        log::info!("Presence link {} closed ({} {})", link.id, code, reason);
        self.deps.registry.release(self.id, link.id, code, &reason);
        self.stop_link_timers();
        self.set_state(ConnectionState::Disconnected);
        self.emit(PresenceEvent::Disconnected {
            code,
            reason: reason.clone(),
        });
        self.after_close(code, &reason, true);
    }

    /// Applies the close policy once the channel is gone.
    fn after_close(&mut self, code: u16, reason: &str, surface_notice: bool) {
        match classify_close(code, reason) {
            CloseKind::Terminal(notice) => {
                log::info!("Presence channel closed for good ({} {})", code, reason);
                self.reconnect.reset();
                if let Some(notice) = notice.filter(|_| surface_notice) {
                    log::warn!("{}", notice);
                    self.error = Some(notice.message().to_string());
                    self.emit(PresenceEvent::Notice(notice));
                }
                self.publish_status();
            }
            CloseKind::Retryable => self.schedule_reconnect(),
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect.exhausted() {
            log::error!(
                "Presence service unreachable after {} attempt(s), giving up",
                self.reconnect.attempts
            );
            self.reconnect.reset();
            self.error = Some(Notice::ServiceUnreachable.message().to_string());
            self.emit(PresenceEvent::Notice(Notice::ServiceUnreachable));
            self.publish_status();
            return;
        }

        let delay = self.backoff.delay(self.reconnect.attempts);
        self.reconnect.attempts += 1;
        self.reconnect.is_reconnecting = true;
        log::info!(
            "Reconnecting presence channel in {:?} (attempt {}/{})",
            delay,
            self.reconnect.attempts,
            self.reconnect.max_attempts
        );
        self.reconnect_timer = Some(self.fire_after(delay, Internal::ReconnectDue));
        self.emit(PresenceEvent::Reconnecting {
            attempt: self.reconnect.attempts,
            delay,
        });
        self.publish_status();
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Settled(id) => self.on_settled(id),
            Internal::HandshakeTimeout(id) => {
                let Some(link) = self.owned_link(id) else { return };
                log::warn!("Presence link {} silent after opening, abandoning it", id);
                link.handle.close(HANDSHAKE_TIMEOUT_CODE, HANDSHAKE_TIMEOUT_REASON);
                self.handshake_timer = None;
                self.on_owned_closed(HANDSHAKE_TIMEOUT_CODE, HANDSHAKE_TIMEOUT_REASON.to_string());
            }
            Internal::ReconnectDue => {
                self.reconnect_timer = None;
                if matches!(self.channel, Channel::Idle) {
                    self.open_channel();
                }
            }
            Internal::HeartbeatDue => {
                if self.is_open() {
                    self.send_frame(OutboundFrame::Heartbeat);
                }
            }
            Internal::ResyncDue => {
                if self.is_open() {
                    log::debug!("Periodic presence resync");
                    self.send_frame(OutboundFrame::RequestSnapshot);
                }
            }
            Internal::SendPrivacy(enabled) => self.send_frame(OutboundFrame::PrivacyMode { enabled }),
        }
    }

    fn on_settled(&mut self, id: LinkId) {
        let privacy_mode = self.privacy_mode;
        let Some(link) = self.owned_link(id).filter(|link| link.opened && !link.settled) else {
            return;
        };
        link.settled = true;
        let handle = link.handle.clone();
        self.settle_timer = None;

        if privacy_mode {
            handle.send_text(OutboundFrame::PrivacyMode { enabled: true }.to_text());
        }
        handle.send_text(OutboundFrame::RequestSnapshot.to_text());

        let tx = self.internal_tx.clone();
        self.heartbeat.start(move || {
            let _ = tx.send(Internal::HeartbeatDue);
        });
        let tx = self.internal_tx.clone();
        self.resync.start(move || {
            let _ = tx.send(Internal::ResyncDue);
        });

        self.reconnect.is_reconnecting = false;
        self.error = None;
        log::info!("Presence link {} ready", id);
        self.emit(PresenceEvent::Connected);
        self.publish_status();
    }

    fn handle_shared(&mut self, event: SharedLinkEvent) {
        match event {
            SharedLinkEvent::Opened { owner } if owner != self.id => {
                if matches!(self.channel, Channel::Following) {
                    if let Some(handle) = self.deps.registry.open_link(self.id) {
                        self.adopt(handle);
                    }
                }
            }
            SharedLinkEvent::Frame { owner, text } if owner != self.id => {
                if matches!(self.channel, Channel::Adopted(_)) {
                    self.handle_frame(&text);
                }
            }
            SharedLinkEvent::Closed { owner, code, reason } if owner != self.id => {
                if matches!(self.channel, Channel::Adopted(_) | Channel::Following) {
                    log::info!("Shared presence link closed by its owner ({} {})", code, reason);
                    self.channel = Channel::Idle;
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(PresenceEvent::Disconnected {
                        code,
                        reason: reason.clone(),
                    });
                    // The owner already told the user about capacity refusals.
                    self.after_close(code, &reason, false);
                }
            }
            _ => {}
        }
    }

    fn disconnect(&mut self, reason: &str) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.cancel();
        }
        self.reconnect.reset();

        let was_active = !matches!(self.channel, Channel::Idle);
        if was_active {
            self.set_state(ConnectionState::Closing);
        }
        match std::mem::replace(&mut self.channel, Channel::Idle) {
            Channel::Owned(link) => {
                log::info!("Closing presence link {} ({})", link.id, reason);
                link.handle.close(CLOSE_NORMAL, reason);
                self.deps.registry.release(self.id, link.id, CLOSE_NORMAL, reason);
            }
            Channel::Adopted(_) | Channel::Following => {
                log::info!("Presence manager {} detaching from the shared link", self.id);
            }
            Channel::Idle => {}
        }

        self.stop_link_timers();
        self.dispatcher.clear();
        self.set_state(ConnectionState::Disconnected);
        if was_active {
            self.emit(PresenceEvent::Disconnected {
                code: CLOSE_NORMAL,
                reason: reason.to_string(),
            });
        }
    }

    fn set_privacy_mode(&mut self, enabled: bool) {
        self.privacy_mode = enabled;
        if let Err(e) = self.deps.preferences.save_privacy_mode(enabled) {
            log::error!("Failed to persist privacy mode: {}", e);
        }
        self.emit(PresenceEvent::PrivacyModeChanged(enabled));
        self.publish_status();
        if self.is_open() {
            self.throttle.call(enabled);
        }
    }

    fn open_handle(&self) -> Option<&TransportHandle> {
        match &self.channel {
            Channel::Owned(link) if link.opened => Some(&link.handle),
            Channel::Adopted(handle) => Some(handle),
            _ => None,
        }
    }

    fn is_open(&self) -> bool {
        self.open_handle().is_some()
    }

    fn send_frame(&mut self, frame: OutboundFrame) {
        match self.open_handle() {
            Some(handle) => {
                log::trace!("Sending {} frame", frame.kind());
                if !handle.send_text(frame.to_text()) {
                    log::warn!("Presence link gone, {} frame dropped", frame.kind());
                }
            }
            None => log::warn!("Presence channel not open, {} frame dropped", frame.kind()),
        }
    }

    fn fire_after(&self, delay: Duration, event: Internal) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(event);
                }
            }
        });
        token
    }

    fn disarm_handshake_timer(&mut self) {
        if let Some(timer) = self.handshake_timer.take() {
            timer.cancel();
        }
    }

    fn stop_link_timers(&mut self) {
        if let Some(timer) = self.settle_timer.take() {
            timer.cancel();
        }
        self.disarm_handshake_timer();
        self.heartbeat.stop();
        self.resync.stop();
        self.throttle.cancel_pending();
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::debug!("Presence manager {}: {} -> {}", self.id, self.state, state);
            self.state = state;
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let status = ConnectionStatus {
            state: self.state,
            is_connected: self.state == ConnectionState::Open,
            is_loading: self.state == ConnectionState::Connecting,
            is_reconnecting: self.reconnect.is_reconnecting,
            error: self.error.clone(),
            reconnect_attempts: self.reconnect.attempts,
            privacy_mode: self.privacy_mode,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn emit(&self, event: PresenceEvent) {
        let _ = self.events.send(event);
    }
}
