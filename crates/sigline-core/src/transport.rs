use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use url::Url;

use crate::backoff::BackoffCounter;
use crate::config::TransportConfig;
use crate::errors::SignalError;
use crate::services::{CallRouter, CredentialSource, ReachabilityService, Registrar};
use crate::socket::{CLOSE_NORMAL, Socket, SocketEvent, SocketEvents, SocketFactory};
use crate::wire::{self, AckFrame, PendingMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    /// Resume the existing socket.
    Reconnect,
    /// Drop the socket and register the device again.
    Reregister,
}

/// Point-in-time view of the transport, for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSnapshot {
    pub state: TransportState,
    pub pending_messages: usize,
    /// Delay the next retry would wait.
    pub backoff: Duration,
    pub has_socket: bool,
    pub retry: Option<RetryKind>,
}

#[derive(Debug)]
pub(crate) enum Command {
    Connect(Url),
    Disconnect,
    Snapshot(oneshot::Sender<TransportSnapshot>),
    Socket { socket: u64, event: SocketEvent },
}

/// Everything the transport talks to.
pub struct TransportServices {
    pub credentials: Arc<dyn CredentialSource>,
    pub sockets: Arc<dyn SocketFactory>,
    pub router: Box<dyn CallRouter>,
    pub registrar: Arc<dyn Registrar>,
    pub reachability: Arc<dyn ReachabilityService>,
}

/// Handle to the signaling connection.
///
/// The connection itself lives in a background task that owns the socket,
/// every timer and the call router; handles only send it commands. The task
/// stops once the last handle is dropped.
#[derive(Clone)]
pub struct SignalingTransport {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<TransportState>,
}

impl SignalingTransport {
    /// Start the transport task. Must be called from within a tokio runtime.
    pub fn spawn(config: &TransportConfig, services: TransportServices) -> Result<Self, SignalError> {
        config.validate()?;
        let backoff = config.backoff()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(TransportState::Disconnected);

        let actor = TransportActor {
            batching_interval: config.batching_interval(),
            connection_timeout: config.connection_timeout(),
            call_event_prefix: config.call_event_prefix.clone(),
            services,
            commands: tx.downgrade(),
            state_tx,
            state: TransportState::Disconnected,
            socket: None,
            next_socket_id: 0,
            wants_connection: false,
            pending: Vec::new(),
            backoff,
            watchdog: None,
            next_batch: None,
            retry: None,
        };
        tokio::spawn(actor.run(rx));

        Ok(Self {
            commands: tx,
            state: state_rx,
        })
    }

    /// Connect to `endpoint`. Failures are retried in the background.
    pub fn connect(&self, endpoint: Url) {
        self.send(Command::Connect(endpoint));
    }

    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.state.clone()
    }

    /// `None` once the transport task has stopped.
    pub async fn snapshot(&self) -> Option<TransportSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx));
        rx.await.ok()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::warn!("signaling transport task has stopped");
        }
    }
}

struct ActiveSocket {
    id: u64,
    inner: Box<dyn Socket>,
}

struct TransportActor {
    batching_interval: Duration,
    connection_timeout: Duration,
    call_event_prefix: String,
    services: TransportServices,
    commands: mpsc::WeakUnboundedSender<Command>,
    state_tx: watch::Sender<TransportState>,
    state: TransportState,
    socket: Option<ActiveSocket>,
    next_socket_id: u64,
    /// Cleared by `disconnect()`; scheduled retries check it before acting.
    wants_connection: bool,
    pending: Vec<PendingMessage>,
    backoff: BackoffCounter,
    watchdog: Option<Instant>,
    next_batch: Option<Instant>,
    retry: Option<(Instant, RetryKind)>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl TransportActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let watchdog = self.watchdog;
            let retry = self.retry;
            let next_batch = self.next_batch;

            tokio::select! {
                biased;
                _ = sleep_until(watchdog) => self.on_watchdog_fired(),
                _ = sleep_until(retry.map(|(at, _)| at)) => {
                    self.retry = None;
                    if let Some((_, kind)) = retry {
                        self.on_retry_fired(kind);
                    }
                }
                _ = sleep_until(next_batch) => self.on_batch_tick(),
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }
        if let Some(mut socket) = self.socket.take() {
            socket.inner.disconnect();
        }
        tracing::info!("signaling transport stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Connect(endpoint) => self.connect(endpoint),
            Command::Disconnect => self.disconnect(),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Socket { socket, event } => {
                if self.socket.as_ref().map(|s| s.id) != Some(socket) {
                    match event {
                        SocketEvent::Disconnected { code, .. } => {
                            tracing::info!(code, "signaling socket closed on purpose");
                        }
                        other => tracing::debug!(socket, "event from discarded socket: {other:?}"),
                    }
                    return;
                }
                self.on_socket_event(event);
            }
        }
    }

    fn connect(&mut self, endpoint: Url) {
        if self.state == TransportState::Connected {
            tracing::warn!("signaling socket is already connected");
            return;
        }

        if self.socket.is_none() {
            let Some(headers) = self.services.credentials.authorization() else {
                tracing::error!(url = %endpoint, "{}", SignalError::AuthenticationMissing);
                self.wants_connection = false;
                return;
            };
            let id = self.next_socket_id;
            self.next_socket_id += 1;
            let events = SocketEvents::new(id, self.commands.clone());
            let inner = self.services.sockets.create(&endpoint, &headers, events);
            self.socket = Some(ActiveSocket { id, inner });
        }

        tracing::info!(url = %endpoint, "signaling socket connecting");
        self.wants_connection = true;
        self.retry = None;
        self.open_socket();
    }

    fn disconnect(&mut self) {
        self.wants_connection = false;
        self.retry = None;
        let Some(mut socket) = self.socket.take() else {
            tracing::warn!("signaling socket has not been connected");
            return;
        };
        tracing::info!("signaling socket disconnecting");
        self.cancel_timers();
        socket.inner.disconnect();
        self.set_state(TransportState::Disconnected);
    }

    fn reconnect(&mut self) {
        if self.socket.is_none() {
            tracing::warn!("signaling socket has not been connected");
            return;
        }
        if self.state == TransportState::Connected {
            tracing::warn!("signaling socket is already connected");
            return;
        }
        tracing::info!("signaling socket reconnecting");
        self.open_socket();
    }

    /// Start or resume the handshake of the current socket and arm the
    /// watchdog.
    fn open_socket(&mut self) {
        if let Some(socket) = self.socket.as_mut() {
            socket.inner.connect();
            self.set_state(TransportState::Connecting);
            self.watchdog = Some(Instant::now() + self.connection_timeout);
        }
    }

    fn on_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Connected => self.on_connected(),
            SocketEvent::Disconnected { code, reason } => self.on_closed(code, &reason),
            SocketEvent::Binary(bytes) => self.on_frame(&bytes),
            SocketEvent::Text(text) => tracing::info!("signaling socket got text: {text}"),
        }
    }

    fn on_connected(&mut self) {
        if self.state == TransportState::Connected {
            return;
        }
        tracing::info!("signaling socket connected");
        self.set_state(TransportState::Connected);
        self.watchdog = None;
        self.backoff.reset();
        self.next_batch = Some(Instant::now() + self.batching_interval);
        self.services.reachability.refresh();
    }

    fn on_closed(&mut self, code: u16, reason: &str) {
        self.cancel_timers();
        self.set_state(TransportState::Disconnected);

        let delay = self.backoff.next();
        let retry_at = Instant::now() + delay;
        // Numeric comparison against normal closure, kept for backend
        // compatibility even though close codes are not ordinal.
        if code > CLOSE_NORMAL {
            self.socket = None;
            tracing::error!(
                reason,
                "{}, re-registering in {delay:?}",
                SignalError::AbnormalClose { code }
            );
            self.retry = Some((retry_at, RetryKind::Reregister));
        } else {
            tracing::warn!(
                reason,
                "{}, reconnecting in {delay:?}",
                SignalError::UnexpectedClose { code }
            );
            self.retry = Some((retry_at, RetryKind::Reconnect));
        }
    }

    fn on_frame(&mut self, bytes: &[u8]) {
        let (id, message) = match wire::decode_frame(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(len = bytes.len(), "dropping inbound frame: {e}");
                return;
            }
        };
        match AckFrame::new(&id).encode() {
            Ok(ack) => {
                if let Some(socket) = self.socket.as_mut() {
                    socket.inner.write(ack);
                }
            }
            Err(e) => tracing::error!(message_id = %id, "failed to acknowledge message: {e}"),
        }
        tracing::debug!(message_id = %id, event_type = ?message.event_type, "queued inbound event");
        self.pending.push(message);
    }

    fn on_batch_tick(&mut self) {
        self.next_batch = Some(Instant::now() + self.batching_interval);
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        tracing::debug!(count = batch.len(), "processing inbound batch");
        for message in batch {
            if !message.is_call_event(&self.call_event_prefix) {
                tracing::debug!(event_type = ?message.event_type, "discarding non-call event");
                continue;
            }
            let PendingMessage { mut payload, event_type } = message;
            tracing::info!(event_type = ?event_type, "call event");
            let data = payload.get_mut("data").map(Value::take).unwrap_or(Value::Null);
            self.services.router.route_event(data);
        }
    }

    fn on_watchdog_fired(&mut self) {
        self.watchdog = None;
        tracing::warn!("{}, trying to reconnect", SignalError::ConnectionTimeout);
        self.reconnect();
    }

    fn on_retry_fired(&mut self, kind: RetryKind) {
        if !self.wants_connection {
            tracing::debug!(?kind, "retry skipped, disconnect was requested");
            return;
        }
        match kind {
            RetryKind::Reconnect => self.reconnect(),
            RetryKind::Reregister => match self.handle_for_collaborators() {
                Some(transport) => {
                    tracing::info!("re-registering device");
                    self.services.registrar.reregister(transport);
                }
                None => tracing::debug!("transport is shutting down, re-registration skipped"),
            },
        }
    }

    fn handle_for_collaborators(&self) -> Option<SignalingTransport> {
        Some(SignalingTransport {
            commands: self.commands.upgrade()?,
            state: self.state_tx.subscribe(),
        })
    }

    fn cancel_timers(&mut self) {
        self.watchdog = None;
        self.next_batch = None;
    }

    fn set_state(&mut self, state: TransportState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            state: self.state,
            pending_messages: self.pending.len(),
            backoff: self.backoff.current(),
            has_socket: self.socket.is_some(),
            retry: self.retry.map(|(_, kind)| kind),
        }
    }
}
