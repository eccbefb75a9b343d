#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::future::{Future, pending};
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use futures::{SinkExt as _, Stream, StreamExt as _};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep, timeout};
use url::Url;

use crate::Result;
use crate::backoff::Backoff;
use crate::config::ConnectionConfig;
use crate::credential::{Credential, CredentialWatch};
use crate::error::{Error, TransportError};
use crate::message::{self, CloseFrame, Frame, Payload, TypedMessage};
use crate::state::{ConnectionState, Event, Snapshot};
use crate::transport::{Link, OpenRequest, Transport, WsTransport};

/// Broadcast channel capacity for incoming messages.
const BROADCAST_CAPACITY: usize = 1024;

/// Upper bound on the close handshake; a peer that stopped reading must not stall teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type OpenFuture = Pin<Box<dyn Future<Output = Result<Link>> + Send>>;

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Reconnect,
    Send { session: u64, payload: Payload },
}

/// Manages one logical connection: open, heartbeat, reconnect with backoff, and teardown.
///
/// All connection work happens on a background task; the methods on this handle never
/// block. Clones share the same connection. When the last clone is dropped the connection
/// is closed with a normal-closure code and every timer is cancelled.
///
/// # Example
///
/// ```no_run
/// use resilient_socket::ConnectionManager;
/// use resilient_socket::config::ConnectionConfig;
/// use resilient_socket::credential::CredentialStore;
///
/// # async fn example() -> resilient_socket::Result<()> {
/// let credentials = CredentialStore::default();
/// let config = ConnectionConfig::builder()
///     .endpoint("wss://advisor.example.com/ws/chat")
///     .build();
///
/// let connection = ConnectionManager::new(config, credentials.watch())?;
/// // The binder connects as soon as a token is available
/// credentials.set("eyJhbGciOi...");
///
/// let mut rx = connection.subscribe();
/// while let Ok(payload) = rx.recv().await {
///     println!("Received: {payload:?}");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ConnectionManager {
    /// Commands for the supervisor task
    command_tx: mpsc::UnboundedSender<Command>,
    /// Watch channel receiver for the current snapshot
    snapshot_rx: watch::Receiver<Snapshot>,
    /// Broadcast sender for incoming messages
    broadcast_tx: broadcast::Sender<Payload>,
}

impl ConnectionManager {
    /// Create a manager over [`WsTransport`] and start its supervisor task.
    ///
    /// Must be called from within a tokio runtime. Fails fast on an invalid configuration.
    pub fn new(config: ConnectionConfig, credential: CredentialWatch) -> Result<Self> {
        Self::with_transport(config, credential, WsTransport)
    }

    /// Create a manager over a custom [`Transport`].
    pub fn with_transport<T: Transport>(
        config: ConnectionConfig,
        credential: CredentialWatch,
        transport: T,
    ) -> Result<Self> {
        let endpoint = config.validate()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());

        let supervisor = Supervisor {
            backoff: config.backoff(),
            config,
            endpoint,
            transport: Arc::new(transport),
            credential,
            credential_live: true,
            command_rx,
            snapshot_tx,
            broadcast_tx: broadcast_tx.clone(),
            phase: Phase::Idle,
            stopped: false,
        };

        tokio::spawn(supervisor.run());

        Ok(Self {
            command_tx,
            snapshot_rx,
            broadcast_tx,
        })
    }

    /// Open the connection. A no-op while connecting or connected, or when no credential
    /// is available.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Close the connection with a normal-closure code and cancel all timers. Idempotent.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Close any live connection and connect again immediately, skipping the backoff wait.
    ///
    /// Mid-episode this still counts towards `max_reconnect_attempts`.
    pub fn reconnect(&self) {
        self.command(Command::Reconnect);
    }

    /// Send a payload on the live connection.
    ///
    /// Returns `false` without touching the transport unless the state is
    /// [`ConnectionState::Connected`]. Nothing is queued: a payload that cannot be sent now
    /// is dropped.
    pub fn send_message<P: Into<Payload>>(&self, payload: P) -> bool {
        let session = {
            let snapshot = self.snapshot_rx.borrow();
            if !snapshot.is_connected {
                return false;
            }
            snapshot.session
        };

        self.command_tx
            .send(Command::Send {
                session,
                payload: payload.into(),
            })
            .is_ok()
    }

    /// Send `{"type": kind, "data": data, "timestamp": now}` on the live connection.
    pub fn send_typed_message<T: Serialize>(&self, kind: &str, data: &T) -> bool {
        match TypedMessage::new(kind, data).to_payload() {
            Ok(payload) => self.send_message(payload),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(kind, error = %e, "Unable to serialize typed message");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                false
            }
        }
    }

    /// Get the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.snapshot_rx.borrow().state.clone()
    }

    /// Subscribe to snapshot changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_rx.clone()
    }

    /// Subscribe to incoming messages.
    ///
    /// Each call returns a new independent receiver. Multiple subscribers can
    /// receive messages concurrently without blocking each other.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Payload> {
        self.broadcast_tx.subscribe()
    }

    /// Incoming messages as a stream. Yields an error if the consumer lags behind.
    pub fn messages(&self) -> impl Stream<Item = Result<Payload>> + use<> {
        let mut rx = self.subscribe();

        try_stream! {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        yield payload;
                    }
                    Err(RecvError::Lagged(n)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Message stream lagged, missed {n} messages");
                        Err(Error::from(TransportError::Lagged { count: n }))?;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    fn command(&self, command: Command) {
        if self.command_tx.send(command).is_err() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Connection task has terminated, command ignored");
        }
    }
}

/// What the supervisor is currently waiting on. Each phase owns at most one timer, so the
/// heartbeat can only tick while open and the reconnect timer only while waiting.
enum Phase {
    Idle,
    Opening(OpenFuture),
    Open { link: Link, heartbeat: Interval },
    Waiting(Pin<Box<Sleep>>),
}

enum Wake {
    Command(Option<Command>),
    Credential(bool),
    Opened(Result<Link>),
    Inbound(Option<Result<Frame>>),
    Heartbeat,
    RetryDue,
}

/// Owns the transport handle, both timers and the state machine for one manager.
struct Supervisor<T: Transport> {
    config: ConnectionConfig,
    endpoint: Url,
    backoff: Backoff,
    transport: Arc<T>,
    credential: CredentialWatch,
    /// `false` once the credential store has been dropped
    credential_live: bool,
    command_rx: mpsc::UnboundedReceiver<Command>,
    snapshot_tx: watch::Sender<Snapshot>,
    broadcast_tx: broadcast::Sender<Payload>,
    phase: Phase,
    /// Set by `disconnect()`; keeps the credential binder from reviving the connection
    stopped: bool,
}

impl<T: Transport> Supervisor<T> {
    async fn run(mut self) {
        if self.config.auto_connect() && self.credential.is_present() {
            self.connect(false);
        }

        loop {
            match self.next_wake().await {
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Command(None) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("All connection handles dropped, tearing down");
                    self.disconnect().await;
                    break;
                }
                Wake::Credential(live) => self.credential_changed(live),
                Wake::Opened(Ok(link)) => self.opened(link),
                Wake::Opened(Err(e)) => self.failed(&e),
                Wake::Inbound(frame) => self.inbound(frame),
                Wake::Heartbeat => self.heartbeat().await,
                Wake::RetryDue => self.retry(),
            }
        }
    }

    async fn next_wake(&mut self) -> Wake {
        let Self {
            command_rx,
            credential,
            credential_live,
            phase,
            ..
        } = self;

        let phase_wake = async move {
            match phase {
                Phase::Idle => pending().await,
                Phase::Opening(open) => Wake::Opened(open.await),
                Phase::Open { link, heartbeat } => tokio::select! {
                    frame = link.stream.next() => Wake::Inbound(frame),
                    _ = heartbeat.tick() => Wake::Heartbeat,
                },
                Phase::Waiting(delay) => {
                    delay.as_mut().await;
                    Wake::RetryDue
                }
            }
        };

        tokio::select! {
            biased;
            command = command_rx.recv() => Wake::Command(command),
            live = credential.changed(), if *credential_live => Wake::Credential(live),
            wake = phase_wake => wake,
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(true),
            Command::Disconnect => self.disconnect().await,
            Command::Reconnect => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Manual reconnect requested");
                // Skipping the wait does not reset the failure budget
                let fresh_episode = self.snapshot_tx.borrow().state.is_terminal();
                self.close_link().await;
                self.start(true, fresh_episode);
            }
            Command::Send { session, payload } => self.transmit(session, payload).await,
        }
    }

    /// `explicit` is set for caller-issued connects, which clear a previous `disconnect()`.
    /// Only a connect from `Disconnected` or `Failed` starts a fresh episode.
    fn connect(&mut self, explicit: bool) {
        let fresh_episode = self.snapshot_tx.borrow().state.is_terminal();
        self.start(explicit, fresh_episode);
    }

    fn start(&mut self, explicit: bool, fresh_episode: bool) {
        let current = self.snapshot_tx.borrow().state.clone();
        let Some(next) = current.transition(Event::Connect) else {
            #[cfg(feature = "tracing")]
            tracing::trace!(state = ?current, "Already connecting or connected");
            return;
        };

        let Some(credential) = self.credential.current() else {
            #[cfg(feature = "tracing")]
            tracing::debug!("No credential available, not connecting");
            return;
        };

        if explicit {
            self.stopped = false;
        }

        self.begin_open(credential, next, fresh_episode);
    }

    fn begin_open(
        &mut self,
        credential: Credential,
        next: ConnectionState,
        fresh_episode: bool,
    ) {
        let request = OpenRequest {
            endpoint: self.endpoint.clone(),
            protocols: self.config.protocols().to_vec(),
            token_param: self.config.token_param().to_owned(),
            credential,
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.endpoint, "Connecting");

        let transport = Arc::clone(&self.transport);
        // Replacing the phase drops any armed reconnect timer
        self.phase = Phase::Opening(Box::pin(async move { transport.open(request).await }));

        self.snapshot_tx.send_modify(|snapshot| {
            if fresh_episode {
                snapshot.reconnect_attempts = 0;
            }
            snapshot.set_state(next);
        });
    }

    fn opened(&mut self, link: Link) {
        let current = self.snapshot_tx.borrow().state.clone();
        let Some(next) = current.transition(Event::Opened) else {
            self.phase = Phase::Idle;
            return;
        };

        let period = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.phase = Phase::Open { link, heartbeat };

        self.snapshot_tx.send_modify(|snapshot| {
            snapshot.session = snapshot.session.wrapping_add(1);
            snapshot.reconnect_attempts = 0;
            snapshot.error = None;
            snapshot.set_state(next);
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.endpoint, "Connected");

        self.config.observers().opened();
    }

    fn inbound(&mut self, frame: Option<Result<Frame>>) {
        match frame {
            Some(Ok(Frame::Message(payload))) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(?payload, "Received message");

                self.snapshot_tx
                    .send_modify(|snapshot| snapshot.last_message = Some(payload.clone()));
                self.config.observers().message(&payload);
                _ = self.broadcast_tx.send(payload);
            }
            Some(Ok(Frame::Close(close))) => self.dropped(
                format!("connection closed by peer ({}): {}", close.code, close.reason),
                &close,
            ),
            Some(Err(e)) => self.failed(&e),
            None => self.dropped(
                "connection closed without close frame".to_owned(),
                &CloseFrame::abnormal("stream ended"),
            ),
        }
    }

    /// Record a transport error, then follow the drop path with an abnormal closure. Applies
    /// to failed handshakes as well as links that broke while open.
    fn failed(&mut self, error: &Error) {
        #[cfg(feature = "tracing")]
        tracing::warn!(error = %error, "Transport error");

        self.config.observers().errored(error);
        let reason = error.to_string();
        self.dropped(reason.clone(), &CloseFrame::abnormal(reason));
    }

    /// The link or handshake ended without `disconnect()` being called.
    fn dropped(&mut self, reason: String, close: &CloseFrame) {
        #[cfg(feature = "tracing")]
        tracing::warn!(code = close.code, %reason, "Connection dropped");

        self.config.observers().closed(close);
        self.schedule_retry(reason);
    }

    fn schedule_retry(&mut self, reason: String) {
        // Drops the link and its heartbeat, or the pending handshake
        self.phase = Phase::Idle;

        let (current, failures) = {
            let snapshot = self.snapshot_tx.borrow();
            (snapshot.state.clone(), snapshot.reconnect_attempts)
        };
        let event = Event::Dropped {
            failures,
            max_attempts: self.config.max_reconnect_attempts(),
        };
        let Some(next) = current.transition(event) else {
            return;
        };

        let error = match &next {
            ConnectionState::Reconnecting { attempt } => {
                let delay = self.backoff.delay(*attempt);
                #[cfg(feature = "tracing")]
                tracing::warn!(attempt, ?delay, "Scheduling reconnect");
                self.phase = Phase::Waiting(Box::pin(sleep(delay)));
                reason
            }
            ConnectionState::Failed { reason: failure } => {
                #[cfg(feature = "tracing")]
                tracing::error!(last_error = %reason, "Giving up: {failure}");
                failure.clone()
            }
            _ => reason,
        };

        let attempts = failures.saturating_add(1);
        self.snapshot_tx.send_modify(|snapshot| {
            snapshot.reconnect_attempts = attempts;
            snapshot.error = Some(error);
            snapshot.set_state(next);
        });
    }

    fn retry(&mut self) {
        let current = self.snapshot_tx.borrow().state.clone();
        let Some(next) = current.transition(Event::RetryDue) else {
            self.phase = Phase::Idle;
            return;
        };

        match self.credential.current() {
            Some(credential) => self.begin_open(credential, next, false),
            None => {
                // Without a credential the attempt never starts; wait for the binder.
                #[cfg(feature = "tracing")]
                tracing::debug!("No credential available at retry, going idle");
                self.phase = Phase::Idle;
                self.snapshot_tx
                    .send_modify(|snapshot| snapshot.set_state(ConnectionState::Disconnected));
            }
        }
    }

    async fn heartbeat(&mut self) {
        let payload = match message::heartbeat() {
            Ok(payload) => payload,
            Err(e) => {
                self.config.observers().errored(&e);
                return;
            }
        };

        #[cfg(feature = "tracing")]
        tracing::trace!("Sending heartbeat");

        self.write(payload).await;
    }

    async fn transmit(&mut self, session: u64, payload: Payload) {
        let live = self.snapshot_tx.borrow().session == session
            && matches!(self.phase, Phase::Open { .. });
        if !live {
            #[cfg(feature = "tracing")]
            tracing::trace!(session, "Dropping payload for a closed session");
            return;
        }

        self.write(payload).await;
    }

    async fn write(&mut self, payload: Payload) {
        let Phase::Open { link, .. } = &mut self.phase else {
            return;
        };

        let sent = link.sink.send(Frame::Message(payload)).await;
        if let Err(e) = sent {
            self.failed(&e);
        }
    }

    fn credential_changed(&mut self, live: bool) {
        if !live {
            #[cfg(feature = "tracing")]
            tracing::debug!("Credential store dropped");
            self.credential_live = false;
            return;
        }

        if !self.credential.is_present() {
            // Existing sessions are left alone; new attempts will find no credential.
            #[cfg(feature = "tracing")]
            tracing::debug!("Credential cleared");
            return;
        }

        let idle = self.snapshot_tx.borrow().state.is_terminal();
        if self.config.auto_connect() && idle && !self.stopped {
            #[cfg(feature = "tracing")]
            tracing::debug!("Credential available, connecting");
            self.connect(false);
        }
    }

    async fn disconnect(&mut self) {
        self.stopped = true;
        let was_open = self.close_link().await;

        #[cfg(feature = "tracing")]
        tracing::debug!(was_open, "Disconnected");
        #[cfg(not(feature = "tracing"))]
        let _ = was_open;
    }

    /// Cancel whatever the current phase is waiting on, close a live link with the normal
    /// closure code and move to `Disconnected`. Returns whether a link was open.
    async fn close_link(&mut self) -> bool {
        let close = CloseFrame::normal();
        let was_open = match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Open { mut link, .. } => {
                let handshake = async {
                    link.sink.send(Frame::Close(close.clone())).await?;
                    link.sink.close().await?;
                    Ok::<_, Error>(())
                };
                match timeout(CLOSE_TIMEOUT, handshake).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(error = %e, "Unable to send close frame");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;
                    }
                    Err(_elapsed) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(?CLOSE_TIMEOUT, "Close handshake timed out, dropping link");
                    }
                }
                true
            }
            _ => false,
        };

        self.snapshot_tx.send_if_modified(|snapshot| {
            match snapshot.state.transition(Event::Disconnect) {
                Some(next) if next != snapshot.state => {
                    snapshot.set_state(next);
                    true
                }
                _ => false,
            }
        });

        if was_open {
            self.config.observers().closed(&close);
        }
        was_open
    }
}
