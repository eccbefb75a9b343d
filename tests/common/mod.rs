#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{FutureExt as _, SinkExt as _, StreamExt as _, future};
use resilient_socket::config::{ConnectionConfig, Observers};
use resilient_socket::credential::CredentialStore;
use resilient_socket::error::Error;
use resilient_socket::transport::{Link, OpenRequest, Transport};
use resilient_socket::{CloseFrame, ConnectionManager, Frame, Payload, Snapshot};
use secrecy::ExposeSecret as _;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

pub const ENDPOINT: &str = "wss://advisor.example.com/ws/chat";
pub const TOKEN: &str = "session-token";

/// Long enough that no heartbeat fires unless a test asks for one.
pub const QUIET_HEARTBEAT: Duration = Duration::from_secs(24 * 60 * 60);

/// Route library logs to the test output. Filtered by `RUST_LOG`; safe to call from every test.
pub fn init_tracing() {
    _ = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// What the next call to [`MockTransport::open`] does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    Reject,
    /// Never completes the handshake
    Stall,
    /// Opens, but never accepts an outbound frame
    Unresponsive,
}

#[derive(Debug, Clone)]
pub struct OpenRecord {
    pub at: Instant,
    pub url: String,
    pub token: String,
}

/// Server side of an accepted link.
pub struct MockPeer {
    to_client: fmpsc::UnboundedSender<resilient_socket::Result<Frame>>,
    from_client: fmpsc::UnboundedReceiver<(Instant, Frame)>,
}

impl MockPeer {
    pub fn send_text(&self, text: &str) {
        self.to_client
            .unbounded_send(Ok(Frame::Message(Payload::from(text))))
            .unwrap();
    }

    pub fn close(&self, code: u16, reason: &str) {
        self.to_client
            .unbounded_send(Ok(Frame::Close(CloseFrame::new(code, reason))))
            .unwrap();
    }

    pub fn fail(&self, reason: &str) {
        self.to_client
            .unbounded_send(Err(Error::rejected(reason)))
            .unwrap();
    }

    /// Frames the client has written so far, with the time they were written.
    pub fn drain(&mut self) -> Vec<(Instant, Frame)> {
        let mut frames = Vec::new();
        while let Some(Some(frame)) = self.from_client.next().now_or_never() {
            frames.push(frame);
        }
        frames
    }
}

struct Inner {
    script: VecDeque<Outcome>,
    opens: Vec<OpenRecord>,
    peers: mpsc::UnboundedSender<MockPeer>,
}

/// Scripted in-memory transport. Outcomes are consumed in order; once the script is empty
/// every attempt is accepted.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<Inner>>,
}

impl MockTransport {
    pub fn new<I: IntoIterator<Item = Outcome>>(
        script: I,
    ) -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(Mutex::new(Inner {
                script: script.into_iter().collect(),
                opens: Vec::new(),
                peers,
            })),
        };
        (transport, peer_rx)
    }

    pub fn opens(&self) -> Vec<OpenRecord> {
        self.inner.lock().unwrap().opens.clone()
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().unwrap().opens.len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, request: OpenRequest) -> resilient_socket::Result<Link> {
        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            inner.opens.push(OpenRecord {
                at: Instant::now(),
                url: request.authenticated_url().to_string(),
                token: request.credential.expose_secret().to_owned(),
            });
            let outcome = inner.script.pop_front().unwrap_or(Outcome::Accept);
            if outcome == Outcome::Accept {
                let (to_client, client_rx) = fmpsc::unbounded();
                let (client_tx, from_client) = fmpsc::unbounded();
                let sink = client_tx
                    .sink_map_err(|e| Error::rejected(e.to_string()))
                    .with(|frame: Frame| future::ready(Ok::<_, Error>((Instant::now(), frame))));
                _ = inner.peers.send(MockPeer {
                    to_client,
                    from_client,
                });
                return Ok(Link::new(sink, client_rx));
            }
            if outcome == Outcome::Unresponsive {
                let (to_client, client_rx) = fmpsc::unbounded();
                let (_, from_client) = fmpsc::unbounded();
                let sink = futures::sink::unfold((), |(), _frame: Frame| {
                    future::pending::<Result<(), Error>>()
                });
                _ = inner.peers.send(MockPeer {
                    to_client,
                    from_client,
                });
                return Ok(Link::new(sink, client_rx));
            }
            outcome
        };

        match outcome {
            Outcome::Stall => future::pending().await,
            _ => Err(Error::rejected("connection refused")),
        }
    }
}

/// Test defaults: one second base delay, three attempts, no heartbeat traffic.
pub struct Settings {
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub observers: Observers,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(1000),
            max_reconnect_attempts: 3,
            heartbeat_interval: QUIET_HEARTBEAT,
            observers: Observers::default(),
        }
    }
}

impl Settings {
    pub fn build(self) -> ConnectionConfig {
        ConnectionConfig::builder()
            .endpoint(ENDPOINT)
            .reconnect_interval(self.reconnect_interval)
            .max_reconnect_attempts(self.max_reconnect_attempts)
            .heartbeat_interval(self.heartbeat_interval)
            .observers(self.observers)
            .build()
    }
}

/// Start a manager over `transport` with a credential already available.
pub fn start(
    settings: Settings,
    transport: MockTransport,
) -> (ConnectionManager, CredentialStore) {
    let store = CredentialStore::new(None);
    store.set(TOKEN);
    let manager =
        ConnectionManager::with_transport(settings.build(), store.watch(), transport).unwrap();
    (manager, store)
}

pub async fn wait_for<F: FnMut(&Snapshot) -> bool>(
    manager: &ConnectionManager,
    predicate: F,
) -> Snapshot {
    let mut rx = manager.state_receiver();
    timeout(Duration::from_secs(24 * 60 * 60), rx.wait_for(predicate))
        .await
        .expect("timed out waiting for snapshot")
        .expect("connection task ended")
        .clone()
}

pub async fn next_peer(peers: &mut mpsc::UnboundedReceiver<MockPeer>) -> MockPeer {
    timeout(Duration::from_secs(24 * 60 * 60), peers.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("transport dropped")
}

/// Let the connection task process everything that is ready without moving the clock.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub fn assert_elapsed(from: Instant, to: Instant, expected: Duration) {
    let elapsed = to.duration_since(from);
    assert!(
        elapsed >= expected && elapsed <= expected + Duration::from_millis(5),
        "expected {expected:?}, got {elapsed:?}"
    );
}

pub fn text_frames(frames: &[(Instant, Frame)]) -> Vec<(Instant, Value)> {
    frames
        .iter()
        .filter_map(|(at, frame)| match frame {
            Frame::Message(Payload::Text(text)) => {
                Some((*at, serde_json::from_str(text).unwrap_or(Value::Null)))
            }
            _ => None,
        })
        .collect()
}

pub fn is_heartbeat(value: &Value) -> bool {
    value["type"] == "heartbeat"
}
