#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use url::Url;

use crate::backoff::Backoff;
use crate::error::Error;
use crate::message::{CloseFrame, Payload};

const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_TOKEN_PARAM: &str = "token";

type OpenHandler = Arc<dyn Fn() + Send + Sync>;
type CloseHandler = Arc<dyn Fn(&CloseFrame) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;
type MessageHandler = Arc<dyn Fn(&Payload) + Send + Sync>;

/// Configuration for a [`crate::ConnectionManager`]. Immutable once the manager is built;
/// pointing at a different endpoint requires a new manager.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use resilient_socket::config::{ConnectionConfig, Observers};
///
/// let config = ConnectionConfig::builder()
///     .endpoint("wss://advisor.example.com/ws/chat")
///     .reconnect_interval(Duration::from_secs(1))
///     .max_reconnect_attempts(3)
///     .observers(Observers::default().on_open(|| println!("connected")))
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct ConnectionConfig {
    /// Target `ws://` or `wss://` address. Validated when the manager is created.
    #[builder(into)]
    endpoint: String,
    /// Values for the `Sec-WebSocket-Protocol` header
    #[builder(default)]
    protocols: Vec<String>,
    /// Base delay for the first reconnect attempt. The default is three (3) seconds.
    #[builder(default = DEFAULT_RECONNECT_INTERVAL)]
    reconnect_interval: Duration,
    /// Consecutive failures tolerated before the manager gives up. The default is five (5).
    #[builder(default = DEFAULT_MAX_RECONNECT_ATTEMPTS)]
    max_reconnect_attempts: u32,
    /// How often a keep-alive is sent while connected. The default is thirty (30) seconds.
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL)]
    heartbeat_interval: Duration,
    /// Optional upper bound on the reconnect delay
    max_reconnect_delay: Option<Duration>,
    /// Optional random delay added on top of each reconnect delay
    reconnect_jitter: Option<Duration>,
    /// Query parameter carrying the credential during the handshake
    #[builder(default = DEFAULT_TOKEN_PARAM.to_owned())]
    token_param: String,
    /// Connect automatically whenever a credential becomes available
    #[builder(default = true)]
    auto_connect: bool,
    #[builder(default)]
    observers: Observers,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("endpoint", &self.endpoint)
            .field("protocols", &self.protocols)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("max_reconnect_delay", &self.max_reconnect_delay)
            .field("reconnect_jitter", &self.reconnect_jitter)
            .field("token_param", &self.token_param)
            .field("auto_connect", &self.auto_connect)
            .field("observers", &self.observers)
            .finish()
    }
}

impl ConnectionConfig {
    /// Check the configuration and resolve the endpoint.
    pub(crate) fn validate(&self) -> crate::Result<Url> {
        if self.endpoint.trim().is_empty() {
            return Err(Error::validation("endpoint must not be empty"));
        }

        let url = Url::parse(&self.endpoint)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "endpoint scheme must be ws or wss, got {}",
                url.scheme()
            )));
        }

        if self.heartbeat_interval.is_zero() {
            return Err(Error::validation("heartbeat interval must be non-zero"));
        }

        if self.token_param.is_empty() {
            return Err(Error::validation("token parameter name must not be empty"));
        }

        Ok(url)
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    #[must_use]
    pub fn max_reconnect_attempts(&self) -> u32 {
        self.max_reconnect_attempts
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    #[must_use]
    pub fn token_param(&self) -> &str {
        &self.token_param
    }

    #[must_use]
    pub fn auto_connect(&self) -> bool {
        self.auto_connect
    }

    /// The reconnect delay policy described by this configuration.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.reconnect_interval)
            .with_max_delay(self.max_reconnect_delay)
            .with_jitter(self.reconnect_jitter)
    }

    pub(crate) fn observers(&self) -> &Observers {
        &self.observers
    }
}

/// Callbacks invoked from the manager's task as the connection changes.
///
/// Callbacks must not block; hand heavy work off to another task.
#[derive(Clone, Default)]
pub struct Observers {
    on_open: Option<OpenHandler>,
    on_close: Option<CloseHandler>,
    on_error: Option<ErrorHandler>,
    on_message: Option<MessageHandler>,
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_message", &self.on_message.is_some())
            .finish()
    }
}

impl Observers {
    #[must_use]
    pub fn on_open<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    /// Called whenever a link or handshake ends. Failures report code 1006 after `on_error`;
    /// `disconnect()` and `reconnect()` report 1000 for a link that was open.
    #[must_use]
    pub fn on_close<F: Fn(&CloseFrame) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_error<F: Fn(&Error) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_message<F: Fn(&Payload) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub(crate) fn opened(&self) {
        if let Some(f) = &self.on_open {
            f();
        }
    }

    pub(crate) fn closed(&self, frame: &CloseFrame) {
        if let Some(f) = &self.on_close {
            f(frame);
        }
    }

    pub(crate) fn errored(&self, error: &Error) {
        if let Some(f) = &self.on_error {
            f(error);
        }
    }

    pub(crate) fn message(&self, payload: &Payload) {
        if let Some(f) = &self.on_message {
            f(payload);
        }
    }
}
