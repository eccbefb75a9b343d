//! Connection state machine and the snapshot published to observers.

use std::time::Instant;

use crate::message::Payload;

/// Reason recorded when the reconnect budget runs out.
pub const MAX_ATTEMPTS_REASON: &str = "max reconnection attempts reached";

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected. Initial state, and the state after a deliberate disconnect.
    Disconnected,
    /// Transport handshake in flight
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting out the backoff delay before the next attempt
    Reconnecting {
        /// Consecutive failures in the current episode
        attempt: u32,
    },
    /// Reconnect budget exhausted. No further automatic action is taken.
    Failed {
        /// Why the manager gave up
        reason: String,
    },
}

/// Inputs to [`ConnectionState::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    /// `connect()` with a credential present
    Connect,
    /// Transport reported open
    Opened,
    /// Handshake error or abnormal close. `failures` is the counter before this failure.
    Dropped { failures: u32, max_attempts: u32 },
    /// Backoff delay elapsed
    RetryDue,
    /// `disconnect()`
    Disconnect,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Whether a handshake is in flight.
    #[must_use]
    pub const fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting)
    }

    /// States in which `connect()` is a no-op.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected { .. })
    }

    /// States that only a fresh `connect()` leaves.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed { .. })
    }

    /// Computes the next state, or `None` if `event` has no effect in this state.
    pub(crate) fn transition(&self, event: Event) -> Option<Self> {
        match (self, event) {
            (_, Event::Disconnect) => Some(Self::Disconnected),
            (Self::Connecting | Self::Connected { .. }, Event::Connect) => None,
            (_, Event::Connect) | (Self::Reconnecting { .. }, Event::RetryDue) => {
                Some(Self::Connecting)
            }
            (Self::Connecting, Event::Opened) => Some(Self::Connected {
                since: Instant::now(),
            }),
            (
                Self::Connecting | Self::Connected { .. },
                Event::Dropped {
                    failures,
                    max_attempts,
                },
            ) => {
                let attempt = failures.saturating_add(1);
                if attempt >= max_attempts {
                    Some(Self::Failed {
                        reason: MAX_ATTEMPTS_REASON.to_owned(),
                    })
                } else {
                    Some(Self::Reconnecting { attempt })
                }
            }
            _ => None,
        }
    }
}

/// Read-only view of the manager for the UI layer.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Current lifecycle state
    pub state: ConnectionState,
    /// Shorthand for `state.is_connected()`
    pub is_connected: bool,
    /// True only while a handshake is in flight
    pub is_connecting: bool,
    /// Last error description, cleared on a successful open
    pub error: Option<String>,
    /// Consecutive failures in the current episode, reset on a successful open
    pub reconnect_attempts: u32,
    /// Most recent inbound payload
    pub last_message: Option<Payload>,
    /// Identifies the live transport; outbound payloads from an older session are dropped.
    pub(crate) session: u64,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            is_connected: false,
            is_connecting: false,
            error: None,
            reconnect_attempts: 0,
            last_message: None,
            session: 0,
        }
    }
}

impl Snapshot {
    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.is_connected = state.is_connected();
        self.is_connecting = state.is_connecting();
        self.state = state;
    }
}
