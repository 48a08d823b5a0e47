//! Connection state tracking.
//!
//! Every change to a device's connection state goes through
//! [`ConnectionTracker::apply`], whether it comes from an explicit connect or
//! from a link-layer notification.

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Connection state for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected to the device.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected to the device.
    Connected,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Inputs to the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A connect attempt is starting.
    ConnectStarted,
    /// A connect attempt failed or timed out.
    ConnectFailed,
    /// The link is up, reported by the connect primitive or the stack.
    LinkUp,
    /// The link went down.
    LinkDown,
}

impl Transition {
    /// The state this transition leads to from `from`, or `None` if it is ignored.
    pub fn next(self, from: ConnectionState) -> Option<ConnectionState> {
        use ConnectionState::*;

        match (self, from) {
            (Self::ConnectStarted, Disconnected) => Some(Connecting),
            (Self::ConnectStarted, _) => None,
            // A failed attempt must not undo a link-up that raced it.
            (Self::ConnectFailed, Connecting) => Some(Disconnected),
            (Self::ConnectFailed, _) => None,
            (Self::LinkUp, _) => Some(Connected),
            (Self::LinkDown, _) => Some(Disconnected),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// The address of the device.
    pub address: String,
    /// The previous connection state.
    pub previous: ConnectionState,
    /// The new connection state.
    pub state: ConnectionState,
}

/// Owns the connection state of one device.
pub struct ConnectionTracker {
    /// Device address, for events and logs.
    address: String,
    /// Current connection state.
    state: RwLock<ConnectionState>,
    /// Channel for connection events.
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionTracker {
    /// Create a tracker in the `Disconnected` state.
    pub fn new(address: impl Into<String>) -> Self {
        let (event_tx, _) = broadcast::channel(16);

        Self {
            address: address.into(),
            state: RwLock::new(ConnectionState::Disconnected),
            event_tx,
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Apply a transition. Returns the event if the state changed.
    pub fn apply(&self, transition: Transition) -> Option<ConnectionEvent> {
        let (old_state, new_state) = {
            let mut state = self.state.write();
            let old = *state;
            let Some(new) = transition.next(old) else {
                trace!("{}: ignoring {:?} while {}", self.address, transition, old);
                return None;
            };
            *state = new;
            (old, new)
        };

        if old_state == new_state {
            return None;
        }

        debug!(
            "{}: connection state changed: {} -> {}",
            self.address, old_state, new_state
        );

        let event = ConnectionEvent {
            address: self.address.clone(),
            previous: old_state,
            state: new_state,
        };
        let _ = self.event_tx.send(event.clone());

        Some(event)
    }
}

impl std::fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}
