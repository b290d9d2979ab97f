//! Connection state machine for interface channels.
//!
//! Every entry into `Connected` bumps an epoch. Waiting for "the next
//! reconnect" is then a wait for an epoch above a snapshot taken before the
//! action that bounces the socket, so an open event that happened before the
//! snapshot can never satisfy the wait.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Lost an established connection, dialing again
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Dial,
    Opened,
    Closed,
    Shutdown,
}

impl ConnectionState {
    /// Transition for `event`; events that make no sense in a state leave it unchanged.
    pub fn on(self, event: ConnectionEvent) -> ConnectionState {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (self, event) {
            (_, Shutdown) => Disconnected,
            (Disconnected, Dial) => Connecting,
            (Connecting, Opened) => Connected,
            // Initial dial failed
            (Connecting, Closed) => Disconnected,
            (Connected, Closed) => Reconnecting,
            (Reconnecting, Opened) => Connected,
            (state, _) => state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Number of times the channel has entered `Connected`
    pub epoch: u64,
}

/// Shared, observable connection status
#[derive(Debug)]
pub struct ConnectionTracker {
    tx: watch::Sender<ConnectionStatus>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            epoch: 0,
        });
        Self { tx }
    }

    /// Apply `event` and return the resulting status.
    pub fn apply(&self, event: ConnectionEvent) -> ConnectionStatus {
        self.tx.send_modify(|status| {
            let next = status.state.on(event);
            if next == ConnectionState::Connected && status.state != ConnectionState::Connected {
                status.epoch += 1;
            }
            status.state = next;
        });
        *self.tx.borrow()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }
}

/// Resolve once the channel is connected with an epoch above `since_epoch`.
pub async fn wait_reconnected(
    rx: &mut watch::Receiver<ConnectionStatus>,
    since_epoch: u64,
) -> Result<ConnectionStatus, watch::error::RecvError> {
    let status = rx
        .wait_for(|s| s.state == ConnectionState::Connected && s.epoch > since_epoch)
        .await?;
    Ok(*status)
}
