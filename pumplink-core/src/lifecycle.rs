//! Realtime connection lifecycle as an explicit state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected
//!                                         \-> Unauthorized (close 1008)
//! ```
//!
//! The socket callbacks in the client only translate wire events into
//! [`LifecycleEvent`]s; every state change goes through [`transition`].

use serde::Serialize;

/// Close code the backend uses to reject the handshake credential.
pub const CREDENTIAL_REJECTED_CLOSE_CODE: u16 = 1008;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Terminal for the session: credentials have been purged.
    Unauthorized,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Unauthorized => "unauthorized",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    ConnectStarted,
    /// The channel opened and the handshake frame went out.
    Opened,
    Error,
    /// The remote side (or the network) closed the channel.
    Closed { code: Option<u16> },
    /// We closed the channel ourselves, e.g. on backgrounding.
    ClosedLocally,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    CredentialRejected,
    Transient,
}

pub fn classify_close(code: Option<u16>) -> CloseDisposition {
    match code {
        Some(CREDENTIAL_REJECTED_CLOSE_CODE) => CloseDisposition::CredentialRejected,
        _ => CloseDisposition::Transient,
    }
}

pub fn transition(state: ConnectionState, event: &LifecycleEvent) -> ConnectionState {
    use ConnectionState::*;

    match (state, event) {
        (_, LifecycleEvent::Closed { code }) if classify_close(*code).is_rejected() => Unauthorized,
        (Unauthorized, _) => Unauthorized,
        (_, LifecycleEvent::Closed { .. }) | (_, LifecycleEvent::ClosedLocally) => Disconnected,
        (Disconnected, LifecycleEvent::ConnectStarted) => Connecting,
        (Connecting, LifecycleEvent::Opened) => Connected,
        // Errors are diagnostics only; the close that follows is authoritative.
        (current, _) => current,
    }
}

impl CloseDisposition {
    pub fn is_rejected(self) -> bool {
        self == CloseDisposition::CredentialRejected
    }
}

/// Application visibility as reported by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppPresence {
    Active,
    Inactive,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceAction {
    Connect,
    Disconnect,
    Nothing,
}

/// Reconnect policy: connect when foregrounded without a live socket, close
/// the socket whenever the app leaves the foreground.
pub fn presence_action(
    presence: AppPresence,
    state: ConnectionState,
    socket_live: bool,
) -> PresenceAction {
    match presence {
        AppPresence::Active if !socket_live && state != ConnectionState::Unauthorized => {
            PresenceAction::Connect
        }
        AppPresence::Inactive | AppPresence::Background if socket_live => {
            PresenceAction::Disconnect
        }
        _ => PresenceAction::Nothing,
    }
}
