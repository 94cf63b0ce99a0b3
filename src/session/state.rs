//! Session state machine states

use serde::Serialize;

/// Lifecycle state of one linked account.
///
/// `Connected` means the socket is up but not yet authenticated;
/// `LoggedIn` is only reached on an authenticated upstream event.
/// `Errored` is non-terminal: the next connect attempt moves the session
/// back through `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Fresh,
    Connecting,
    Connected,
    LoggedIn,
    LoggedOut,
    Disconnected,
    #[serde(rename = "error")]
    Errored,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::LoggedIn => "logged_in",
            Self::LoggedOut => "logged_out",
            Self::Disconnected => "disconnected",
            Self::Errored => "error",
        }
    }

    /// Whether a drop from this state should schedule reconnection
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connected | Self::LoggedIn)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
