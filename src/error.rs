use thiserror::Error;

/// Result type for hub operations
pub type Result<T> = std::result::Result<T, HubError>;

/// Errors raised by the byte-stream layer
///
/// All of these are recoverable: they end (or fail to start) a single
/// connection and feed the reconnect policy, they never take the process down.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The hub could not be reached at all
    #[error("hub unreachable at {address}: {source}")]
    Unreachable {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Connecting or probing took longer than the configured deadline
    #[error("timed out connecting to {0}")]
    TimedOut(String),

    /// There is no live connection to send on
    #[error("not connected")]
    NotConnected,

    /// Writing a frame to the socket failed
    #[error("write failed: {0}")]
    WriteError(#[source] std::io::Error),

    /// A frame could not be decoded; the connection stays up
    #[error("malformed frame: {0}")]
    Parse(String),

    /// TLS negotiation failed
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// WebSocket error on the notification channel
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An inbound message had an unexpected shape
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("protocol error: {0}")]
pub struct ProtocolError(pub String);

impl ProtocolError {
    pub(crate) fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

/// Outcome of a single correlated call that did not succeed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// No response arrived before the request's deadline
    #[error("request {method} timed out")]
    Timeout { method: String },

    /// The connection dropped (or was never up) while the request was pending
    #[error("connection lost before {method} completed")]
    Disconnected { method: String },

    /// The hub refused the call because the token is missing or invalid
    #[error("hub rejected {method}: unauthorized")]
    Unauthorized { method: String },

    /// The hub answered with a non-success status; `code` is the hub's error verbatim
    #[error("hub rejected {method}: {code}")]
    HubRejected { method: String, code: String },

    /// The response arrived but its payload did not have the expected shape
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
}

/// Reasons a pairing attempt can end in `Failed`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    /// Nobody confirmed on the hub within the user-action window
    #[error("push button was not pressed within the pairing window")]
    UserActionTimedOut,

    /// Another pairing attempt for this hub is still running
    #[error("a pairing attempt is already in progress")]
    AlreadyInProgress,

    /// The hub declined the pairing transaction
    #[error("hub rejected pairing: {0}")]
    HubRejected(String),

    /// The hub cannot pair this way (initial setup pending, no push button, ...)
    #[error("pairing not supported by hub: {0}")]
    Unsupported(String),

    /// A stored credential belongs to a different hub instance
    #[error("credential is for hub {expected}, connected hub is {actual}")]
    CredentialMismatch {
        expected: uuid::Uuid,
        actual: uuid::Uuid,
    },

    /// A pairing step's command failed
    #[error(transparent)]
    Request(#[from] RequestError),
}

impl PairingError {
    /// True when the operator simply didn't press the button in time
    pub fn is_user_timeout(&self) -> bool {
        matches!(self, PairingError::UserActionTimedOut)
    }

    /// True when the failure is about reaching the hub rather than the ceremony itself
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            PairingError::Request(RequestError::Disconnected { .. })
                | PairingError::Request(RequestError::Timeout { .. })
        )
    }
}

/// Top-level error for the client API
#[derive(Error, Debug)]
pub enum HubError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    /// None of the candidate addresses answered
    #[error("no reachable hub among {0} candidate(s)")]
    NoReachableHub(usize),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A thing or action the caller referenced is not known
    #[error("not found: {0}")]
    NotFound(String),

    /// An event receiver fell behind and missed events
    #[error("event receiver lagged by {0} events")]
    Lagged(u64),

    /// The client has shut down
    #[error("client closed")]
    Closed,
}
