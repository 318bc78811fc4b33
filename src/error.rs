use thiserror::Error;

/// Errors produced while handling a single bridged event. Each variant maps
/// to a message status on the Matrix side; see [`EventError::is_retriable`]
/// and friends for the classification.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("You're not logged in")]
    NotLoggedIn,

    #[error("Edits are not supported on this network")]
    EditsNotSupported,

    #[error("Edits are not supported in this room")]
    EditsNotSupportedInPortal,

    #[error("Edit target message is too old")]
    EditTargetTooOld,

    #[error("Edit target message has been edited too many times")]
    EditTargetTooManyEdits,

    #[error("Reactions are not supported on this network")]
    ReactionsNotSupported,

    #[error("Ignoring reaction event from relayed user")]
    IgnoringReactionFromRelayedUser,

    #[error("Redactions are not supported on this network")]
    RedactionsNotSupported,

    #[error("Location messages are not supported on this network")]
    LocationMessagesNotAllowed,

    #[error("Captions are not supported on this network")]
    CaptionsNotAllowed,

    #[error("Room metadata changes are not supported on this network")]
    RoomMetadataNotSupported,

    #[error("Membership changes are not supported on this network")]
    MembershipNotSupported,

    #[error("{kind} target message not found")]
    TargetNotFound { kind: &'static str },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Unexpected event content: {0}")]
    UnexpectedContent(&'static str),

    #[error("Event handler panicked")]
    PanicInHandler,

    #[error("Ignoring remote event")]
    IgnoringRemoteEvent,

    /// Sentinel returned by echo handlers to suppress the status entirely.
    #[error("no status")]
    NoStatus,

    #[error("{0}")]
    Network(String),
}

impl EventError {
    pub fn database(err: impl std::fmt::Display) -> Self {
        Self::Database(err.to_string())
    }

    /// Whether the originating Matrix event may be retried by the client.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::UnexpectedContent(_) | Self::PanicInHandler | Self::Network(_)
        )
    }

    /// Whether the failure is known-permanent rather than a guess.
    pub fn is_certain(&self) -> bool {
        !self.is_retriable()
    }

    /// Whether a visible notice should accompany the status event.
    pub fn should_send_notice(&self) -> bool {
        matches!(self, Self::NotLoggedIn)
    }

    /// Whether any status should be emitted at all.
    pub fn should_send_status(&self) -> bool {
        !matches!(self, Self::NoStatus | Self::IgnoringRemoteEvent)
    }
}

pub type EventResult<T> = std::result::Result<T, EventError>;

/// Errors from the Matrix intent facade.
#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("API error: {code} - {message}")]
    Api { code: String, message: String },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Room creation failed: {0}")]
    RoomCreation(String),

    #[error("Event send failed: {0}")]
    EventSend(String),
}

pub type MatrixResult<T> = std::result::Result<T, MatrixError>;
