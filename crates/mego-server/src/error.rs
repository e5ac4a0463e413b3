//! Engine and handler error types.

use std::io;

use mego_protocol::{ProtocolError, Status};
use thiserror::Error;

/// Result type for engine operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Result type returned by handlers and middleware.
pub type HandlerResult = Result<(), HandlerError>;

/// Errors that can occur in the engine.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error (socket, upload directory, etc.).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (encoding, decoding).
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// WebSocket handshake or transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Emitting to an event that was never declared or subscribed.
    #[error("Event not found: {event}")]
    EventNotFound { event: String },

    /// Emitting to a channel that does not exist in its event.
    #[error("Channel not found: {event}/{channel}")]
    ChannelNotFound { event: String, channel: String },

    /// The method name is reserved for control frames.
    #[error("Method name is reserved: {name:?}")]
    ReservedMethod { name: String },

    /// A method with the same name is already registered.
    #[error("Method already registered: {name}")]
    DuplicateMethod { name: String },

    /// The session limit is reached.
    #[error("Too many sessions (max: {max})")]
    TooManySessions { max: usize },

    /// The session disconnected.
    #[error("Session closed: {id}")]
    SessionClosed { id: String },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an event not found error.
    pub fn event_not_found(event: impl Into<String>) -> Self {
        Self::EventNotFound {
            event: event.into(),
        }
    }

    /// Creates a channel not found error.
    pub fn channel_not_found(event: impl Into<String>, channel: impl Into<String>) -> Self {
        Self::ChannelNotFound {
            event: event.into(),
            channel: channel.into(),
        }
    }

    /// Creates a session closed error.
    pub fn session_closed(id: impl Into<String>) -> Self {
        Self::SessionClosed { id: id.into() }
    }
}

/// Errors a handler returns to abort the chain with an error response.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Params could not be decoded into the requested type.
    #[error("cannot bind params: {0}")]
    Bind(#[source] ProtocolError),

    /// The request carries no file under this field.
    #[error("missing file field {field:?}")]
    MissingFile { field: String },

    /// A result or event payload could not be encoded.
    #[error("cannot encode payload: {0}")]
    Encode(#[from] ProtocolError),

    /// Filesystem error while handling an upload.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Explicit failure with a status code.
    #[error("{message}")]
    Status { status: Status, message: String },
}

impl HandlerError {
    /// Creates an error carrying `status`.
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Creates a missing file error.
    pub fn missing_file(field: impl Into<String>) -> Self {
        Self::MissingFile {
            field: field.into(),
        }
    }

    /// The status sent back to the caller.
    pub fn status(&self) -> Status {
        match self {
            Self::Bind(_) | Self::MissingFile { .. } => Status::Invalid,
            Self::Encode(_) | Self::Io(_) => Status::Error,
            Self::Status { status, .. } => *status,
        }
    }
}

impl From<Status> for HandlerError {
    fn from(status: Status) -> Self {
        Self::new(status, status.name())
    }
}

impl From<ServerError> for HandlerError {
    fn from(err: ServerError) -> Self {
        let status = match err {
            ServerError::EventNotFound { .. } | ServerError::ChannelNotFound { .. } => {
                Status::NotFound
            }
            _ => Status::Error,
        };
        Self::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_errors_map_to_status() {
        assert_eq!(HandlerError::missing_file("File1").status(), Status::Invalid);
        assert_eq!(
            HandlerError::new(Status::NotFound, "no such room").status(),
            Status::NotFound
        );
        assert_eq!(HandlerError::from(Status::Full).to_string(), "Full");

        let io = HandlerError::from(io::Error::other("disk"));
        assert_eq!(io.status(), Status::Error);

        let bind = HandlerError::Bind(ProtocolError::EmptyMessage);
        assert_eq!(bind.status(), Status::Invalid);

        let missing = HandlerError::from(ServerError::event_not_found("Chat"));
        assert_eq!(missing.status(), Status::NotFound);
    }

    #[test]
    fn server_error_messages() {
        assert_eq!(
            ServerError::channel_not_found("Chat", "Room9").to_string(),
            "Channel not found: Chat/Room9"
        );
        assert_eq!(
            ServerError::ReservedMethod {
                name: "MegoSubscribe".into()
            }
            .to_string(),
            "Method name is reserved: \"MegoSubscribe\""
        );
    }
}
