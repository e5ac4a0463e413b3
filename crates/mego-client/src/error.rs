//! Client error types.

use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use mego_protocol::{ProtocolError, ResponseError, Status, decode_value};

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client.
#[derive(Debug)]
pub enum ClientError {
    /// Configuration error.
    Config(String),
    /// IO error.
    Io(std::io::Error),
    /// Connecting to the server failed.
    Connection(String),
    /// Encoding or decoding error.
    Protocol(String),
    /// No response arrived before the deadline.
    Timeout(String),
    /// The connection was closed while the request was pending.
    Closed,
    /// The server answered with an error payload.
    Remote(RemoteError),
    /// The server cancelled a chunked upload.
    Aborted(RemoteError),
    /// The server refused a subscription.
    SubscriptionRefused {
        event: String,
        channel: String,
        error: RemoteError,
    },
    /// A chunked upload was combined with other files.
    ChunkWithFiles,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Connection(msg) => write!(f, "connection error: {}", msg),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Timeout(msg) => write!(f, "timeout: {}", msg),
            Self::Closed => write!(f, "connection closed"),
            Self::Remote(err) => write!(f, "remote error: {}", err),
            Self::Aborted(err) => write!(f, "upload aborted: {}", err),
            Self::SubscriptionRefused {
                event,
                channel,
                error,
            } => write!(f, "subscription to {}/{} refused: {}", event, channel, error),
            Self::ChunkWithFiles => write!(
                f,
                "a chunked upload cannot be combined with other files in one request"
            ),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Remote(err) | Self::Aborted(err) => Some(err),
            Self::SubscriptionRefused { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl ClientError {
    /// Status carried by a server-side failure, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Remote(err) | Self::Aborted(err) => err.status(),
            Self::SubscriptionRefused { error, .. } => error.status(),
            Self::Timeout(_) => Some(Status::Timeout),
            _ => None,
        }
    }
}

/// Error payload returned by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Raw status code.
    pub code: i32,
    /// Message chosen by the handler.
    pub message: String,
    /// Encoded error details.
    pub data: Bytes,
}

impl RemoteError {
    /// The status this error carries, when the code is a known one.
    pub fn status(&self) -> Option<Status> {
        Status::from_code(self.code)
    }

    /// Decodes the error details into `T`.
    pub fn bind<T: DeserializeOwned>(&self) -> ClientResult<T> {
        Ok(decode_value(&self.data)?)
    }
}

impl From<ResponseError> for RemoteError {
    fn from(err: ResponseError) -> Self {
        Self {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status() {
            Some(status) => write!(f, "{} ({}): {}", status, self.code, self.message),
            None => write!(f, "code {}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

#[cfg(test)]
mod tests {
    use super::*;
    use mego_protocol::encode_value;

    #[test]
    fn remote_error_display_uses_status_name() {
        let err = RemoteError::from(ResponseError::new(
            Status::NotFound,
            "no such user",
            Bytes::new(),
        ));
        assert_eq!(err.status(), Some(Status::NotFound));
        assert!(err.to_string().contains("-1004"));
        assert!(err.to_string().contains("no such user"));
    }

    #[test]
    fn remote_error_binds_details() {
        let err = RemoteError {
            code: Status::Invalid.code(),
            message: "bad input".into(),
            data: encode_value(&vec!["name".to_string()]).unwrap(),
        };
        let fields: Vec<String> = err.bind().unwrap();
        assert_eq!(fields, vec!["name"]);
    }

    #[test]
    fn status_of_client_errors() {
        assert_eq!(
            ClientError::Timeout("Sum".into()).status(),
            Some(Status::Timeout)
        );
        assert_eq!(ClientError::Closed.status(), None);
        let refused = ClientError::SubscriptionRefused {
            event: "Chat".into(),
            channel: "Secret".into(),
            error: ResponseError::from_status(Status::NoPermission).into(),
        };
        assert_eq!(refused.status(), Some(Status::NoPermission));
        assert!(refused.to_string().contains("Chat/Secret"));
    }
}
