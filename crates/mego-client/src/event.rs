//! Unsolicited event pushes.

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use mego_protocol::decode_value;

use crate::error::ClientResult;

/// An event pushed by the server to a subscribed client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Event name.
    pub name: String,
    /// Encoded payload.
    pub data: Bytes,
}

impl Event {
    /// Decodes the payload into `T`.
    pub fn bind<T: DeserializeOwned>(&self) -> ClientResult<T> {
        Ok(decode_value(&self.data)?)
    }
}

/// Callback invoked for every push of one event.
pub type Listener = Arc<dyn Fn(Event) + Send + Sync>;
