//! Request, response and file frames.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::status::Status;
use crate::{CHUNK_ABORT_EVENT, CHUNK_NEXT_EVENT, SUBSCRIBE_METHOD, UNSUBSCRIBE_METHOD};

/// A frame sent from client to server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Method to invoke. Empty for the init frame.
    #[serde(rename = "m", default)]
    pub method: String,

    /// Encoded parameters (a positional array or a keyed map).
    #[serde(rename = "p", default)]
    pub params: Bytes,

    /// Uploaded files grouped by field name.
    #[serde(rename = "f", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, Vec<RawFile>>,

    /// `(event, channel)` for subscribe/unsubscribe control calls.
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub event: Option<(String, String)>,

    /// Correlation id. `0` means no response is expected.
    #[serde(rename = "i", default)]
    pub id: u64,
}

impl Request {
    /// Creates a method call.
    pub fn call(method: impl Into<String>, params: Bytes, id: u64) -> Self {
        Self {
            method: method.into(),
            params,
            id,
            ..Default::default()
        }
    }

    /// Creates a fire-and-forget call.
    pub fn notify(method: impl Into<String>, params: Bytes) -> Self {
        Self::call(method, params, 0)
    }

    /// Creates the init frame carrying session keys.
    pub fn init(keys: Bytes, id: u64) -> Self {
        Self::call(String::new(), keys, id)
    }

    /// Creates a subscribe control call.
    pub fn subscribe(event: impl Into<String>, channel: impl Into<String>, id: u64) -> Self {
        Self {
            method: SUBSCRIBE_METHOD.to_string(),
            event: Some((event.into(), channel.into())),
            id,
            ..Default::default()
        }
    }

    /// Creates an unsubscribe control call.
    pub fn unsubscribe(event: impl Into<String>, channel: impl Into<String>, id: u64) -> Self {
        Self {
            method: UNSUBSCRIBE_METHOD.to_string(),
            event: Some((event.into(), channel.into())),
            id,
            ..Default::default()
        }
    }

    /// Returns true for the reserved init frame.
    pub fn is_init(&self) -> bool {
        self.method.is_empty()
    }

    /// Returns true when the sender expects no response.
    pub fn is_notification(&self) -> bool {
        self.id == 0
    }

    /// Iterates over every file of every field.
    pub fn raw_files(&self) -> impl Iterator<Item = (&str, &RawFile)> {
        self.files
            .iter()
            .flat_map(|(field, files)| files.iter().map(move |f| (field.as_str(), f)))
    }

    /// Total binary size carried by the files of this request.
    pub fn file_bytes(&self) -> usize {
        self.raw_files().map(|(_, f)| f.binary.len()).sum()
    }
}

/// A frame sent from server to client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Push event name. Empty for plain replies.
    #[serde(rename = "v", default)]
    pub event: String,

    /// Encoded success payload.
    #[serde(rename = "r", default)]
    pub result: Bytes,

    /// Error payload, mutually exclusive with `result`.
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,

    /// Id of the originating request, `0` for unsolicited pushes.
    #[serde(rename = "i", default)]
    pub id: u64,
}

impl Response {
    /// Creates a success reply.
    pub fn result(id: u64, result: Bytes) -> Self {
        Self {
            result,
            id,
            ..Default::default()
        }
    }

    /// Creates an error reply.
    pub fn error(id: u64, error: ResponseError) -> Self {
        Self {
            error: Some(error),
            id,
            ..Default::default()
        }
    }

    /// Creates an unsolicited event push.
    pub fn push(event: impl Into<String>, result: Bytes) -> Self {
        Self {
            event: event.into(),
            result,
            ..Default::default()
        }
    }

    /// Asks the client to send the next chunk of request `id`.
    pub fn chunk_next(id: u64) -> Self {
        Self {
            event: CHUNK_NEXT_EVENT.to_string(),
            id,
            ..Default::default()
        }
    }

    /// Tells the client the chunked upload of request `id` was cancelled.
    pub fn chunk_abort(id: u64, error: ResponseError) -> Self {
        Self {
            event: CHUNK_ABORT_EVENT.to_string(),
            error: Some(error),
            id,
            ..Default::default()
        }
    }

    /// Returns true for `MegoChunkNext`.
    pub fn is_chunk_next(&self) -> bool {
        self.event == CHUNK_NEXT_EVENT
    }

    /// Returns true for `MegoChunkAbort`.
    pub fn is_chunk_abort(&self) -> bool {
        self.event == CHUNK_ABORT_EVENT
    }

    /// Returns true for event pushes not tied to any request.
    pub fn is_unsolicited(&self) -> bool {
        self.id == 0 && !self.event.is_empty()
    }
}

/// Error payload of a [`Response`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    /// Status code, see [`Status`].
    #[serde(rename = "c", default)]
    pub code: i32,

    /// Short human-readable message.
    #[serde(rename = "m", default)]
    pub message: String,

    /// Encoded error details.
    #[serde(rename = "d", default)]
    pub data: Bytes,
}

impl ResponseError {
    /// Creates an error payload.
    pub fn new(status: Status, message: impl Into<String>, data: Bytes) -> Self {
        Self {
            code: status.code(),
            message: message.into(),
            data,
        }
    }

    /// Creates an error payload whose message is the status name.
    pub fn from_status(status: Status) -> Self {
        Self::new(status, status.to_string(), Bytes::new())
    }

    /// The status this error carries, when the code is a known one.
    pub fn status(&self) -> Option<Status> {
        Status::from_code(self.code)
    }
}

/// Part position of a chunk, decoded from `RawFile::parts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parts {
    /// Number of parts in the whole file.
    pub total: u64,
    /// 1-based index of this part.
    pub current: u64,
}

impl Parts {
    /// Returns true for the last part of the file.
    pub fn is_final(&self) -> bool {
        self.current == self.total
    }
}

/// One uploaded file, or one part of a chunked file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFile {
    /// Bytes of this file or part.
    #[serde(rename = "b", default)]
    pub binary: Bytes,

    /// Client-assigned id, stable across the parts of one file.
    #[serde(rename = "i", default)]
    pub id: u64,

    /// Empty for a whole file, `[total, current]` for a chunk.
    #[serde(rename = "p", default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<u64>,

    /// Original file name.
    #[serde(rename = "n", default)]
    pub name: String,
}

impl RawFile {
    /// Creates a whole (non-chunked) file.
    pub fn whole(binary: Bytes, id: u64, name: impl Into<String>) -> Self {
        Self {
            binary,
            id,
            parts: Vec::new(),
            name: name.into(),
        }
    }

    /// Creates part `current` of `total`.
    pub fn chunk(binary: Bytes, id: u64, total: u64, current: u64, name: impl Into<String>) -> Self {
        Self {
            binary,
            id,
            parts: vec![total, current],
            name: name.into(),
        }
    }

    /// Returns true when this entry is a part of a chunked upload.
    pub fn is_chunk(&self) -> bool {
        !self.parts.is_empty()
    }

    /// Decodes the part position.
    ///
    /// Returns `Ok(None)` for whole files and an error when the descriptor is
    /// not `[total, current]` with `1 <= current <= total`.
    pub fn parts(&self) -> ProtocolResult<Option<Parts>> {
        match self.parts.as_slice() {
            [] => Ok(None),
            &[total, current] if current >= 1 && current <= total => {
                Ok(Some(Parts { total, current }))
            }
            other => Err(ProtocolError::InvalidParts {
                parts: other.to_vec(),
            }),
        }
    }
}
