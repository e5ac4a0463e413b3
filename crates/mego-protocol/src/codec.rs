//! MessagePack encoding of frames and payloads.
//!
//! Framing itself is left to the WebSocket transport: one binary message is
//! one frame, so no length prefix is written here.
//!
//! Structs are encoded as maps (`rmp_serde::to_vec_named`) rather than
//! arrays. Field lookup by key is what lets a peer skip fields added by a
//! newer version.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::MAX_MESSAGE_SIZE;
use crate::error::{ProtocolError, ProtocolResult};

/// Encodes a frame to bytes ready for transmission.
///
/// # Example
///
/// ```rust
/// use mego_protocol::{Response, encode_message};
///
/// let bytes = encode_message(&Response::chunk_next(7)).unwrap();
/// assert!(!bytes.is_empty());
/// ```
pub fn encode_message<T: Serialize>(message: &T) -> ProtocolResult<Bytes> {
    let encoded = rmp_serde::to_vec_named(message)?;

    if encoded.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: encoded.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    Ok(Bytes::from(encoded))
}

/// Decodes a complete frame.
///
/// # Example
///
/// ```rust
/// use mego_protocol::{Response, decode_message, encode_message};
///
/// let bytes = encode_message(&Response::chunk_next(7)).unwrap();
/// let decoded: Response = decode_message(&bytes).unwrap();
/// assert_eq!(decoded.id, 7);
/// ```
pub fn decode_message<T: DeserializeOwned>(data: &[u8]) -> ProtocolResult<T> {
    if data.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }

    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: data.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    Ok(rmp_serde::from_slice(data)?)
}

/// Encodes an application payload (`params`, `result`, `error.data`).
pub fn encode_value<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<Bytes> {
    Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
}

/// Decodes an application payload into `T`.
///
/// An empty payload is read as MessagePack `nil`, so it decodes into
/// `Option<_>`, `()` or any type that accepts a unit value.
pub fn decode_value<T: DeserializeOwned>(data: &[u8]) -> ProtocolResult<T> {
    const NIL: [u8; 1] = [0xc0];

    let data = if data.is_empty() { &NIL[..] } else { data };
    Ok(rmp_serde::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RawFile, Request, Response, ResponseError, Status};
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[test]
    fn request_roundtrip_keeps_every_field() {
        let mut files = BTreeMap::new();
        files.insert(
            "File1".to_string(),
            vec![RawFile::chunk(Bytes::from_static(b"abc"), 9, 3, 1, "photo.jpg")],
        );
        let request = Request {
            method: "Upload".into(),
            params: encode_value(&("alice", 42)).unwrap(),
            files,
            event: Some(("Chat".into(), "Room1".into())),
            id: 17,
        };

        let bytes = encode_message(&request).unwrap();
        let decoded: Request = decode_message(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn response_roundtrip_keeps_error() {
        let response = Response::error(
            5,
            ResponseError::new(Status::NotFound, "no such user", encode_value("bob").unwrap()),
        );

        let bytes = encode_message(&response).unwrap();
        let decoded: Response = decode_message(&bytes).unwrap();
        assert_eq!(decoded, response);
        assert!(decoded.result.is_empty());
    }

    #[test]
    fn decode_empty_message() {
        let result: ProtocolResult<Request> = decode_message(&[]);
        assert!(matches!(result, Err(ProtocolError::EmptyMessage)));
    }

    #[test]
    fn decode_garbage_is_an_error() {
        let result: ProtocolResult<Request> = decode_message(&[0xc1, 0xff, 0x00]);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn decode_rejects_oversized_frames() {
        let data = vec![0u8; MAX_MESSAGE_SIZE + 1];
        let result: ProtocolResult<Request> = decode_message(&data);
        assert!(matches!(result, Err(ProtocolError::MessageTooLarge { .. })));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        #[derive(Serialize)]
        struct NewerRequest<'a> {
            #[serde(rename = "m")]
            method: &'a str,
            #[serde(rename = "i")]
            id: u64,
            #[serde(rename = "x")]
            priority: u8,
        }

        let bytes = rmp_serde::to_vec_named(&NewerRequest {
            method: "Ping",
            id: 3,
            priority: 9,
        })
        .unwrap();

        let decoded: Request = decode_message(&bytes).unwrap();
        assert_eq!(decoded.method, "Ping");
        assert_eq!(decoded.id, 3);
        assert!(decoded.params.is_empty());
        assert!(decoded.files.is_empty());
        assert!(decoded.event.is_none());
    }

    #[test]
    fn empty_payload_decodes_as_nil() {
        let value: Option<i64> = decode_value(&[]).unwrap();
        assert_eq!(value, None);
        assert!(decode_value::<()>(&[]).is_ok());
    }

    #[test]
    fn payload_roundtrip_struct() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Login {
            username: String,
            password: String,
        }

        let login = Login {
            username: "yami".into(),
            password: "odymel".into(),
        };
        let bytes = encode_value(&login).unwrap();
        let decoded: Login = decode_value(&bytes).unwrap();
        assert_eq!(decoded, login);
    }
}
