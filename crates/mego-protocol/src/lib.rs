//! Wire frames and codec for the mego RPC / pub-sub protocol.
//!
//! # Protocol Overview
//!
//! Every WebSocket binary message carries exactly one MessagePack-encoded
//! frame. Maps with short keys are used so that peers ignore fields they do
//! not know about:
//!
//! - [`Request`] (client → server): `m` method, `p` params, `f` files,
//!   `e` `[event, channel]`, `i` correlation id (`0` = fire-and-forget)
//! - [`Response`] (server → client): `v` event, `r` result,
//!   `e` error `{c, m, d}`, `i` correlation id (`0` = unsolicited push)
//!
//! The two families are not tagged on the wire: a server only ever reads
//! requests and a client only ever reads responses.
//!
//! `params`, `result` and `error.data` are themselves MessagePack payloads
//! kept as opaque bytes until the receiving side decodes them into a
//! concrete type with [`decode_value`].
//!
//! # Example
//!
//! ```rust
//! use mego_protocol::{Request, decode_message, encode_message, encode_value};
//!
//! let request = Request::call("Sum", encode_value(&[3, 4]).unwrap(), 1);
//! let bytes = encode_message(&request).unwrap();
//! let decoded: Request = decode_message(&bytes).unwrap();
//! assert_eq!(decoded, request);
//! ```

mod codec;
mod error;
mod frame;
mod status;

pub use codec::{decode_message, decode_value, encode_message, encode_value};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{Parts, RawFile, Request, Response, ResponseError};
pub use status::Status;

/// Reserved method name for subscribing to an event channel.
pub const SUBSCRIBE_METHOD: &str = "MegoSubscribe";

/// Reserved method name for leaving an event channel.
pub const UNSUBSCRIBE_METHOD: &str = "MegoUnsubscribe";

/// Push event asking the client to send the next chunk.
pub const CHUNK_NEXT_EVENT: &str = "MegoChunkNext";

/// Push event telling the client the chunked upload was cancelled.
pub const CHUNK_ABORT_EVENT: &str = "MegoChunkAbort";

/// Maximum encoded frame size (64 MB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Returns true when `method` names one of the reserved control methods.
///
/// The comparison is case-insensitive, like every method lookup. The empty
/// name is reserved for the init frame.
pub fn is_reserved_method(method: &str) -> bool {
    method.is_empty()
        || method.eq_ignore_ascii_case(SUBSCRIBE_METHOD)
        || method.eq_ignore_ascii_case(UNSUBSCRIBE_METHOD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names_ignore_case() {
        assert!(is_reserved_method("MegoSubscribe"));
        assert!(is_reserved_method("megosubscribe"));
        assert!(is_reserved_method("MEGOUNSUBSCRIBE"));
        assert!(is_reserved_method(""));
        assert!(!is_reserved_method("Subscribe"));
        assert!(!is_reserved_method("Sum"));
    }
}
