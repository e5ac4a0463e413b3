//! Status codes carried in `ResponseError::code`.
//!
//! The numbering is part of the wire contract and must not change:
//!
//! - `0..=4`: informational / flow codes
//! - `-1000..=-1010`: general failures
//! - `-1011..=-1014`: upload and timing failures

use std::fmt;

use serde::{Deserialize, Serialize};

/// A stable status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum Status {
    /// Request handled.
    Ok = 0,
    /// Accepted, work still in progress.
    Processing = 1,
    /// Nothing to change.
    NoChanges = 2,
    /// Chunk accepted, send the next one.
    FileNext = 3,
    /// Chunked upload cancelled.
    FileAbort = 4,

    /// Internal error.
    Error = -1000,
    /// Quota reached (room full, list full).
    Full = -1001,
    /// The resource already exists.
    Exists = -1002,
    /// The request is malformed.
    Invalid = -1003,
    /// The resource does not exist.
    NotFound = -1004,
    /// The caller must authenticate first.
    NotAuthorized = -1005,
    /// The caller is authenticated but not allowed.
    NoPermission = -1006,
    /// Not implemented yet.
    Unimplemented = -1007,
    /// Too many requests in the current window.
    TooManyRequests = -1008,
    /// The caller's allowance is used up.
    ResourceExhausted = -1009,
    /// The server cannot take more work right now.
    Busy = -1010,

    /// The chunk must be uploaded again.
    FileRetry = -1011,
    /// The file or chunk is empty.
    FileEmpty = -1012,
    /// The file or chunk exceeds the allowed size.
    FileTooLarge = -1013,
    /// The request took too long.
    Timeout = -1014,
}

impl Status {
    /// Every status, in code order within each range.
    pub const ALL: [Status; 20] = [
        Status::Ok,
        Status::Processing,
        Status::NoChanges,
        Status::FileNext,
        Status::FileAbort,
        Status::Error,
        Status::Full,
        Status::Exists,
        Status::Invalid,
        Status::NotFound,
        Status::NotAuthorized,
        Status::NoPermission,
        Status::Unimplemented,
        Status::TooManyRequests,
        Status::ResourceExhausted,
        Status::Busy,
        Status::FileRetry,
        Status::FileEmpty,
        Status::FileTooLarge,
        Status::Timeout,
    ];

    /// The numeric wire code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Looks up a status by wire code.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.code() == code)
    }

    /// Returns true for the failure ranges.
    pub fn is_error(self) -> bool {
        self.code() < 0
    }

    /// Stable name, also used as the default error message.
    pub fn name(self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::Processing => "Processing",
            Status::NoChanges => "NoChanges",
            Status::FileNext => "FileNext",
            Status::FileAbort => "FileAbort",
            Status::Error => "Error",
            Status::Full => "Full",
            Status::Exists => "Exists",
            Status::Invalid => "Invalid",
            Status::NotFound => "NotFound",
            Status::NotAuthorized => "NotAuthorized",
            Status::NoPermission => "NoPermission",
            Status::Unimplemented => "Unimplemented",
            Status::TooManyRequests => "TooManyRequests",
            Status::ResourceExhausted => "ResourceExhausted",
            Status::Busy => "Busy",
            Status::FileRetry => "FileRetry",
            Status::FileEmpty => "FileEmpty",
            Status::FileTooLarge => "FileTooLarge",
            Status::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<Status> for i32 {
    fn from(status: Status) -> Self {
        status.code()
    }
}

impl TryFrom<i32> for Status {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, String> {
        Status::from_code(code).ok_or_else(|| format!("unknown status code {code}"))
    }
}
