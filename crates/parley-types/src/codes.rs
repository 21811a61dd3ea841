use serde::{Deserialize, Serialize};

/// Result codes surfaced to clients in the `code` field of every outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum Code {
    /// The operation went through.
    Ok,
    /// Addressing or lookup failed (unknown group, store lookup error at connect).
    BadRequest,
    /// A field of the request was malformed: bad JSON, bad envelope, bad identity.
    BadField,
    /// The identity is not known to the system.
    NotAllowed,
    /// Unexpected internal failure.
    ServerError,
    /// The persistence port failed.
    DbError,
    /// The media provider failed.
    ProviderError,
}

impl Code {
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::Ok => 206,
            Self::BadRequest => 400,
            Self::BadField => 408,
            Self::NotAllowed => 411,
            Self::ServerError => 500,
            Self::DbError => 505,
            Self::ProviderError => 658,
        }
    }
}

impl From<Code> for u16 {
    fn from(code: Code) -> Self {
        code.as_u16()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown status code {0}")]
pub struct UnknownCode(pub u16);

impl TryFrom<u16> for Code {
    type Error = UnknownCode;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            206 => Self::Ok,
            400 => Self::BadRequest,
            408 => Self::BadField,
            411 => Self::NotAllowed,
            500 => Self::ServerError,
            505 => Self::DbError,
            658 => Self::ProviderError,
            other => return Err(UnknownCode(other)),
        })
    }
}
