use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Longest identity accepted from the wire.
pub const MAX_IDENTITY_LEN: usize = 128;

/// A participant or group identifier as understood by the persistence layer.
///
/// User ids minted by the database are UUID strings, but any identity made of
/// ASCII letters, digits and `_ . @ -` is accepted so that email-style lookups
/// and short test ids work the same way.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("identity is empty")]
    Empty,
    #[error("identity exceeds {MAX_IDENTITY_LEN} characters")]
    TooLong,
    #[error("identity contains invalid character {0:?}")]
    InvalidChar(char),
}

impl Identity {
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        if raw.is_empty() {
            return Err(IdentityError::Empty);
        }
        if raw.len() > MAX_IDENTITY_LEN {
            return Err(IdentityError::TooLong);
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@' | '-')))
        {
            return Err(IdentityError::InvalidChar(c));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
