use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Identifier of an event owned by the event directory.
    EventId
);

uuid_id!(
    /// Identifier of a user (registrant, scanner, organizer).
    UserId
);

/// Length of the random hex suffix of a ticket code.
pub const CODE_SUFFIX_LEN: usize = 8;

/// Human-transcribable ticket code: `PREFIX-<base36 millis>-<8 upper hex>`.
///
/// Construction goes through [`TicketCode::parse`] so that everything past the HTTP boundary
/// can rely on the shape.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TicketCode(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed ticket code: {0}")]
pub struct MalformedCode(pub String);

impl TicketCode {
    pub fn parse(raw: &str) -> Result<Self, MalformedCode> {
        let raw = raw.trim();
        let mut parts = raw.split('-');
        let (Some(prefix), Some(stamp), Some(suffix), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(MalformedCode(raw.to_string()));
        };

        let prefix_ok = !prefix.is_empty()
            && prefix.len() <= 8
            && prefix.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
        let stamp_ok = !stamp.is_empty()
            && stamp.len() <= 13
            && stamp
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase());
        let suffix_ok = suffix.len() == CODE_SUFFIX_LEN
            && suffix
                .chars()
                .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c));

        if prefix_ok && stamp_ok && suffix_ok {
            Ok(Self(raw.to_string()))
        } else {
            Err(MalformedCode(raw.to_string()))
        }
    }

    /// For codes minted by the generator, whose shape is fixed by construction.
    pub(crate) fn from_generated(raw: String) -> Self {
        debug_assert!(Self::parse(&raw).is_ok(), "generated code {raw} is malformed");
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TicketCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TicketCode {
    type Err = MalformedCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TicketCode {
    type Error = MalformedCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TicketCode> for String {
    fn from(code: TicketCode) -> Self {
        code.0
    }
}
