use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::InventoryError;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }
    };
}

string_id!(
    /// Event identifier, e.g. `123-ABC-723`.
    EventSku
);
string_id!(
    /// Pricing/category partition of an event, e.g. `General`, `VIP`.
    Tier
);
string_id!(CustomerId);
string_id!(
    /// Sales order identifier. Generated ids are six upper-case alphanumerics.
    OrderId
);

const ORDER_ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const ORDER_ID_LEN: usize = 6;

impl OrderId {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id: String = (0..ORDER_ID_LEN)
            .map(|_| ORDER_ID_CHARSET[rng.gen_range(0..ORDER_ID_CHARSET.len())] as char)
            .collect();
        Self(id)
    }
}

/// Seat block label in a base-26 sequence: A, B, ..., Z, AA, AB, ...
///
/// Shorter labels order before longer ones, so `Z < AA`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockLabel(String);

impl BlockLabel {
    pub fn first() -> Self {
        Self("A".to_string())
    }

    pub fn parse(value: &str) -> Result<Self, InventoryError> {
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(InventoryError::InvalidRequest(format!(
                "block label must be non-empty A-Z letters, got {value:?}"
            )));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The label that follows this one: `A -> B`, `Z -> AA`, `AZ -> BA`, `ZZ -> AAA`.
    pub fn next(&self) -> Self {
        let mut bytes = self.0.clone().into_bytes();
        for byte in bytes.iter_mut().rev() {
            if *byte == b'Z' {
                *byte = b'A';
            } else {
                *byte += 1;
                return Self(String::from_utf8_lossy(&bytes).into_owned());
            }
        }
        // every position wrapped
        bytes.insert(0, b'A');
        Self(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// `count` consecutive labels starting at `A`.
    pub fn sequence(count: usize) -> Vec<Self> {
        let mut labels = Vec::with_capacity(count);
        let mut label = Self::first();
        for _ in 0..count {
            let next = label.next();
            labels.push(label);
            label = next;
        }
        labels
    }
}

impl Ord for BlockLabel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for BlockLabel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BlockLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BlockLabel {
    type Error = InventoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BlockLabel> for String {
    fn from(label: BlockLabel) -> Self {
        label.0
    }
}
