use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{ID_DIGITS, SHARD_CAPACITY, SHARD_DIGITS, SLOT_DIGITS};

/// Identifier assigned to a persisted exchange, in acceptance order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceId(pub u64);

/// Identifier assigned to an archived, deduplicated document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub u64);

impl SequenceId {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl DocumentId {
    #[must_use]
    pub fn from_parts(shard: u64, slot: u64) -> Self {
        Self(shard * SHARD_CAPACITY + slot)
    }

    #[must_use]
    pub fn shard(self) -> u64 {
        self.0 / SHARD_CAPACITY
    }

    #[must_use]
    pub fn slot(self) -> u64 {
        self.0 % SHARD_CAPACITY
    }

    /// File name of the shard holding this document.
    #[must_use]
    pub fn shard_name(self) -> String {
        format!("{:0width$}", self.shard(), width = SHARD_DIGITS)
    }

    /// Entry name of this document inside its shard.
    #[must_use]
    pub fn slot_name(self) -> String {
        format!("{:0width$}", self.slot(), width = SLOT_DIGITS)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0, width = ID_DIGITS)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0, width = ID_DIGITS)
    }
}

/// Parses exactly `digits` ASCII digits.
pub(crate) fn parse_fixed_digits(s: &str, digits: usize) -> Option<u64> {
    if s.len() != digits || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl FromStr for SequenceId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_fixed_digits(s, ID_DIGITS).map(Self).ok_or(())
    }
}

impl FromStr for DocumentId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_fixed_digits(s, ID_DIGITS).map(Self).ok_or(())
    }
}
