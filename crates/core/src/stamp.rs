//! Staleness stamps
//!
//! A [`Stamp`] identifies one version of an external definition: the id of the
//! transaction that wrote it plus where it is physically stored. Any edit to the
//! definition produces a new row version, so a cached copy is current exactly
//! when its stamp equals the one the store reports now.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Optimistic-concurrency token for externally stored definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    txn_id: u64,
    location: u64,
}

impl Stamp {
    /// Stamp for a definition written by `txn_id` and stored at `location`
    pub const fn new(txn_id: u64, location: u64) -> Self {
        Stamp { txn_id, location }
    }

    /// Id of the transaction that created this version
    pub fn txn_id(&self) -> u64 {
        self.txn_id
    }

    /// Physical location of this version
    pub fn location(&self) -> u64 {
        self.location
    }

    /// True when `current` describes the same definition version
    pub fn matches(&self, current: &Stamp) -> bool {
        self == current
    }

    /// Stamp for the next edit of the same definition.
    ///
    /// Stores that do not track physical locations can use this to produce
    /// a fresh token on every write.
    pub fn next(&self) -> Stamp {
        Stamp {
            txn_id: self.txn_id.wrapping_add(1),
            location: self.location,
        }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.txn_id, self.location)
    }
}
