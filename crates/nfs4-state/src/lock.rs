//! Byte-range lock model.
//!
//! Locks carry an opaque owner; two locks with the same owner never
//! conflict, regardless of range or lock type. Ranges are inclusive on both
//! ends, matching how the server compares them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{NfsError, Result};

/// End offset used for locks that extend to the end of the file.
pub const WHOLE_FILE: u64 = u64::MAX;

/// A byte-range lock held by an owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lock {
    begin: u64,
    end: u64,
    owner: Vec<u8>,
}

impl Lock {
    /// Creates a lock over `[begin, end]`. A negative `end` means "to end of file".
    pub fn new(begin: u64, end: i64, owner: Vec<u8>) -> Result<Self> {
        let end = if end < 0 { WHOLE_FILE } else { end as u64 };
        if end <= begin {
            return Err(NfsError::inval(format!(
                "invalid lock range: {}..{}",
                begin, end
            )));
        }
        Ok(Lock { begin, end, owner })
    }

    /// First byte covered by the lock.
    pub fn begin(&self) -> u64 {
        self.begin
    }

    /// Last byte covered by the lock.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Opaque owner identity.
    pub fn owner(&self) -> &[u8] {
        &self.owner
    }

    /// True if the lock extends to the end of the file.
    pub fn is_whole_file(&self) -> bool {
        self.end == WHOLE_FILE
    }

    /// True if `other` may not be held together with this lock.
    pub fn conflicts(&self, other: &Lock) -> bool {
        if self.owner == other.owner {
            return false;
        }
        self.begin <= other.end && self.end >= other.begin
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock{{owner=")?;
        for b in &self.owner {
            write!(f, "{:02x}", b)?;
        }
        if self.is_whole_file() {
            write!(f, ", begin={}, end=EOF}}", self.begin)
        } else {
            write!(f, ", begin={}, end={}}}", self.begin, self.end)
        }
    }
}
