//! NFSv4 stateid: 4-byte big-endian seqid followed by 12 opaque bytes.
//!
//! The opaque part is `client id (8 bytes, BE) || per-client counter (4 bytes, BE)`,
//! which makes it unique within the owning client and lets the server route
//! a stateid back to its client without an extra index.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{NfsError, Result};

/// Encoded size of a stateid on the wire
pub const STATEID_SIZE: usize = 16;
/// Size of the opaque part
pub const STATEID_OTHER_SIZE: usize = 12;

/// NFSv4 stateid.
///
/// Equality and hashing only consider `other`: a stateid with an advanced
/// seqid still names the same piece of state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StateId {
    /// Sequence counter, advanced on every state-modifying operation
    pub seqid: u32,
    /// Opaque identity, unique per client
    pub other: [u8; STATEID_OTHER_SIZE],
}

impl StateId {
    /// Build the stateid for the `counter`-th state of `client_id`
    pub fn new(client_id: u64, counter: u32) -> Self {
        let mut other = [0u8; STATEID_OTHER_SIZE];
        other[0..8].copy_from_slice(&client_id.to_be_bytes());
        other[8..12].copy_from_slice(&counter.to_be_bytes());
        StateId { seqid: 1, other }
    }

    /// Client id embedded in the opaque part
    pub fn client_id(&self) -> u64 {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.other[0..8]);
        u64::from_be_bytes(id)
    }

    /// Wire encoding
    pub fn to_bytes(&self) -> [u8; STATEID_SIZE] {
        let mut bytes = [0u8; STATEID_SIZE];
        bytes[0..4].copy_from_slice(&self.seqid.to_be_bytes());
        bytes[4..16].copy_from_slice(&self.other);
        bytes
    }

    /// Decode from the wire encoding
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != STATEID_SIZE {
            return Err(NfsError::inval(format!(
                "stateid must be {} bytes, got {}",
                STATEID_SIZE,
                bytes.len()
            )));
        }
        let mut seq = [0u8; 4];
        seq.copy_from_slice(&bytes[0..4]);
        let mut other = [0u8; STATEID_OTHER_SIZE];
        other.copy_from_slice(&bytes[4..16]);
        Ok(StateId {
            seqid: u32::from_be_bytes(seq),
            other,
        })
    }

    /// Advance the seqid, skipping 0 which is reserved for "current" stateids
    pub fn bump(&mut self) {
        self.seqid = self.seqid.wrapping_add(1);
        if self.seqid == 0 {
            self.seqid = 1;
        }
    }
}

impl PartialEq for StateId {
    fn eq(&self, other: &Self) -> bool {
        self.other == other.other
    }
}

impl Eq for StateId {}

impl Hash for StateId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.other.hash(state);
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for b in &self.other {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ", seq: {}]", self.seqid)
    }
}
