//! Server-held state owned by a client: opens, byte-range locks and
//! delegations.
//!
//! States are owned exclusively by their [`NfsClient`](crate::client::NfsClient).
//! The file tracker and lock manager index them but never own them; when a
//! client drops a state it calls [`StateRelease::release`] on every
//! collaborator so they can forget about it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::lock::Lock;
use crate::stateid::StateId;

/// Stable, content-independent identity of a file (e.g. the inode id bytes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(Vec<u8>);

impl FileId {
    /// Creates a file id from raw bytes.
    pub fn new(id: impl Into<Vec<u8>>) -> Self {
        FileId(id.into())
    }

    /// Raw bytes of the id.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lower-case hex rendering, used in logs and storage keys.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<&[u8]> for FileId {
    fn from(bytes: &[u8]) -> Self {
        FileId(bytes.to_vec())
    }
}

/// What a state handle stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateKind {
    /// Open share reservation on a file
    Open {
        /// The opened file
        file: FileId,
    },
    /// Byte-range lock held on a file
    Lock {
        /// The locked file
        file: FileId,
        /// The lock itself
        lock: Lock,
    },
    /// Delegation granted on a file
    Delegation {
        /// The delegated file
        file: FileId,
    },
}

impl StateKind {
    /// File the state refers to.
    pub fn file(&self) -> &FileId {
        match self {
            StateKind::Open { file }
            | StateKind::Lock { file, .. }
            | StateKind::Delegation { file } => file,
        }
    }
}

/// A state handle owned by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsState {
    /// Client-scoped identity
    pub stateid: StateId,
    /// What the handle stands for
    pub kind: StateKind,
}

impl NfsState {
    /// Creates a state handle.
    pub fn new(stateid: StateId, kind: StateKind) -> Self {
        Self { stateid, kind }
    }

    /// Advances the stateid's sequence counter.
    pub fn bump_seqid(&mut self) {
        self.stateid.bump();
    }
}

/// A collaborator that indexes client-owned state and must forget it when
/// the owning client disposes the state.
#[async_trait]
pub trait StateRelease: Send + Sync {
    /// Drops every reference to `state`, owned by client `client_id`.
    /// Runs to completion; failures are logged, not returned.
    async fn release(&self, client_id: u64, state: &NfsState);
}
