//! Open files and their share reservations.
//!
//! An OPEN declares the access it needs and the access it denies to other
//! opens of the same file. Two opens can coexist only if neither denies what
//! the other requests. Conflict check and insertion run in the file's own
//! critical section; different files never contend.

use async_trait::async_trait;
use tracing::debug;

use crate::client::NfsClient;
use crate::error::{NfsError, Result};
use crate::keyed::KeyedCollections;
use crate::state::{FileId, NfsState, StateKind, StateRelease};
use crate::stateid::StateId;

/// OPEN4_SHARE_ACCESS_READ
pub const SHARE_ACCESS_READ: u32 = 0x1;
/// OPEN4_SHARE_ACCESS_WRITE
pub const SHARE_ACCESS_WRITE: u32 = 0x2;
/// OPEN4_SHARE_ACCESS_BOTH
pub const SHARE_ACCESS_BOTH: u32 = SHARE_ACCESS_READ | SHARE_ACCESS_WRITE;

/// OPEN4_SHARE_DENY_NONE
pub const SHARE_DENY_NONE: u32 = 0x0;
/// OPEN4_SHARE_DENY_READ
pub const SHARE_DENY_READ: u32 = 0x1;
/// OPEN4_SHARE_DENY_WRITE
pub const SHARE_DENY_WRITE: u32 = 0x2;
/// OPEN4_SHARE_DENY_BOTH
pub const SHARE_DENY_BOTH: u32 = SHARE_DENY_READ | SHARE_DENY_WRITE;

/// One open share reservation.
#[derive(Debug, Clone)]
struct OpenState {
    client_id: u64,
    stateid: StateId,
    access: u32,
    deny: u32,
}

impl OpenState {
    fn conflicts(&self, access: u32, deny: u32) -> bool {
        (access & self.deny) != 0 || (deny & self.access) != 0
    }
}

/// Per-file share reservations.
#[derive(Default)]
pub struct FileTracker {
    files: KeyedCollections<FileId, OpenState>,
}

impl FileTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new open of `file` by `client`.
    ///
    /// Fails with [`NfsError::ShareDenied`] if an existing open denies what
    /// is requested or requests what is denied. On success a new open state
    /// owned by `client` is created and its stateid returned. Masks are
    /// compared as given, so OPEN4_SHARE_ACCESS_WANT_* flags pass through.
    pub fn add_open(
        &self,
        client: &NfsClient,
        file: &FileId,
        access: u32,
        deny: u32,
    ) -> Result<StateId> {
        self.files.with_collection(file, |opens| {
            if opens.iter().any(|os| os.conflicts(access, deny)) {
                debug!("Share conflict on {}: access={} deny={}", file, access, deny);
                return Err(NfsError::ShareDenied);
            }

            let stateid = client.create_state(StateKind::Open { file: file.clone() });
            opens.push(OpenState {
                client_id: client.id(),
                stateid,
                access,
                deny,
            });
            Ok(stateid)
        })
    }

    /// Share access recorded for the open `stateid` of `client` on `file`.
    pub fn get_share_access(
        &self,
        client: &NfsClient,
        file: &FileId,
        stateid: &StateId,
    ) -> Result<u32> {
        self.files
            .with_existing(file, |opens| {
                opens
                    .iter()
                    .find(|os| os.client_id == client.id() && os.stateid == *stateid)
                    .map(|os| os.access)
            })
            .flatten()
            .ok_or(NfsError::BadStateid)
    }

    /// Drop the reservation held by `stateid`. Returns false if none matched.
    pub fn remove_open(&self, file: &FileId, stateid: &StateId) -> bool {
        self.files
            .with_existing(file, |opens| {
                let before = opens.len();
                opens.retain(|os| os.stateid != *stateid);
                before != opens.len()
            })
            .unwrap_or(false)
    }

    /// Number of opens currently recorded on `file`.
    pub fn open_count(&self, file: &FileId) -> usize {
        self.files.with_existing(file, |opens| opens.len()).unwrap_or(0)
    }

    /// Number of files with at least one open.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

#[async_trait]
impl StateRelease for FileTracker {
    async fn release(&self, client_id: u64, state: &NfsState) {
        if let StateKind::Open { file } = &state.kind {
            if self.remove_open(file, &state.stateid) {
                debug!(
                    "Released open {} of client {:#x} on {}",
                    state.stateid, client_id, file
                );
            }
        }
    }
}
