//! Error types for the NFSv4 state core

use thiserror::Error;

use crate::lock::Lock;

/// NFSv4 status: OK (success)
pub const NFS4_OK: u32 = 0;
/// NFSv4 status: I/O error
pub const NFS4ERR_IO: u32 = 5;
/// NFSv4 status: invalid argument
pub const NFS4ERR_INVAL: u32 = 22;
/// NFSv4 status: illegal file handle
pub const NFS4ERR_BADHANDLE: u32 = 10001;
/// NFSv4 status: server busy, retry later
pub const NFS4ERR_DELAY: u32 = 10008;
/// NFSv4 status: byte-range lock denied
pub const NFS4ERR_DENIED: u32 = 10010;
/// NFSv4 status: lease expired
pub const NFS4ERR_EXPIRED: u32 = 10011;
/// NFSv4 status: share reservation denied
pub const NFS4ERR_SHARE_DENIED: u32 = 10015;
/// NFSv4 status: client id unknown to the server
pub const NFS4ERR_STALE_CLIENTID: u32 = 10022;
/// NFSv4 status: stateid unknown
pub const NFS4ERR_BAD_STATEID: u32 = 10025;
/// NFSv4 status: session unknown
pub const NFS4ERR_BADSESSION: u32 = 10052;
/// NFSv4 status: sequence id out of order
pub const NFS4ERR_SEQ_MISORDERED: u32 = 10063;

/// Errors raised by the state, locking and caching subsystems.
#[derive(Error, Debug)]
pub enum NfsError {
    /// Requested share access/deny bits conflict with an existing open
    #[error("share reservation conflicts with an existing open")]
    ShareDenied,
    /// Byte-range lock overlaps a lock held by a different owner
    #[error("conflicting lock: {conflicting}")]
    LockDenied {
        /// The lock already held that caused the denial
        conflicting: Lock,
    },
    /// The per-file critical section could not be entered
    #[error("lock coordination failure: {reason}")]
    LockCoordination {
        /// What went wrong with the coordination backend
        reason: String,
    },
    /// stateid is unknown to the addressed client or file
    #[error("bad stateid")]
    BadStateid,
    /// Sequence number outside the accepted window
    #[error("bad sequence id: expected {expected}, received {received}")]
    SeqMisordered {
        /// Sequence number the server expected
        expected: u32,
        /// Sequence number the client sent
        received: u32,
    },
    /// The client's lease has expired and its state was discarded
    #[error("lease time expired")]
    Expired,
    /// Client id unknown to the server
    #[error("client {0:#x} not found")]
    StaleClientId(u64),
    /// Session id unknown to the server
    #[error("session not found")]
    BadSession,
    /// Malformed file handle
    #[error("bad file handle: {reason}")]
    BadHandle {
        /// Why decoding failed
        reason: String,
    },
    /// Invalid argument
    #[error("invalid argument: {reason}")]
    Inval {
        /// Which argument was rejected
        reason: String,
    },
    /// Failure reported by the backing filesystem
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NfsError {
    /// Converts the error to an NFSv4 status code for protocol responses.
    pub fn nfs4_status(&self) -> u32 {
        match self {
            NfsError::ShareDenied => NFS4ERR_SHARE_DENIED,
            NfsError::LockDenied { .. } => NFS4ERR_DENIED,
            NfsError::LockCoordination { .. } => NFS4ERR_DELAY,
            NfsError::BadStateid => NFS4ERR_BAD_STATEID,
            NfsError::SeqMisordered { .. } => NFS4ERR_SEQ_MISORDERED,
            NfsError::Expired => NFS4ERR_EXPIRED,
            NfsError::StaleClientId(_) => NFS4ERR_STALE_CLIENTID,
            NfsError::BadSession => NFS4ERR_BADSESSION,
            NfsError::BadHandle { .. } => NFS4ERR_BADHANDLE,
            NfsError::Inval { .. } => NFS4ERR_INVAL,
            NfsError::Io(_) => NFS4ERR_IO,
        }
    }

    /// True if the caller may retry the same request with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NfsError::LockCoordination { .. })
    }

    pub(crate) fn inval(reason: impl Into<String>) -> Self {
        NfsError::Inval {
            reason: reason.into(),
        }
    }

    pub(crate) fn coordination(reason: impl Into<String>) -> Self {
        NfsError::LockCoordination {
            reason: reason.into(),
        }
    }
}

/// Result type alias using NfsError as the error type.
pub type Result<T> = std::result::Result<T, NfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_denied_error() {
        let err = NfsError::ShareDenied;
        assert_eq!(
            err.to_string(),
            "share reservation conflicts with an existing open"
        );
        assert_eq!(err.nfs4_status(), NFS4ERR_SHARE_DENIED);
    }

    #[test]
    fn test_lock_denied_carries_conflicting_lock() {
        let held = Lock::new(0, 10, b"owner1".to_vec()).unwrap();
        let err = NfsError::LockDenied {
            conflicting: held.clone(),
        };
        assert_eq!(err.nfs4_status(), NFS4ERR_DENIED);
        match err {
            NfsError::LockDenied { conflicting } => assert_eq!(conflicting, held),
            other => panic!("expected LockDenied, got {:?}", other),
        }
    }

    #[test]
    fn test_coordination_is_retryable_and_distinct() {
        let err = NfsError::coordination("timed out");
        assert!(err.is_retryable());
        assert_eq!(err.nfs4_status(), NFS4ERR_DELAY);
        assert_ne!(err.nfs4_status(), NFS4ERR_DENIED);
        assert_eq!(err.to_string(), "lock coordination failure: timed out");
    }

    #[test]
    fn test_semantic_errors_are_not_retryable() {
        assert!(!NfsError::ShareDenied.is_retryable());
        assert!(!NfsError::BadStateid.is_retryable());
        assert!(!NfsError::Expired.is_retryable());
    }

    #[test]
    fn test_seq_misordered_display() {
        let err = NfsError::SeqMisordered {
            expected: 3,
            received: 5,
        };
        assert_eq!(err.to_string(), "bad sequence id: expected 3, received 5");
        assert_eq!(err.nfs4_status(), NFS4ERR_SEQ_MISORDERED);
    }

    #[test]
    fn test_stale_clientid_display() {
        let err = NfsError::StaleClientId(0xabc);
        assert_eq!(err.to_string(), "client 0xabc not found");
        assert_eq!(err.nfs4_status(), NFS4ERR_STALE_CLIENTID);
    }

    #[test]
    fn test_io_error_from() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: NfsError = io.into();
        assert_eq!(err.nfs4_status(), NFS4ERR_IO);
    }
}
