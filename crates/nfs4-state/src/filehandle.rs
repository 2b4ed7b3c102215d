//! NFS file handle wire format.
//!
//! ```text
//! +---------+----------------+------------+--------+------+------+-----------+
//! | version | magic (3 byte) | generation | export | type | olen | opaque... |
//! +---------+----------------+------------+--------+------+------+-----------+
//!     1            3               4          1       1      1      <= 117
//! ```
//!
//! The generation is the server boot epoch, or 0 for handles that survive
//! restarts.

use std::fmt;

use crate::error::{NfsError, Result};

/// Current handle format version
pub const FH_VERSION: u8 = 1;
/// Magic constant stored in the low 24 bits of the first word
pub const FH_MAGIC: u32 = 0x00CA_FFEE;
/// Fixed header size
pub const FH_HEADER_LEN: usize = 11;
/// Maximum opaque payload, keeping the handle within NFS4_FHSIZE (128)
pub const FH_MAX_OPAQUE: usize = 117;

/// Handle type for objects of the exported filesystem
pub const FH_TYPE_REGULAR: u8 = 0;
/// Handle type for pseudo-filesystem nodes
pub const FH_TYPE_PSEUDO: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileHandle {
    pub generation: u32,
    pub export_idx: u8,
    pub fh_type: u8,
    opaque: Vec<u8>,
}

impl FileHandle {
    pub fn new(generation: u32, export_idx: u8, fh_type: u8, opaque: Vec<u8>) -> Result<Self> {
        if opaque.len() > FH_MAX_OPAQUE {
            return Err(NfsError::BadHandle {
                reason: format!(
                    "opaque too long: {} > {}",
                    opaque.len(),
                    FH_MAX_OPAQUE
                ),
            });
        }
        Ok(FileHandle {
            generation,
            export_idx,
            fh_type,
            opaque,
        })
    }

    /// A handle with generation 0, valid across server restarts
    pub fn permanent(export_idx: u8, fh_type: u8, opaque: Vec<u8>) -> Result<Self> {
        Self::new(0, export_idx, fh_type, opaque)
    }

    pub fn opaque(&self) -> &[u8] {
        &self.opaque
    }

    pub fn is_pseudo_fs(&self) -> bool {
        self.fh_type == FH_TYPE_PSEUDO
    }

    pub fn is_permanent(&self) -> bool {
        self.generation == 0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(FH_HEADER_LEN + self.opaque.len());
        let magic_version = ((FH_VERSION as u32) << 24) | FH_MAGIC;
        bytes.extend_from_slice(&magic_version.to_be_bytes());
        bytes.extend_from_slice(&self.generation.to_be_bytes());
        bytes.push(self.export_idx);
        bytes.push(self.fh_type);
        bytes.push(self.opaque.len() as u8);
        bytes.extend_from_slice(&self.opaque);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FH_HEADER_LEN {
            return Err(NfsError::BadHandle {
                reason: "too short".to_string(),
            });
        }

        let magic_version = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let version = (magic_version >> 24) as u8;
        if version != FH_VERSION {
            return Err(NfsError::BadHandle {
                reason: format!("unsupported version: {}", version),
            });
        }
        if magic_version & 0x00FF_FFFF != FH_MAGIC {
            return Err(NfsError::BadHandle {
                reason: "bad magic number".to_string(),
            });
        }

        let generation = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let export_idx = bytes[8];
        let fh_type = bytes[9];
        let olen = bytes[10] as usize;
        if olen > FH_MAX_OPAQUE || bytes.len() < FH_HEADER_LEN + olen {
            return Err(NfsError::BadHandle {
                reason: format!("bad opaque length: {}", olen),
            });
        }

        Ok(FileHandle {
            generation,
            export_idx,
            fh_type,
            opaque: bytes[FH_HEADER_LEN..FH_HEADER_LEN + olen].to_vec(),
        })
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.to_bytes() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
