#![warn(missing_docs)]

//! NFSv4.1 server state core: client/session tracking, share reservations,
//! byte-range locks, delegation heuristics and a caching VFS decorator.

pub mod client;
pub mod clock;
pub mod config;
pub mod delegation;
#[cfg(feature = "etcd")]
pub mod dlm;
pub mod error;
pub mod file_tracker;
pub mod filehandle;
pub mod keyed;
pub mod lock;
pub mod lock_manager;
pub mod lru;
pub mod state;
pub mod state_handler;
pub mod stateid;
pub mod vfs;
pub mod vfs_cache;

pub use error::{NfsError, Result};
