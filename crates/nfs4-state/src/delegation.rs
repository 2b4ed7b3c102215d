//! Adaptive read-delegation heuristic.
//!
//! Two bounded LRU queues track file accesses:
//!
//! - the eviction queue holds files seen once recently;
//! - the active queue holds files accessed repeatedly.
//!
//! A file is offered a delegation only while it sits in the active queue and
//! has not been idle for longer than the idle threshold. First access puts a
//! file into the eviction queue, a second access promotes it to the active
//! queue, and the third access within the idle window gets the delegation.
//!
//! ```text
//!   new file ──► eviction ──(hit)──► active ──(hit, fresh)──► delegate
//!                   ▲                  │
//!                   └──(idle / LRU)────┘
//! ```
//!
//! When the active queue overflows its least recently used file moves back
//! to the eviction queue if it is still fresh, or is forgotten. The eviction
//! queue simply forgets its least recently used file.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::DelegationConfig;
use crate::lru::LruMap;
use crate::state::FileId;

struct Queues {
    eviction: LruMap<FileId, Instant>,
    active: LruMap<FileId, Instant>,
}

/// Decides whether an OPEN should carry a read delegation.
pub struct AdaptiveDelegation {
    queues: Mutex<Queues>,
    max_active: usize,
    max_eviction: usize,
    max_idle: Duration,
    clock: Arc<dyn Clock>,
}

impl AdaptiveDelegation {
    pub fn new(max_active: usize, max_eviction: usize, max_idle: Duration) -> Self {
        Self::with_clock(max_active, max_eviction, max_idle, Arc::new(SystemClock))
    }

    pub fn with_clock(
        max_active: usize,
        max_eviction: usize,
        max_idle: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        AdaptiveDelegation {
            queues: Mutex::new(Queues {
                eviction: LruMap::with_capacity(max_eviction + 1),
                active: LruMap::with_capacity(max_active + 1),
            }),
            max_active,
            max_eviction,
            max_idle,
            clock,
        }
    }

    pub fn from_config(config: &DelegationConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_clock(
            config.active_capacity,
            config.eviction_capacity,
            Duration::from_secs(config.max_idle_secs),
            clock,
        )
    }

    fn push_eviction(&self, queues: &mut Queues, file: FileId, last_access: Instant) {
        queues.eviction.insert(file, last_access);
        if queues.eviction.len() > self.max_eviction {
            queues.eviction.pop_lru();
        }
    }

    /// Record an access to `file` and tell whether to delegate it.
    pub fn should_delegate(&self, file: &FileId) -> bool {
        let now = self.clock.now();
        let mut queues = self.queues.lock();

        if let Some(&last_access) = queues.active.peek(file) {
            if now.saturating_duration_since(last_access) > self.max_idle {
                debug!("{} idle in active queue, demoting", file);
                queues.active.remove(file);
                self.push_eviction(&mut queues, file.clone(), last_access);
                return false;
            }
            queues.active.insert(file.clone(), now);
            return true;
        }

        if queues.eviction.remove(file).is_some() {
            queues.active.insert(file.clone(), now);
            if queues.active.len() > self.max_active {
                if let Some((oldest, last_access)) = queues.active.pop_lru() {
                    if now.saturating_duration_since(last_access) < self.max_idle {
                        self.push_eviction(&mut queues, oldest, last_access);
                    }
                }
            }
        } else {
            self.push_eviction(&mut queues, file.clone(), now);
        }
        false
    }

    /// Forget all tracked files.
    pub fn reset(&self) {
        let mut queues = self.queues.lock();
        queues.eviction.clear();
        queues.active.clear();
    }

    pub fn is_in_active(&self, file: &FileId) -> bool {
        self.queues.lock().active.contains(file)
    }

    pub fn is_in_eviction(&self, file: &FileId) -> bool {
        self.queues.lock().eviction.contains(file)
    }

    pub fn active_len(&self) -> usize {
        self.queues.lock().active.len()
    }

    pub fn eviction_len(&self) -> usize {
        self.queues.lock().eviction.len()
    }
}
