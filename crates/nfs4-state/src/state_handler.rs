//! Registry of NFSv4 clients.
//!
//! Client ids are `(boot_epoch << 32) | counter`. The boot epoch is captured
//! once when the handler is built and the counter only ever grows, so ids
//! stay unique for the life of the process and differ across restarts.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::client::{ClientLimits, NfsClient, NfsSession, Releasers, SessionId};
use crate::clock::Clock;
use crate::error::{NfsError, Result};
use crate::state::{NfsState, StateRelease};
use crate::stateid::StateId;

/// Tracks every known client and hands out client ids.
pub struct StateHandler {
    boot_epoch: u32,
    next_client: AtomicU32,
    clients: DashMap<u64, Arc<NfsClient>>,
    limits: ClientLimits,
    clock: Arc<dyn Clock>,
    releasers: Releasers,
}

impl StateHandler {
    /// Create a handler whose boot epoch is the current wall-clock second.
    pub fn new(
        limits: ClientLimits,
        clock: Arc<dyn Clock>,
        releasers: Vec<Arc<dyn StateRelease>>,
    ) -> Self {
        let boot_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        Self::with_boot_epoch(boot_epoch, limits, clock, releasers)
    }

    /// Create a handler with an explicit boot epoch.
    pub fn with_boot_epoch(
        boot_epoch: u32,
        limits: ClientLimits,
        clock: Arc<dyn Clock>,
        releasers: Vec<Arc<dyn StateRelease>>,
    ) -> Self {
        info!("State handler started, boot epoch {:#x}", boot_epoch);
        StateHandler {
            boot_epoch,
            next_client: AtomicU32::new(1),
            clients: DashMap::new(),
            limits,
            clock,
            releasers: Arc::new(releasers),
        }
    }

    /// Server boot epoch, also used as the generation of volatile file handles
    pub fn boot_epoch(&self) -> u32 {
        self.boot_epoch
    }

    /// Lease time handed to clients
    pub fn limits(&self) -> ClientLimits {
        self.limits
    }

    fn next_client_id(&self) -> u64 {
        let counter = self.next_client.fetch_add(1, Ordering::Relaxed);
        ((self.boot_epoch as u64) << 32) | counter as u64
    }

    /// Register a new, unconfirmed client.
    pub fn create_client(
        &self,
        owner: Vec<u8>,
        verifier: [u8; 8],
        principal: impl Into<String>,
    ) -> Arc<NfsClient> {
        let client_id = self.next_client_id();
        let client = Arc::new(NfsClient::new(
            client_id,
            owner,
            verifier,
            principal.into(),
            self.limits,
            self.clock.clone(),
            self.releasers.clone(),
        ));
        self.clients.insert(client_id, client.clone());
        debug!("Registered client {}", client);
        client
    }

    pub fn client(&self, client_id: u64) -> Result<Arc<NfsClient>> {
        self.clients
            .get(&client_id)
            .map(|c| c.value().clone())
            .ok_or(NfsError::StaleClientId(client_id))
    }

    /// Find a client by the owner string it sent in EXCHANGE_ID.
    pub fn client_by_owner(&self, owner: &[u8]) -> Option<Arc<NfsClient>> {
        self.clients
            .iter()
            .find(|c| c.value().owner() == owner)
            .map(|c| c.value().clone())
    }

    /// Resolve a session id to its session.
    pub fn session(&self, session_id: &SessionId) -> Result<Arc<NfsSession>> {
        let client = self
            .client(session_id.client_id())
            .map_err(|_| NfsError::BadSession)?;
        match client.session(session_id.sequence()) {
            Some(session) if session.id() == session_id => Ok(session),
            _ => Err(NfsError::BadSession),
        }
    }

    /// Resolve a stateid through the client encoded in it.
    pub fn state(&self, stateid: &StateId) -> Result<NfsState> {
        let client = self
            .client(stateid.client_id())
            .map_err(|_| NfsError::BadStateid)?;
        client.state(stateid)
    }

    pub fn remove_session(&self, session_id: &SessionId) -> Result<()> {
        let client = self
            .client(session_id.client_id())
            .map_err(|_| NfsError::BadSession)?;
        client
            .remove_session(session_id)
            .map(|_| debug!("Removed session {}", session_id.to_hex()))
            .ok_or(NfsError::BadSession)
    }

    /// Forget a client and dispose all of its state.
    pub async fn remove_client(&self, client_id: u64) -> Result<()> {
        let (_, client) = self
            .clients
            .remove(&client_id)
            .ok_or(NfsError::StaleClientId(client_id))?;
        client.dispose().await;
        info!("Removed client {}", client);
        Ok(())
    }

    /// Snapshot of all registered clients.
    pub fn clients(&self) -> Vec<Arc<NfsClient>> {
        self.clients.iter().map(|c| c.value().clone()).collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Remove every client whose lease has run out, disposing their state.
    /// Returns the removed client ids.
    pub async fn expire_stale_clients(&self) -> Vec<u64> {
        let stale: Vec<u64> = self
            .clients
            .iter()
            .filter(|c| c.value().is_lease_expired())
            .map(|c| *c.key())
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for client_id in stale {
            let removed = self
                .clients
                .remove_if(&client_id, |_, c| c.is_lease_expired());
            if let Some((_, client)) = removed {
                client.dispose().await;
                expired.push(client_id);
            }
        }

        if !expired.is_empty() {
            warn!("Expired {} stale clients", expired.len());
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::RecordingRelease;
    use crate::clock::ManualClock;
    use crate::state::{FileId, StateKind};
    use std::time::Duration;

    const EPOCH: u32 = 0x5f00_0001;

    fn handler() -> (StateHandler, Arc<ManualClock>, Arc<RecordingRelease>) {
        let clock = Arc::new(ManualClock::new());
        let recorder = Arc::new(RecordingRelease::default());
        let handler = StateHandler::with_boot_epoch(
            EPOCH,
            ClientLimits {
                lease_time: Duration::from_secs(90),
                max_session_slots: 16,
            },
            clock.clone(),
            vec![recorder.clone() as Arc<dyn StateRelease>],
        );
        (handler, clock, recorder)
    }

    fn open_kind() -> StateKind {
        StateKind::Open {
            file: FileId::new(b"file".to_vec()),
        }
    }

    #[test]
    fn test_client_ids_embed_boot_epoch() {
        let (handler, _, _) = handler();
        let c1 = handler.create_client(b"a".to_vec(), [0; 8], "p");
        let c2 = handler.create_client(b"b".to_vec(), [0; 8], "p");
        assert_eq!(c1.id() >> 32, EPOCH as u64);
        assert_eq!(c1.id() & 0xffff_ffff, 1);
        assert_eq!(c2.id() & 0xffff_ffff, 2);
        assert_eq!(handler.client_count(), 2);
    }

    #[test]
    fn test_new_uses_wall_clock_epoch() {
        let handler = StateHandler::new(
            ClientLimits {
                lease_time: Duration::from_secs(90),
                max_session_slots: 16,
            },
            Arc::new(ManualClock::new()),
            Vec::new(),
        );
        assert!(handler.boot_epoch() > 0);
    }

    #[test]
    fn test_find_client() {
        let (handler, _, _) = handler();
        let client = handler.create_client(b"owner-1".to_vec(), [0; 8], "p");
        assert!(Arc::ptr_eq(&handler.client(client.id()).unwrap(), &client));
        assert!(Arc::ptr_eq(
            &handler.client_by_owner(b"owner-1").unwrap(),
            &client
        ));
        assert!(handler.client_by_owner(b"nobody").is_none());
        assert!(matches!(
            handler.client(42),
            Err(NfsError::StaleClientId(42))
        ));
    }

    #[test]
    fn test_find_session() {
        let (handler, _, _) = handler();
        let client = handler.create_client(b"a".to_vec(), [0; 8], "p");
        let session = client.create_session(1, 4).unwrap();

        let found = handler.session(session.id()).unwrap();
        assert!(Arc::ptr_eq(&found, &session));

        let mut bytes = session.id().0;
        bytes[15] ^= 0xff;
        assert!(matches!(
            handler.session(&SessionId(bytes)),
            Err(NfsError::BadSession)
        ));
        assert!(matches!(
            handler.session(&SessionId::new(99, 1, 0)),
            Err(NfsError::BadSession)
        ));
    }

    #[test]
    fn test_remove_session() {
        let (handler, _, _) = handler();
        let client = handler.create_client(b"a".to_vec(), [0; 8], "p");
        let session = client.create_session(1, 4).unwrap();
        handler.remove_session(session.id()).unwrap();
        assert!(matches!(
            handler.session(session.id()),
            Err(NfsError::BadSession)
        ));
        assert!(matches!(
            handler.remove_session(session.id()),
            Err(NfsError::BadSession)
        ));
    }

    #[test]
    fn test_find_state() {
        let (handler, _, _) = handler();
        let client = handler.create_client(b"a".to_vec(), [0; 8], "p");
        let stateid = client.create_state(open_kind());
        assert_eq!(handler.state(&stateid).unwrap().kind, open_kind());
        assert!(matches!(
            handler.state(&StateId::new(7, 1)),
            Err(NfsError::BadStateid)
        ));
    }

    #[tokio::test]
    async fn test_remove_client_disposes_state() {
        let (handler, _, recorder) = handler();
        let client = handler.create_client(b"a".to_vec(), [0; 8], "p");
        client.create_state(open_kind());

        handler.remove_client(client.id()).await.unwrap();
        assert_eq!(handler.client_count(), 0);
        assert_eq!(recorder.released.lock().len(), 1);
        assert!(matches!(
            handler.remove_client(client.id()).await,
            Err(NfsError::StaleClientId(_))
        ));
    }

    #[tokio::test]
    async fn test_expire_stale_clients() {
        let (handler, clock, recorder) = handler();
        let idle = handler.create_client(b"idle".to_vec(), [0; 8], "p");
        let busy = handler.create_client(b"busy".to_vec(), [0; 8], "p");
        idle.create_state(open_kind());

        clock.advance(Duration::from_secs(60));
        busy.refresh_lease();
        clock.advance(Duration::from_secs(40));

        let expired = handler.expire_stale_clients().await;
        assert_eq!(expired, vec![idle.id()]);
        assert_eq!(handler.client_count(), 1);
        assert!(handler.client(busy.id()).is_ok());
        assert_eq!(recorder.released.lock().len(), 1);
    }
}
