//! NFSv4.1 client records and sessions (RFC 5661).
//!
//! A client record is created by EXCHANGE_ID and confirmed by its first
//! successful CREATE_SESSION. It owns every state handle issued to it and
//! the sessions it created; its lease must be renewed within the lease time
//! or all of that state is discarded.
//!
//! Sessions track per-slot sequence numbers to detect and handle replayed
//! requests.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{NfsError, Result};
use crate::state::{NfsState, StateKind, StateRelease};
use crate::stateid::StateId;

/// Collaborators notified when a client drops one of its states.
pub type Releasers = Arc<Vec<Arc<dyn StateRelease>>>;

/// NFSv4.1 session ID (16 bytes, globally unique)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; 16]);

impl SessionId {
    /// Create a new session ID from client_id, session sequence, and random component
    pub fn new(client_id: u64, session_seq: u32, random: u32) -> Self {
        let mut id = [0u8; 16];
        id[0..8].copy_from_slice(&client_id.to_be_bytes());
        id[8..12].copy_from_slice(&session_seq.to_be_bytes());
        id[12..16].copy_from_slice(&random.to_be_bytes());
        SessionId(id)
    }

    /// Client id embedded in the first 8 bytes
    pub fn client_id(&self) -> u64 {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.0[0..8]);
        u64::from_be_bytes(id)
    }

    /// Session creation sequence embedded in bytes 8..12
    pub fn sequence(&self) -> u32 {
        u32::from_be_bytes([self.0[8], self.0[9], self.0[10], self.0[11]])
    }

    /// Format as hex string "xxxxxxxx-xxxxxxxx-xxxxxxxx-xxxxxxxx"
    pub fn to_hex(&self) -> String {
        self.0
            .chunks(4)
            .map(|c| c.iter().map(|b| format!("{:02x}", b)).collect::<String>())
            .collect::<Vec<_>>()
            .join("-")
    }
}

/// A slot in the session slot table
#[derive(Debug, Clone)]
pub struct Slot {
    pub slot_id: u32,
    pub sequence_id: u32,
    pub in_use: bool,
    pub cached_reply: Option<Vec<u8>>,
}

impl Slot {
    pub fn new(slot_id: u32) -> Self {
        Slot {
            slot_id,
            sequence_id: 0,
            in_use: false,
            cached_reply: None,
        }
    }

    /// Validate incoming sequence_id: last+1 is new, equal is a replay
    pub fn validate_sequence(&self, incoming_seq: u32) -> SlotResult {
        if incoming_seq == self.sequence_id {
            SlotResult::Replay
        } else if incoming_seq == self.sequence_id.wrapping_add(1) {
            SlotResult::NewRequest
        } else {
            SlotResult::InvalidSequence {
                expected: self.sequence_id.wrapping_add(1),
                got: incoming_seq,
            }
        }
    }

    /// Mark slot as in-use for a new request
    pub fn acquire(&mut self, sequence_id: u32) {
        self.in_use = true;
        self.sequence_id = sequence_id;
        self.cached_reply = None;
    }

    /// Release slot, optionally caching the reply
    pub fn release(&mut self, reply: Option<Vec<u8>>) {
        self.in_use = false;
        self.cached_reply = reply;
    }
}

/// Result of slot sequence validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotResult {
    NewRequest,
    Replay,
    InvalidSequence { expected: u32, got: u32 },
}

/// NFSv4.1 session: an ordered channel between one client and the server.
#[derive(Debug)]
pub struct NfsSession {
    session_id: SessionId,
    client_id: u64,
    sequence: u32,
    created_at: Instant,
    slots: Mutex<Vec<Slot>>,
}

impl NfsSession {
    fn new(client_id: u64, sequence: u32, slot_count: u32, created_at: Instant) -> Self {
        let session_id = SessionId::new(client_id, sequence, rand::random());
        NfsSession {
            session_id,
            client_id,
            sequence,
            created_at,
            slots: Mutex::new((0..slot_count).map(Slot::new).collect()),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Creation sequence number this session was made with
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn slot_count(&self) -> u32 {
        self.slots.lock().len() as u32
    }

    /// Classify a SEQUENCE request on `slot_id`. A new request takes the
    /// slot; a replay leaves it untouched so the cached reply can be sent.
    pub fn check_slot(&self, slot_id: u32, sequence_id: u32) -> Result<SlotResult> {
        let mut slots = self.slots.lock();
        let max = slots.len() as u32;
        let slot = slots.get_mut(slot_id as usize).ok_or_else(|| {
            NfsError::inval(format!("slot {} out of range (max {})", slot_id, max))
        })?;

        match slot.validate_sequence(sequence_id) {
            SlotResult::NewRequest => {
                slot.acquire(sequence_id);
                Ok(SlotResult::NewRequest)
            }
            SlotResult::Replay => {
                debug!(
                    "Replay on session {} slot {} seq {}",
                    self.session_id.to_hex(),
                    slot_id,
                    sequence_id
                );
                Ok(SlotResult::Replay)
            }
            SlotResult::InvalidSequence { expected, got } => Err(NfsError::SeqMisordered {
                expected,
                received: got,
            }),
        }
    }

    /// Finish the request running on `slot_id`, caching its reply for replays.
    pub fn complete_slot(&self, slot_id: u32, reply: Option<Vec<u8>>) {
        if let Some(slot) = self.slots.lock().get_mut(slot_id as usize) {
            slot.release(reply);
        }
    }

    pub fn cached_reply(&self, slot_id: u32) -> Option<Vec<u8>> {
        self.slots
            .lock()
            .get(slot_id as usize)
            .and_then(|s| s.cached_reply.clone())
    }
}

impl fmt::Display for NfsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} seq={}", self.session_id.to_hex(), self.sequence)
    }
}

/// Limits applied to a client record.
#[derive(Debug, Clone, Copy)]
pub struct ClientLimits {
    /// Time within which the client must renew its lease
    pub lease_time: Duration,
    /// Upper bound on a session's slot table
    pub max_session_slots: u32,
}

struct ClientInner {
    confirmed: bool,
    next_state: u32,
    session_sequence: u32,
    states: HashMap<StateId, NfsState>,
    sessions: BTreeMap<u32, Arc<NfsSession>>,
    last_renewal: Instant,
}

/// NFSv4 client record.
///
/// Mutable state (confirmation, counters, states, sessions and the lease
/// timestamp) is guarded as one unit.
pub struct NfsClient {
    client_id: u64,
    owner: Vec<u8>,
    verifier: [u8; 8],
    principal: String,
    limits: ClientLimits,
    clock: Arc<dyn Clock>,
    releasers: Releasers,
    inner: Mutex<ClientInner>,
}

impl NfsClient {
    pub fn new(
        client_id: u64,
        owner: Vec<u8>,
        verifier: [u8; 8],
        principal: String,
        limits: ClientLimits,
        clock: Arc<dyn Clock>,
        releasers: Releasers,
    ) -> Self {
        let now = clock.now();
        debug!("New client id: {:#x}", client_id);
        NfsClient {
            client_id,
            owner,
            verifier,
            principal,
            limits,
            clock,
            releasers,
            inner: Mutex::new(ClientInner {
                confirmed: false,
                next_state: 1,
                session_sequence: 1,
                states: HashMap::new(),
                sessions: BTreeMap::new(),
                last_renewal: now,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.client_id
    }

    /// Owner string from EXCHANGE_ID
    pub fn owner(&self) -> &[u8] {
        &self.owner
    }

    pub fn verifier(&self) -> &[u8; 8] {
        &self.verifier
    }

    /// False if the client rebooted since this record was made
    pub fn verifier_matches(&self, verifier: &[u8; 8]) -> bool {
        &self.verifier == verifier
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn is_confirmed(&self) -> bool {
        self.inner.lock().confirmed
    }

    /// Sequence number the next CREATE_SESSION must carry
    pub fn current_sequence(&self) -> u32 {
        self.inner.lock().session_sequence
    }

    /// CREATE_SESSION.
    ///
    /// `sequence` equal to the expected value creates a session; one less is
    /// a retransmission and returns the session created by that call;
    /// anything else is misordered.
    pub fn create_session(&self, sequence: u32, slot_count: u32) -> Result<Arc<NfsSession>> {
        let mut inner = self.inner.lock();
        let expected = inner.session_sequence;

        if sequence == expected {
            let slots = slot_count.clamp(1, self.limits.max_session_slots.max(1));
            let session = Arc::new(NfsSession::new(
                self.client_id,
                sequence,
                slots,
                self.clock.now(),
            ));
            inner.sessions.insert(sequence, session.clone());
            inner.session_sequence = expected.wrapping_add(1);
            if !inner.confirmed {
                inner.confirmed = true;
                info!("Client {:#x} confirmed", self.client_id);
            }
            debug!(
                "Created session {} for client {:#x}",
                session.id().to_hex(),
                self.client_id
            );
            return Ok(session);
        }

        if sequence == expected.wrapping_sub(1) {
            if let Some(session) = inner.sessions.get(&sequence) {
                debug!("Retransmit on create session detected");
                return Ok(session.clone());
            }
        }

        Err(NfsError::SeqMisordered {
            expected,
            received: sequence,
        })
    }

    pub fn session(&self, sequence: u32) -> Option<Arc<NfsSession>> {
        self.inner.lock().sessions.get(&sequence).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<NfsSession>> {
        self.inner.lock().sessions.values().cloned().collect()
    }

    pub fn has_sessions(&self) -> bool {
        !self.inner.lock().sessions.is_empty()
    }

    /// DESTROY_SESSION. Returns the removed session, if it belonged here.
    pub fn remove_session(&self, session_id: &SessionId) -> Option<Arc<NfsSession>> {
        let mut inner = self.inner.lock();
        let sequence = session_id.sequence();
        match inner.sessions.get(&sequence) {
            Some(s) if s.id() == session_id => inner.sessions.remove(&sequence),
            _ => None,
        }
    }

    /// Issue a new state handle owned by this client.
    pub fn create_state(&self, kind: StateKind) -> StateId {
        let mut inner = self.inner.lock();
        let stateid = StateId::new(self.client_id, inner.next_state);
        inner.next_state = inner.next_state.wrapping_add(1);
        debug!("Client {:#x} new state {} {:?}", self.client_id, stateid, kind);
        inner.states.insert(stateid, NfsState::new(stateid, kind));
        stateid
    }

    pub fn state(&self, stateid: &StateId) -> Result<NfsState> {
        self.inner
            .lock()
            .states
            .get(stateid)
            .cloned()
            .ok_or(NfsError::BadStateid)
    }

    /// Advance the sequence counter of a state; returns the new stateid.
    pub fn bump_seqid(&self, stateid: &StateId) -> Result<StateId> {
        let mut inner = self.inner.lock();
        let state = inner.states.get_mut(stateid).ok_or(NfsError::BadStateid)?;
        state.bump_seqid();
        Ok(state.stateid)
    }

    pub fn has_state(&self) -> bool {
        !self.inner.lock().states.is_empty()
    }

    pub fn state_count(&self) -> usize {
        self.inner.lock().states.len()
    }

    /// Drop one state (CLOSE, LOCKU, DELEGRETURN) and release it everywhere.
    pub async fn release_state(&self, stateid: &StateId) -> Result<()> {
        let state = self
            .inner
            .lock()
            .states
            .remove(stateid)
            .ok_or(NfsError::BadStateid)?;
        self.release_states(vec![state]).await;
        Ok(())
    }

    /// True if the lease has not been renewed within the lease time.
    pub fn is_lease_expired(&self) -> bool {
        let inner = self.inner.lock();
        self.clock.now().saturating_duration_since(inner.last_renewal) > self.limits.lease_time
    }

    /// Renew the lease. If it already expired, every owned state is
    /// disposed and `Expired` is returned.
    pub async fn update_lease(&self) -> Result<()> {
        let expired = {
            let mut inner = self.inner.lock();
            let now = self.clock.now();
            if now.saturating_duration_since(inner.last_renewal) > self.limits.lease_time {
                Some(inner.states.drain().map(|(_, s)| s).collect::<Vec<_>>())
            } else {
                inner.last_renewal = now;
                None
            }
        };

        match expired {
            Some(states) => {
                warn!(
                    "Lease expired for client {:#x}, dropping {} states",
                    self.client_id,
                    states.len()
                );
                self.release_states(states).await;
                Err(NfsError::Expired)
            }
            None => Ok(()),
        }
    }

    /// Renew the lease without checking for expiry.
    pub fn refresh_lease(&self) {
        let now = self.clock.now();
        self.inner.lock().last_renewal = now;
    }

    /// Dispose every owned state and forget all sessions.
    pub async fn dispose(&self) {
        let states = {
            let mut inner = self.inner.lock();
            inner.sessions.clear();
            inner.states.drain().map(|(_, s)| s).collect::<Vec<_>>()
        };
        self.release_states(states).await;
    }

    async fn release_states(&self, states: Vec<NfsState>) {
        for state in &states {
            for releaser in self.releasers.iter() {
                releaser.release(self.client_id, state).await;
            }
        }
    }
}

impl fmt::Display for NfsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{:#x}",
            String::from_utf8_lossy(&self.owner),
            self.client_id
        )
    }
}

impl fmt::Debug for NfsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NfsClient")
            .field("client_id", &format_args!("{:#x}", self.client_id))
            .field("owner", &String::from_utf8_lossy(&self.owner))
            .field("principal", &self.principal)
            .finish()
    }
}
