//! Overlay state: one loaded community.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use overmesh_core::authentication::Authentication;
use overmesh_core::codec::Conversion;
use overmesh_core::destination::Destination;
use overmesh_core::distribution::Distribution;
use overmesh_core::error::{DropMessage, PolicyMismatch};
use overmesh_core::member::{Cid, Member};
use overmesh_core::message::Message;
use overmesh_core::meta::{MessageTable, MetaId, MetaMessage};
use overmesh_core::payload::PayloadCodec;
use overmesh_core::resolution::Resolution;
use overmesh_core::timeline::Timeline;
use overmesh_net::candidate::CandidateTable;

use crate::engine::HandlerScope;
use crate::store::{StorageError, SyncStore};

/// How far ahead of our own clock a message's global time may run before we
/// refuse it.
pub const ACCEPTABLE_GLOBAL_TIME_RANGE: u64 = 10_000;

/// Strikes at which an overlay is unloaded.
pub const STRIKE_LIMIT: u32 = 3;

/// Verdict of a check handler for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Admit,
    /// Buffer and ask the source for the missing permission proof.
    DelayByProof,
    /// Buffer until the sequence gap closes.
    DelayBySequence,
    /// Admissible wire input that policy forbids.
    Drop(DropMessage),
}

pub type CheckFn = Arc<dyn Fn(&mut HandlerScope<'_>, &Arc<Message>) -> Disposition + Send + Sync>;
pub type AcceptFn = Arc<dyn Fn(&mut HandlerScope<'_>, &[Arc<Message>]) + Send + Sync>;
pub type UndoFn = Arc<dyn Fn(&mut HandlerScope<'_>, &[Arc<Message>]) + Send + Sync>;

/// Handlers registered alongside a meta message.
#[derive(Clone)]
pub struct MetaHandlers {
    pub check: CheckFn,
    pub on_accept: AcceptFn,
    pub undo: Option<UndoFn>,
}

/// One meta message definition: policies plus handlers, registered at
/// overlay construction.
pub struct MetaDef {
    pub name: &'static str,
    pub tag: u8,
    pub authentication: Authentication,
    pub resolution: Resolution,
    pub distribution: Distribution,
    pub destination: Destination,
    pub codec: Box<dyn PayloadCodec>,
    pub handlers: MetaHandlers,
}

/// Lifecycle mode of a loaded overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayMode {
    Live,
    /// Terminal: answers introduction requests with the destroy proof,
    /// rejects everything else.
    HardKilled,
}

/// A loaded overlay and everything it exclusively owns.
pub struct Overlay {
    cid: Cid,
    master: Arc<Member>,
    my_member: Arc<Member>,
    global_time: u64,
    table: MessageTable,
    handlers: HashMap<MetaId, MetaHandlers>,
    conversions: Vec<Conversion>,
    timeline: Timeline,
    pub candidates: CandidateTable,
    strikes: u32,
    mode: OverlayMode,
    destroy_proof: Option<Vec<u8>>,
    acceptable_global_time_range: u64,
    sync_enabled: bool,
    claimed_sequences: HashMap<MetaId, u32>,
}

impl Overlay {
    pub fn new(cid: Cid, master: Arc<Member>, my_member: Arc<Member>) -> Self {
        let timeline = Timeline::new(master.mid());
        Self {
            cid,
            master,
            my_member,
            global_time: 1,
            table: MessageTable::new(),
            handlers: HashMap::new(),
            conversions: Vec::new(),
            timeline,
            candidates: CandidateTable::new(),
            strikes: 0,
            mode: OverlayMode::Live,
            destroy_proof: None,
            acceptable_global_time_range: ACCEPTABLE_GLOBAL_TIME_RANGE,
            sync_enabled: true,
            claimed_sequences: HashMap::new(),
        }
    }

    /// Accept the full 64-bit global time range (tracker deployment).
    pub fn accept_full_time_range(&mut self) {
        self.acceptable_global_time_range = u64::MAX;
    }

    /// Stop answering sync selections (tracker deployment).
    pub fn disable_sync(&mut self) {
        self.sync_enabled = false;
    }

    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled
    }

    /// Register one meta message and its handlers; ids are stable across
    /// reloads via the store.
    pub fn register(&mut self, def: MetaDef, store: &SyncStore) -> Result<(), RegisterError> {
        let priority = def.distribution.priority().unwrap_or(0);
        let direction = def
            .distribution
            .direction()
            .map(|d| d.database_value())
            .unwrap_or(0);
        let id = store.register_meta(&self.cid, def.name, priority, direction)?;
        let meta = MetaMessage::new(
            def.name,
            def.tag,
            id,
            def.authentication,
            def.resolution,
            def.distribution,
            def.destination,
            def.codec,
        )?;
        self.table.register(meta)?;
        self.handlers.insert(id, def.handlers);
        Ok(())
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn master(&self) -> &Arc<Member> {
        &self.master
    }

    pub fn my_member(&self) -> &Arc<Member> {
        &self.my_member
    }

    pub fn table(&self) -> &MessageTable {
        &self.table
    }

    pub fn handlers(&self, meta_id: MetaId) -> Option<&MetaHandlers> {
        self.handlers.get(&meta_id)
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn timeline_mut(&mut self) -> &mut Timeline {
        &mut self.timeline
    }

    // ------------------------------------------------------------------
    // logical time
    // ------------------------------------------------------------------

    pub fn global_time(&self) -> u64 {
        self.global_time
    }

    /// Return the current global time and advance the clock.
    pub fn claim_global_time(&mut self) -> u64 {
        let claimed = self.global_time;
        self.global_time += 1;
        claimed
    }

    /// Fold an observed global time into our clock; the clock never moves
    /// backwards and refuses values beyond the acceptable range.
    pub fn update_global_time(&mut self, observed: u64) {
        if observed > self.global_time && self.acceptable_time(observed) {
            self.global_time = observed;
        }
    }

    /// Whether a message at `global_time` is within the window we accept.
    pub fn acceptable_time(&self, global_time: u64) -> bool {
        global_time <= self.global_time.saturating_add(self.acceptable_global_time_range)
    }

    /// Claim the next sequence number for `meta`, seeded from the store.
    pub fn claim_sequence_number(
        &mut self,
        meta: &MetaMessage,
        store: &SyncStore,
    ) -> Result<u32, StorageError> {
        let next = match self.claimed_sequences.get(&meta.database_id()) {
            Some(current) => current + 1,
            None => store.last_sequence(&self.cid, &self.my_member.mid(), meta.database_id())? + 1,
        };
        self.claimed_sequences.insert(meta.database_id(), next);
        Ok(next)
    }

    // ------------------------------------------------------------------
    // conversions
    // ------------------------------------------------------------------

    pub fn add_conversion(&mut self, conversion: Conversion) {
        self.conversions.push(conversion);
    }

    pub fn conversion_for(&self, community_version: u8) -> Option<&Conversion> {
        self.conversions
            .iter()
            .find(|c| c.community_version() == community_version)
    }

    /// The conversion used for locally created packets: the highest
    /// registered version.
    pub fn default_conversion(&self) -> Option<&Conversion> {
        self.conversions.iter().max_by_key(|c| c.community_version())
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    pub fn mode(&self) -> OverlayMode {
        self.mode
    }

    pub fn is_hard_killed(&self) -> bool {
        self.mode == OverlayMode::HardKilled
    }

    /// Transition to the hard-killed shell, retaining the destroy proof.
    pub fn hard_kill(&mut self, proof: Vec<u8>) {
        self.mode = OverlayMode::HardKilled;
        self.destroy_proof = Some(proof);
    }

    pub fn destroy_proof(&self) -> Option<&[u8]> {
        self.destroy_proof.as_deref()
    }

    pub fn strikes(&self) -> u32 {
        self.strikes
    }

    /// Strike accounting: reset on any active candidate, else increment.
    /// Hard-killed shells always accumulate strikes.
    pub fn update_strikes(&mut self, now: Instant) -> u32 {
        if !self.is_hard_killed() && self.candidates.has_active(now) {
            self.strikes = 0;
        } else {
            self.strikes += 1;
        }
        self.strikes
    }
}

/// Errors while registering meta messages.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Policy(#[from] PolicyMismatch),
}

#[cfg(test)]
mod tests {
    use super::*;
    use overmesh_core::member::{KeyStrength, MemberRegistry, MemoryMemberStore};
    use std::time::Duration;

    fn members() -> (Arc<Member>, Arc<Member>) {
        let registry = MemberRegistry::new(Arc::new(MemoryMemberStore::default())).unwrap();
        (
            registry.new_random(KeyStrength::Medium).unwrap(),
            registry.new_random(KeyStrength::Medium).unwrap(),
        )
    }

    fn overlay() -> Overlay {
        let (master, me) = members();
        Overlay::new(Cid::from(master.mid()), master, me)
    }

    #[test]
    fn test_claim_global_time_returns_then_increments() {
        let mut overlay = overlay();
        assert_eq!(overlay.claim_global_time(), 1);
        assert_eq!(overlay.claim_global_time(), 2);
        assert_eq!(overlay.global_time(), 3);
    }

    #[test]
    fn test_update_global_time_monotonic_and_bounded() {
        let mut overlay = overlay();
        overlay.update_global_time(50);
        assert_eq!(overlay.global_time(), 50);
        overlay.update_global_time(10);
        assert_eq!(overlay.global_time(), 50);
        // Far beyond the acceptable range: refused.
        overlay.update_global_time(50 + ACCEPTABLE_GLOBAL_TIME_RANGE + 1);
        assert_eq!(overlay.global_time(), 50);
    }

    #[test]
    fn test_strike_rule() {
        let mut overlay = overlay();
        let now = Instant::now();
        assert_eq!(overlay.update_strikes(now), 1);
        assert_eq!(overlay.update_strikes(now), 2);

        // An active candidate resets the counter.
        overlay
            .candidates
            .get_or_insert("10.0.0.1:6421".parse().unwrap())
            .mark_stumble(now);
        assert_eq!(overlay.update_strikes(now), 0);

        // Once the candidate expires, strikes resume.
        let later = now + Duration::from_secs(180);
        assert_eq!(overlay.update_strikes(later), 1);
    }

    #[test]
    fn test_hard_kill_retains_proof() {
        let mut overlay = overlay();
        assert_eq!(overlay.mode(), OverlayMode::Live);
        overlay.hard_kill(b"destroy-packet".to_vec());
        assert!(overlay.is_hard_killed());
        assert_eq!(overlay.destroy_proof(), Some(b"destroy-packet".as_slice()));

        // Hard-killed shells accumulate strikes even with live candidates.
        let now = Instant::now();
        overlay
            .candidates
            .get_or_insert("10.0.0.1:6421".parse().unwrap())
            .mark_stumble(now);
        assert_eq!(overlay.update_strikes(now), 1);
    }
}
