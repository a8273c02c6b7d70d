//! The dissemination engine: overlay map, inbound pipeline, and the
//! store/update/forward path.
//!
//! Inbound packets run `decode → dedupe → check → admit/delay/drop → store →
//! handler`, then admitted messages are forwarded per their destination
//! policy.  Delayed messages wait in bounded, TTL'd buffers keyed by the
//! fact that would heal them.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use overmesh_core::authentication::{Authentication, AuthenticationImpl};
use overmesh_core::codec::{
    is_fully_signed, peek_cid, peek_conversion_version, Conversion, DecodeError,
};
use overmesh_core::destination::{Destination, DestinationImpl};
use overmesh_core::distribution::DistributionImpl;
use overmesh_core::error::PolicyMismatch;
use overmesh_core::member::{Cid, KeyStrength, Member, MemberError, MemberRegistry, Mid};
use overmesh_core::message::Message;
use overmesh_core::meta::MetaId;
use overmesh_core::payload::{EmptyPayload, Payload};
use overmesh_core::resolution::{Resolution, ResolutionImpl};
use overmesh_core::timeline::Permission;
use overmesh_core::MIN_SYNC_PRIORITY;
use overmesh_net::endpoint::Endpoint;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::{debug, error, info, warn};

use crate::builtin::{
    self, AuthorizePayload, DestroyDegree, DestroyOverlayPayload, DynamicSettingsPayload,
    MissingIdentityPayload, MissingProofPayload, MissingSequencePayload, PermissionTriplet,
    SignatureRequestPayload,
};
use crate::community::{Disposition, MetaDef, Overlay, RegisterError, STRIKE_LIMIT};
use crate::store::{InsertOutcome, StorageError, SyncMetaDescriptor, SyncSelection, SyncStore};

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a delayed message waits for its proof or sequence gap.
    pub delay_ttl: Duration,
    /// Cap on buffered messages per delay fingerprint.
    pub max_delayed: usize,
    /// How long a pending co-sign request waits for its response.
    pub signature_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delay_ttl: Duration::from_secs(10),
            max_delayed: 128,
            signature_ttl: Duration::from_secs(10),
        }
    }
}

/// Pipeline counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    pub received: u64,
    pub admitted: u64,
    pub dropped: u64,
    pub delayed: u64,
    pub duplicates: u64,
    pub store_failures: u64,
}

/// Side effects requested by handlers, applied once the overlay is back in
/// the map.
pub enum EngineEvent {
    /// Raw packets to one address (missing-* responses, destroy proofs).
    SendPackets {
        to: SocketAddr,
        packets: Vec<Vec<u8>>,
    },
    /// A permission or resolution change may have healed delayed messages.
    ReleaseProofDelayed { cid: Cid },
    /// A destroy message was accepted.
    HardKill {
        cid: Cid,
        degree: DestroyDegree,
        proof: Vec<u8>,
        source: Option<SocketAddr>,
    },
    /// A countersignature arrived for a pending co-sign request.
    SignatureResponse {
        cid: Cid,
        identifier: u16,
        signature: Vec<u8>,
    },
}

/// A message a handler wants sent.
pub struct Outgoing {
    pub message: Message,
    /// Overrides destination-policy routing when set.
    pub to: Option<SocketAddr>,
    pub store: bool,
}

/// Borrowed view handed to check and accept handlers.  Handlers run on the
/// engine thread with exclusive access to the overlay.
pub struct HandlerScope<'a> {
    pub overlay: &'a mut Overlay,
    pub store: &'a SyncStore,
    pub registry: &'a MemberRegistry,
    pub now: Instant,
    pub local_addr: SocketAddrV4,
    pub outgoing: &'a mut Vec<Outgoing>,
    pub events: &'a mut Vec<EngineEvent>,
}

struct Delayed {
    cid: Cid,
    message: Arc<Message>,
    deadline: Instant,
}

struct PendingSignature {
    cid: Cid,
    packet: Vec<u8>,
    deadline: Instant,
}

/// Recipe for instantiating an overlay.
pub struct OverlayBlueprint {
    pub defs: Vec<MetaDef>,
    /// Conversion version bytes to register for this overlay.
    pub conversion_versions: Vec<u8>,
    pub verify_signatures: bool,
    pub accept_full_time_range: bool,
    pub enable_sync: bool,
}

impl OverlayBlueprint {
    /// The standard overlay: built-in metas under conversion `0x01`,
    /// signatures verified, sync enabled.
    pub fn standard() -> Self {
        Self {
            defs: builtin::default_meta_defs(),
            conversion_versions: vec![overmesh_core::BUILTIN_CONVERSION_VERSION],
            verify_signatures: true,
            accept_full_time_range: false,
            enable_sync: true,
        }
    }

    pub fn with_defs(mut self, defs: Vec<MetaDef>) -> Self {
        self.defs.extend(defs);
        self
    }
}

/// Factory consulted when a packet arrives for an unloaded overlay.
pub type AutoJoinFn = Box<dyn Fn(&Cid) -> OverlayBlueprint + Send>;

/// Engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown overlay {0}")]
    UnknownOverlay(Cid),
    #[error("unknown meta message {0:?}")]
    UnknownMeta(String),
    #[error("overlay has no conversion registered")]
    NoConversion,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error(transparent)]
    Member(#[from] MemberError),
    #[error(transparent)]
    Policy(#[from] PolicyMismatch),
}

/// The engine state.  Owned by a single engine thread (see the scheduler);
/// all overlay state hangs off this value.
pub struct Engine {
    registry: Arc<MemberRegistry>,
    store: Arc<SyncStore>,
    endpoint: Arc<dyn Endpoint>,
    my_member: Arc<Member>,
    overlays: HashMap<Cid, Overlay>,
    auto_join: Option<AutoJoinFn>,
    delayed_proof: HashMap<(Cid, Mid, MetaId), Vec<Delayed>>,
    delayed_sequence: HashMap<(Cid, Mid, MetaId), BTreeMap<u32, Delayed>>,
    pending_signatures: HashMap<u16, PendingSignature>,
    config: EngineConfig,
    stats: EngineStats,
    rng: StdRng,
}

impl Engine {
    /// Construct an engine around a store and endpoint, generating a fresh
    /// local member.
    pub fn new(
        store: Arc<SyncStore>,
        endpoint: Arc<dyn Endpoint>,
        strength: KeyStrength,
    ) -> Result<Self, EngineError> {
        let registry = Arc::new(MemberRegistry::new(store.clone())?);
        let my_member = registry.new_random(strength)?;
        Ok(Self {
            registry,
            store,
            endpoint,
            my_member,
            overlays: HashMap::new(),
            auto_join: None,
            delayed_proof: HashMap::new(),
            delayed_sequence: HashMap::new(),
            pending_signatures: HashMap::new(),
            config: EngineConfig::default(),
            stats: EngineStats::default(),
            rng: StdRng::from_entropy(),
        })
    }

    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    pub fn registry(&self) -> &Arc<MemberRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<SyncStore> {
        &self.store
    }

    pub fn my_member(&self) -> &Arc<Member> {
        &self.my_member
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Replace the endpoint (used when the endpoint is bound after the
    /// engine starts).
    pub fn set_endpoint(&mut self, endpoint: Arc<dyn Endpoint>) {
        self.endpoint = endpoint;
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    /// Install the auto-join factory: packets for unknown CIDs instantiate
    /// the overlay the factory describes (tracker behavior).
    pub fn set_auto_join(&mut self, factory: AutoJoinFn) {
        self.auto_join = Some(factory);
    }

    fn local_v4(&self) -> SocketAddrV4 {
        match self.endpoint.local_addr() {
            Some(SocketAddr::V4(v4)) => v4,
            _ => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        }
    }

    // ------------------------------------------------------------------
    // overlay lifecycle
    // ------------------------------------------------------------------

    /// Create a new overlay: a fresh master member whose MID becomes the
    /// CID.  The caller ends up holding the master key.
    pub fn create_overlay(&mut self, blueprint: OverlayBlueprint) -> Result<Cid, EngineError> {
        let master = self.registry.new_random(KeyStrength::High)?;
        let cid = Cid::from(master.mid());
        self.instantiate(cid, master, blueprint)?;
        self.announce_identity(cid);
        Ok(cid)
    }

    /// Join an overlay known only by CID; the master stays a dummy until
    /// its identity arrives.
    pub fn join_overlay(
        &mut self,
        cid: Cid,
        blueprint: OverlayBlueprint,
    ) -> Result<(), EngineError> {
        let master = self.registry.get_by_mid(&cid.as_mid());
        self.instantiate(cid, master, blueprint)?;
        self.announce_identity(cid);
        Ok(())
    }

    fn instantiate(
        &mut self,
        cid: Cid,
        master: Arc<Member>,
        blueprint: OverlayBlueprint,
    ) -> Result<(), EngineError> {
        let mut overlay = Overlay::new(cid, master, self.my_member.clone());
        if blueprint.accept_full_time_range {
            overlay.accept_full_time_range();
        }
        if !blueprint.enable_sync {
            overlay.disable_sync();
        }
        for def in blueprint.defs {
            overlay.register(def, &self.store)?;
        }
        for version in blueprint.conversion_versions {
            let conversion = if blueprint.verify_signatures {
                Conversion::new(cid, version)
            } else {
                Conversion::without_verification(cid, version)
            };
            overlay.add_conversion(conversion);
        }
        self.overlays.insert(cid, overlay);
        Ok(())
    }

    /// Store our identity packet so peers can learn our key on demand.
    fn announce_identity(&mut self, cid: Cid) {
        let has_identity = self
            .overlays
            .get(&cid)
            .is_some_and(|o| o.table().get(builtin::IDENTITY).is_some());
        if !has_identity {
            return;
        }
        if let Err(e) = self.create_message_opts(
            &cid,
            builtin::IDENTITY,
            Box::new(EmptyPayload),
            true,
            true,
            false,
        ) {
            warn!("failed to announce identity: {e}");
        }
    }

    pub fn overlay(&self, cid: &Cid) -> Option<&Overlay> {
        self.overlays.get(cid)
    }

    pub fn overlay_mut(&mut self, cid: &Cid) -> Option<&mut Overlay> {
        self.overlays.get_mut(cid)
    }

    pub fn overlays(&self) -> impl Iterator<Item = &Overlay> {
        self.overlays.values()
    }

    pub fn overlay_count(&self) -> usize {
        self.overlays.len()
    }

    /// Release an overlay's in-memory state; the store keeps its rows.
    pub fn unload_overlay(&mut self, cid: &Cid) {
        self.overlays.remove(cid);
        self.delayed_proof.retain(|key, _| key.0 != *cid);
        self.delayed_sequence.retain(|key, _| key.0 != *cid);
        self.pending_signatures.retain(|_, p| p.cid != *cid);
    }

    /// Schedule a destroy message for the overlay we master.
    pub fn destroy_overlay(&mut self, cid: &Cid, degree: DestroyDegree) -> Result<(), EngineError> {
        self.create_message(
            cid,
            builtin::DESTROY_OVERLAY,
            Box::new(DestroyOverlayPayload { degree }),
        )?;
        Ok(())
    }

    /// Count of distinct candidate addresses across loaded overlays.
    pub fn candidate_count(&self) -> usize {
        let mut addrs: HashSet<SocketAddr> = HashSet::new();
        for overlay in self.overlays.values() {
            addrs.extend(overlay.candidates.iter().map(|c| c.addr()));
        }
        addrs.len()
    }

    /// Whether any delayed message for `cid` is still buffered.
    pub fn has_delayed(&self, cid: &Cid) -> bool {
        self.delayed_proof.keys().any(|key| key.0 == *cid)
            || self.delayed_sequence.keys().any(|key| key.0 == *cid)
    }

    // ------------------------------------------------------------------
    // periodic tasks
    // ------------------------------------------------------------------

    /// Strike pass, run every 180 seconds: overlays with [`STRIKE_LIMIT`]
    /// consecutive empty intervals and no buffered messages are unloaded.
    /// Returns the unloaded CIDs.
    pub fn tick_strikes(&mut self, now: Instant) -> Vec<Cid> {
        let mut unloaded = Vec::new();
        let cids: Vec<Cid> = self.overlays.keys().copied().collect();
        for cid in cids {
            let strikes = match self.overlays.get_mut(&cid) {
                Some(overlay) => overlay.update_strikes(now),
                None => continue,
            };
            if strikes >= STRIKE_LIMIT && !self.has_delayed(&cid) {
                info!(%cid, "unloading inactive overlay");
                self.unload_overlay(&cid);
                unloaded.push(cid);
            }
        }
        unloaded
    }

    /// Expire delayed messages, stale co-sign requests, and dead
    /// candidates.
    pub fn tick_maintenance(&mut self, now: Instant) {
        let stats = &mut self.stats;
        self.delayed_proof.retain(|_, buffer| {
            buffer.retain(|delayed| {
                let keep = delayed.deadline > now;
                if !keep {
                    stats.dropped += 1;
                }
                keep
            });
            !buffer.is_empty()
        });
        self.delayed_sequence.retain(|_, buffer| {
            buffer.retain(|_, delayed| {
                let keep = delayed.deadline > now;
                if !keep {
                    stats.dropped += 1;
                }
                keep
            });
            !buffer.is_empty()
        });
        self.pending_signatures.retain(|_, p| p.deadline > now);
        for overlay in self.overlays.values_mut() {
            overlay.candidates.cleanup(now);
        }
    }

    // ------------------------------------------------------------------
    // inbound pipeline
    // ------------------------------------------------------------------

    /// Entry point for datagrams from the endpoint.
    pub fn on_incoming_packets(&mut self, now: Instant, packets: Vec<(SocketAddr, Vec<u8>)>) {
        let mut decoded = Vec::with_capacity(packets.len());
        for (source, bytes) in packets {
            self.stats.received += 1;
            if let Some(pair) = self.decode_packet(source, &bytes) {
                decoded.push(pair);
            }
        }
        self.process_messages(now, decoded);
    }

    fn decode_packet(&mut self, source: SocketAddr, bytes: &[u8]) -> Option<(Cid, Arc<Message>)> {
        let cid = match peek_cid(bytes) {
            Ok(cid) => cid,
            Err(e) => {
                debug!("{e}");
                self.stats.dropped += 1;
                return None;
            }
        };

        if !self.overlays.contains_key(&cid) {
            match &self.auto_join {
                Some(factory) => {
                    let blueprint = factory(&cid);
                    if let Err(e) = self.join_overlay(cid, blueprint) {
                        warn!(%cid, "auto-join failed: {e}");
                        self.stats.dropped += 1;
                        return None;
                    }
                    info!(%cid, "auto-joined overlay");
                }
                None => {
                    self.stats.dropped += 1;
                    return None;
                }
            }
        }

        let version = match peek_conversion_version(bytes) {
            Ok(version) => version,
            Err(e) => {
                debug!("{e}");
                self.stats.dropped += 1;
                return None;
            }
        };

        let result = {
            let overlay = self.overlays.get(&cid)?;
            let Some(conversion) = overlay.conversion_for(version) else {
                debug!(%cid, version, "unknown conversion version");
                self.stats.dropped += 1;
                return None;
            };
            conversion.decode(overlay.table(), &self.registry, bytes, Some(source))
        };

        match result {
            Ok(message) => Some((cid, Arc::new(message))),
            Err(DecodeError::UnknownMember { mid }) => {
                self.stats.dropped += 1;
                self.request_identity(&cid, mid, source);
                None
            }
            Err(DecodeError::Drop(e)) => {
                debug!(source = %source, "{e}");
                self.stats.dropped += 1;
                None
            }
            Err(DecodeError::Store(e)) => {
                error!("store failure during decode: {e}");
                self.stats.store_failures += 1;
                None
            }
        }
    }

    /// Run decoded messages through check/store/handler in batches: one
    /// batch per (overlay, meta), higher meta priority first, insertion
    /// order within a batch.
    pub fn process_messages(&mut self, now: Instant, messages: Vec<(Cid, Arc<Message>)>) {
        let mut order: Vec<(Cid, MetaId, u8)> = Vec::new();
        let mut groups: HashMap<(Cid, MetaId), Vec<Arc<Message>>> = HashMap::new();
        for (cid, message) in messages {
            let meta_id = message.meta().database_id();
            let key = (cid, meta_id);
            if !groups.contains_key(&key) {
                let priority = message.meta().priority().unwrap_or(128);
                order.push((cid, meta_id, priority));
            }
            groups.entry(key).or_default().push(message);
        }
        order.sort_by(|a, b| b.2.cmp(&a.2));

        for (cid, meta_id, _) in order {
            if let Some(batch) = groups.remove(&(cid, meta_id)) {
                self.process_batch(now, cid, meta_id, batch);
            }
        }
    }

    fn process_batch(&mut self, now: Instant, cid: Cid, meta_id: MetaId, batch: Vec<Arc<Message>>) {
        let Some(mut overlay) = self.overlays.remove(&cid) else {
            self.stats.dropped += batch.len() as u64;
            return;
        };
        let Some(handlers) = overlay.handlers(meta_id).cloned() else {
            self.stats.dropped += batch.len() as u64;
            self.overlays.insert(cid, overlay);
            return;
        };

        let local_addr = self.local_v4();
        let mut admitted: Vec<Arc<Message>> = Vec::new();
        let mut outgoing: Vec<Outgoing> = Vec::new();
        let mut events: Vec<EngineEvent> = Vec::new();
        let mut seen: HashSet<[u8; 32]> = HashSet::new();
        let mut queue: VecDeque<Arc<Message>> = batch.into();

        while let Some(message) = queue.pop_front() {
            let meta = message.meta().clone();

            if overlay.is_hard_killed() && meta.name() != builtin::INTRODUCTION_REQUEST {
                self.stats.dropped += 1;
                continue;
            }
            if !overlay.acceptable_time(message.global_time()) {
                debug!(
                    global_time = message.global_time(),
                    "message beyond the acceptable global time range"
                );
                self.stats.dropped += 1;
                continue;
            }
            if meta.authentication().is_double() && !message.authentication().is_signed() {
                // Half-signed messages travel only inside co-sign requests.
                self.stats.dropped += 1;
                continue;
            }

            let hash = message.packet_hash().unwrap_or_default();
            if !seen.insert(hash) {
                self.stats.duplicates += 1;
                continue;
            }
            let author = message.author().mid();
            if meta.distribution().is_sync() {
                match message.packet().map(|packet| {
                    self.store
                        .contains(&cid, meta_id, &author, message.global_time(), packet)
                }) {
                    Some(Ok(true)) => {
                        self.stats.duplicates += 1;
                        continue;
                    }
                    Some(Ok(false)) | None => {}
                    Some(Err(e)) => {
                        error!("store lookup failed: {e}");
                        self.stats.store_failures += 1;
                        continue;
                    }
                }
            }

            if meta.distribution().enable_sequence_number() {
                let last = match self.store.last_sequence(&cid, &author, meta_id) {
                    Ok(last) => last,
                    Err(e) => {
                        error!("sequence lookup failed: {e}");
                        self.stats.store_failures += 1;
                        continue;
                    }
                };
                let sequence = message.sequence_number();
                if sequence <= last {
                    self.stats.duplicates += 1;
                    continue;
                }
                if sequence > last + 1 {
                    self.delay_by_sequence(now, &overlay, message, last);
                    continue;
                }
            }

            let disposition = {
                let mut scope = HandlerScope {
                    overlay: &mut overlay,
                    store: self.store.as_ref(),
                    registry: self.registry.as_ref(),
                    now,
                    local_addr,
                    outgoing: &mut outgoing,
                    events: &mut events,
                };
                (handlers.check)(&mut scope, &message)
            };
            match disposition {
                Disposition::Admit => {}
                Disposition::DelayByProof => {
                    self.delay_by_proof(now, &overlay, message);
                    continue;
                }
                Disposition::DelayBySequence => {
                    let last = self
                        .store
                        .last_sequence(&cid, &author, meta_id)
                        .unwrap_or(0);
                    self.delay_by_sequence(now, &overlay, message, last);
                    continue;
                }
                Disposition::Drop(reason) => {
                    debug!(meta = meta.name(), "dropping message: {reason}");
                    self.stats.dropped += 1;
                    continue;
                }
            }

            if meta.distribution().is_sync() {
                let Some(packet) = message.packet() else {
                    self.stats.dropped += 1;
                    continue;
                };
                let pair = match message.authentication() {
                    AuthenticationImpl::Double { members, .. } => Some(members[1].mid()),
                    AuthenticationImpl::Single { .. } => None,
                };
                match self.store.insert(
                    &cid,
                    &meta,
                    author,
                    pair,
                    message.global_time(),
                    message.sequence_number(),
                    packet,
                ) {
                    Ok(InsertOutcome::Stored) => {}
                    Ok(InsertOutcome::Duplicate) => {
                        self.stats.duplicates += 1;
                        continue;
                    }
                    Err(e) => {
                        error!("store insert failed: {e}");
                        self.stats.store_failures += 1;
                        continue;
                    }
                }
            }

            overlay.update_global_time(message.global_time());
            self.stats.admitted += 1;

            // A healed gap may free buffered successors.
            if meta.distribution().enable_sequence_number() {
                let key = (cid, author, meta_id);
                if let Some(buffer) = self.delayed_sequence.get_mut(&key) {
                    let mut next = message.sequence_number() + 1;
                    while let Some(delayed) = buffer.remove(&next) {
                        queue.push_back(delayed.message);
                        next += 1;
                    }
                    if buffer.is_empty() {
                        self.delayed_sequence.remove(&key);
                    }
                }
            }

            admitted.push(message);
        }

        if !admitted.is_empty() {
            let mut scope = HandlerScope {
                overlay: &mut overlay,
                store: self.store.as_ref(),
                registry: self.registry.as_ref(),
                now,
                local_addr,
                outgoing: &mut outgoing,
                events: &mut events,
            };
            (handlers.on_accept)(&mut scope, &admitted);
        }

        self.overlays.insert(cid, overlay);

        for out in outgoing {
            self.dispatch_outgoing(now, cid, out);
        }
        self.process_events(now, events);

        let from_wire: Vec<Arc<Message>> = admitted
            .iter()
            .filter(|m| m.source().is_some())
            .cloned()
            .collect();
        self.forward(now, &cid, &from_wire);
    }

    fn process_events(&mut self, now: Instant, events: Vec<EngineEvent>) {
        for event in events {
            match event {
                EngineEvent::SendPackets { to, packets } => {
                    for packet in packets {
                        self.endpoint.send(to, packet);
                    }
                }
                EngineEvent::ReleaseProofDelayed { cid } => {
                    self.release_proof_delayed(now, &cid);
                }
                EngineEvent::HardKill {
                    cid,
                    degree,
                    proof,
                    ..
                } => match degree {
                    DestroyDegree::Hard => {
                        if let Some(overlay) = self.overlays.get_mut(&cid) {
                            overlay.hard_kill(proof);
                        }
                        if let Err(e) = self.store.delete_overlay(&cid) {
                            error!("failed to purge destroyed overlay: {e}");
                            self.stats.store_failures += 1;
                        }
                        info!(%cid, "overlay hard-killed");
                    }
                    DestroyDegree::Soft => {
                        info!(%cid, "overlay soft-destroyed, unloading");
                        self.unload_overlay(&cid);
                    }
                },
                EngineEvent::SignatureResponse {
                    cid,
                    identifier,
                    signature,
                } => {
                    self.complete_signature(now, cid, identifier, signature);
                }
            }
        }
    }

    fn release_proof_delayed(&mut self, now: Instant, cid: &Cid) {
        let keys: Vec<(Cid, Mid, MetaId)> = self
            .delayed_proof
            .keys()
            .filter(|key| key.0 == *cid)
            .copied()
            .collect();
        let mut released = Vec::new();
        for key in keys {
            if let Some(buffer) = self.delayed_proof.remove(&key) {
                for delayed in buffer {
                    if delayed.deadline > now {
                        released.push((delayed.cid, delayed.message));
                    } else {
                        self.stats.dropped += 1;
                    }
                }
            }
        }
        if !released.is_empty() {
            self.process_messages(now, released);
        }
    }

    fn complete_signature(&mut self, now: Instant, cid: Cid, identifier: u16, signature: Vec<u8>) {
        let Some(pending) = self.pending_signatures.remove(&identifier) else {
            debug!(identifier, "no pending co-sign request");
            return;
        };
        if pending.cid != cid || signature.len() != 64 {
            return;
        }
        let mut packet = pending.packet;
        let tail = packet.len() - 64;
        packet[tail..].copy_from_slice(&signature);

        // Re-decode the completed packet; signature verification confirms
        // the countersign before the message is admitted.
        let decoded = {
            let Some(overlay) = self.overlays.get(&cid) else { return };
            let Ok(version) = peek_conversion_version(&packet) else {
                return;
            };
            let Some(conversion) = overlay.conversion_for(version) else {
                return;
            };
            conversion.decode(overlay.table(), &self.registry, &packet, None)
        };
        match decoded {
            Ok(message) => {
                self.process_messages(now, vec![(cid, Arc::new(message))]);
            }
            Err(e) => {
                warn!("countersigned packet failed to decode: {e}");
                self.stats.dropped += 1;
            }
        }
    }

    // ------------------------------------------------------------------
    // delay buffers
    // ------------------------------------------------------------------

    fn delay_by_proof(&mut self, now: Instant, overlay: &Overlay, message: Arc<Message>) {
        let cid = overlay.cid();
        let author = message.author().mid();
        let meta_id = message.meta().database_id();
        let source = message.source();
        let global_time = message.global_time();

        let buffer = self.delayed_proof.entry((cid, author, meta_id)).or_default();
        if buffer.len() >= self.config.max_delayed {
            self.stats.dropped += 1;
            return;
        }
        buffer.push(Delayed {
            cid,
            message,
            deadline: now + self.config.delay_ttl,
        });
        self.stats.delayed += 1;

        if let Some(source) = source {
            self.send_direct_request(
                overlay,
                builtin::MISSING_PROOF,
                Box::new(MissingProofPayload {
                    mid: author,
                    global_time,
                }),
                source,
            );
        }
    }

    fn delay_by_sequence(
        &mut self,
        now: Instant,
        overlay: &Overlay,
        message: Arc<Message>,
        last_admitted: u32,
    ) {
        let cid = overlay.cid();
        let author = message.author().mid();
        let meta_id = message.meta().database_id();
        let meta_tag = message.meta().tag();
        let sequence = message.sequence_number();
        let source = message.source();

        let buffer = self
            .delayed_sequence
            .entry((cid, author, meta_id))
            .or_default();
        if buffer.len() >= self.config.max_delayed {
            self.stats.dropped += 1;
            return;
        }
        buffer.insert(
            sequence,
            Delayed {
                cid,
                message,
                deadline: now + self.config.delay_ttl,
            },
        );
        self.stats.delayed += 1;

        if let Some(source) = source {
            self.send_direct_request(
                overlay,
                builtin::MISSING_SEQUENCE,
                Box::new(MissingSequencePayload {
                    mid: author,
                    meta_tag,
                    low: last_admitted + 1,
                    high: sequence - 1,
                }),
                source,
            );
        }
    }

    fn request_identity(&mut self, cid: &Cid, mid: Mid, source: SocketAddr) {
        let Some(overlay) = self.overlays.get(cid) else { return };
        self.send_direct_request(
            overlay,
            builtin::MISSING_IDENTITY,
            Box::new(MissingIdentityPayload { mid }),
            source,
        );
    }

    /// Compose and immediately send a direct request from `my_member`.
    fn send_direct_request(
        &self,
        overlay: &Overlay,
        name: &str,
        payload: Box<dyn Payload>,
        to: SocketAddr,
    ) {
        let Some(meta) = overlay.table().get(name).cloned() else {
            return;
        };
        let message = Message::new(
            meta,
            AuthenticationImpl::single(overlay.my_member().clone()),
            ResolutionImpl::Public,
            DistributionImpl::new(overlay.global_time()),
            DestinationImpl::Member { targets: vec![] },
            payload,
        );
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!("failed to compose {name}: {e}");
                return;
            }
        };
        let Some(conversion) = overlay.default_conversion() else {
            return;
        };
        match conversion.encode(&message) {
            Ok(packet) => self.endpoint.send(to, packet),
            Err(e) => warn!("failed to encode {name}: {e}"),
        }
    }

    // ------------------------------------------------------------------
    // outbound
    // ------------------------------------------------------------------

    fn dispatch_outgoing(&mut self, now: Instant, cid: Cid, out: Outgoing) {
        {
            let Some(overlay) = self.overlays.get(&cid) else { return };
            let Some(conversion) = overlay.default_conversion() else {
                return;
            };
            if let Err(e) = conversion.encode(&out.message) {
                warn!("failed to encode outgoing message: {e}");
                return;
            }
        }
        let message = Arc::new(out.message);
        if out.store {
            self.store_messages(&cid, std::slice::from_ref(&message));
        }
        match out.to {
            Some(addr) => {
                if let Some(packet) = message.packet() {
                    self.endpoint.send(addr, packet.to_vec());
                }
            }
            None => self.forward(now, &cid, std::slice::from_ref(&message)),
        }
    }

    fn store_messages(&mut self, cid: &Cid, messages: &[Arc<Message>]) {
        for message in messages {
            let meta = message.meta();
            if !meta.distribution().is_sync() {
                continue;
            }
            let Some(packet) = message.packet() else { continue };
            // Locally created messages carry their signatures only in the
            // encoded bytes; an unfilled slot keeps the row out of the
            // store.
            if !is_fully_signed(packet, meta.authentication().signature_count()) {
                continue;
            }
            let pair = match message.authentication() {
                AuthenticationImpl::Double { members, .. } => Some(members[1].mid()),
                AuthenticationImpl::Single { .. } => None,
            };
            match self.store.insert(
                cid,
                meta,
                message.author().mid(),
                pair,
                message.global_time(),
                message.sequence_number(),
                packet,
            ) {
                Ok(_) => {}
                Err(e) => {
                    error!("store insert failed: {e}");
                    self.stats.store_failures += 1;
                }
            }
        }
    }

    /// Forward messages per their destination policy.
    fn forward(&mut self, now: Instant, cid: &Cid, messages: &[Arc<Message>]) {
        let Some(overlay) = self.overlays.get_mut(cid) else {
            return;
        };
        for message in messages {
            let Some(packet) = message.packet() else { continue };
            match message.meta().destination() {
                Destination::Community { node_count } => {
                    let mut exclude = Vec::new();
                    if let Some(source) = message.source() {
                        exclude.push(source);
                    }
                    let targets =
                        overlay
                            .candidates
                            .sample(now, *node_count, &exclude, &mut self.rng);
                    for target in targets {
                        self.endpoint.send(target, packet.to_vec());
                    }
                }
                Destination::Member => {
                    for member in message.destination().targets() {
                        match overlay.candidates.addr_of(&member.mid()) {
                            Some(addr) => self.endpoint.send(addr, packet.to_vec()),
                            None => debug!(member = %member.mid(), "no known address"),
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // message creation
    // ------------------------------------------------------------------

    /// Build a message from `my_member`, claiming global time and (when
    /// enabled) the next sequence number.
    pub fn build_message(
        &mut self,
        cid: &Cid,
        name: &str,
        payload: Box<dyn Payload>,
        targets: Vec<Arc<Member>>,
    ) -> Result<Arc<Message>, EngineError> {
        let overlay = self
            .overlays
            .get_mut(cid)
            .ok_or(EngineError::UnknownOverlay(*cid))?;
        let meta = overlay
            .table()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownMeta(name.to_string()))?;

        let global_time = overlay.claim_global_time();
        let sequence = if meta.distribution().enable_sequence_number() {
            overlay.claim_sequence_number(&meta, &self.store)?
        } else {
            0
        };
        let resolution = match meta.resolution() {
            Resolution::Public => ResolutionImpl::Public,
            Resolution::Linear => ResolutionImpl::Linear,
            Resolution::Dynamic { .. } => {
                let index = overlay
                    .timeline()
                    .dynamic_index_at(meta.database_id(), global_time);
                ResolutionImpl::dynamic(meta.resolution(), index)?
            }
        };
        let destination = match meta.destination() {
            Destination::Community { .. } => DestinationImpl::Community,
            Destination::Member => DestinationImpl::Member { targets },
        };

        let message = Message::new(
            meta,
            AuthenticationImpl::single(overlay.my_member().clone()),
            resolution,
            DistributionImpl::with_sequence(global_time, sequence),
            destination,
            payload,
        )?;
        Ok(Arc::new(message))
    }

    /// Build, store, update, and forward in one call.
    pub fn create_message(
        &mut self,
        cid: &Cid,
        name: &str,
        payload: Box<dyn Payload>,
    ) -> Result<Arc<Message>, EngineError> {
        self.create_message_opts(cid, name, payload, true, true, true)
    }

    pub fn create_message_opts(
        &mut self,
        cid: &Cid,
        name: &str,
        payload: Box<dyn Payload>,
        store: bool,
        update: bool,
        forward: bool,
    ) -> Result<Arc<Message>, EngineError> {
        let message = self.build_message(cid, name, payload, vec![])?;
        self.store_update_forward(
            Instant::now(),
            cid,
            vec![message.clone()],
            store,
            update,
            forward,
        )?;
        Ok(message)
    }

    /// Grant permissions: a convenience wrapper composing an authorize
    /// message.
    pub fn create_authorize(
        &mut self,
        cid: &Cid,
        grants: &[(Arc<Member>, &str, Permission)],
    ) -> Result<Arc<Message>, EngineError> {
        let payload = self.grant_payload(cid, grants)?;
        self.create_message(cid, builtin::AUTHORIZE, Box::new(AuthorizePayload { triplets: payload }))
    }

    fn grant_payload(
        &self,
        cid: &Cid,
        grants: &[(Arc<Member>, &str, Permission)],
    ) -> Result<Vec<PermissionTriplet>, EngineError> {
        let overlay = self
            .overlays
            .get(cid)
            .ok_or(EngineError::UnknownOverlay(*cid))?;
        let mut triplets = Vec::with_capacity(grants.len());
        for (member, name, permission) in grants {
            let meta = overlay
                .table()
                .get(name)
                .ok_or_else(|| EngineError::UnknownMeta(name.to_string()))?;
            let public_key = member.public_key_bytes().ok_or_else(|| {
                PolicyMismatch::new("cannot grant to a member whose key is unknown")
            })?;
            triplets.push(PermissionTriplet {
                public_key: public_key.to_vec(),
                meta_tag: meta.tag(),
                permission: *permission,
            });
        }
        Ok(triplets)
    }

    /// Switch the active resolution variant of dynamic metas.
    pub fn create_dynamic_settings(
        &mut self,
        cid: &Cid,
        switches: &[(&str, u8)],
    ) -> Result<Arc<Message>, EngineError> {
        let resolved = {
            let overlay = self
                .overlays
                .get(cid)
                .ok_or(EngineError::UnknownOverlay(*cid))?;
            let mut resolved = Vec::with_capacity(switches.len());
            for (name, index) in switches {
                let meta = overlay
                    .table()
                    .get(name)
                    .ok_or_else(|| EngineError::UnknownMeta(name.to_string()))?;
                resolved.push((meta.tag(), *index));
            }
            resolved
        };
        self.create_message(
            cid,
            builtin::DYNAMIC_SETTINGS,
            Box::new(DynamicSettingsPayload { switches: resolved }),
        )
    }

    /// Start a double-signed message: sign our half, ask `partner` for the
    /// countersign.  Returns the request identifier; the completed message
    /// is admitted through the normal pipeline when the response arrives.
    pub fn create_double_signed(
        &mut self,
        cid: &Cid,
        name: &str,
        partner: Arc<Member>,
        payload: Box<dyn Payload>,
    ) -> Result<u16, EngineError> {
        let packet = {
            let overlay = self
                .overlays
                .get(cid)
                .ok_or(EngineError::UnknownOverlay(*cid))?;
            let meta = overlay
                .table()
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::UnknownMeta(name.to_string()))?;
            if !matches!(meta.authentication(), Authentication::DoubleMember { .. }) {
                return Err(
                    PolicyMismatch::new("co-signing needs double-member authentication").into(),
                );
            }
            let message = Message::new(
                meta,
                AuthenticationImpl::double(overlay.my_member().clone(), partner.clone()),
                ResolutionImpl::Public,
                DistributionImpl::new(overlay.global_time()),
                DestinationImpl::Member {
                    targets: vec![partner.clone()],
                },
                payload,
            )?;
            let conversion = overlay.default_conversion().ok_or(EngineError::NoConversion)?;
            conversion.encode(&message)?
        };

        let identifier = loop {
            let candidate: u16 = self.rng.gen();
            if !self.pending_signatures.contains_key(&candidate) {
                break candidate;
            }
        };
        self.pending_signatures.insert(
            identifier,
            PendingSignature {
                cid: *cid,
                packet: packet.clone(),
                deadline: Instant::now() + self.config.signature_ttl,
            },
        );

        let request = self.build_message(
            cid,
            builtin::SIGNATURE_REQUEST,
            Box::new(SignatureRequestPayload { identifier, packet }),
            vec![partner],
        )?;
        self.store_update_forward(Instant::now(), cid, vec![request], false, false, true)?;
        Ok(identifier)
    }

    /// Walk towards `destination`: an introduction request asking for a
    /// third peer.  Steps towards bootstrap peers are suppressed.
    pub fn create_introduction_request(
        &mut self,
        cid: &Cid,
        destination: SocketAddr,
    ) -> Result<(), EngineError> {
        let local = self.local_v4();
        let identifier: u16 = self.rng.gen();
        let overlay = self
            .overlays
            .get(cid)
            .ok_or(EngineError::UnknownOverlay(*cid))?;
        if overlay
            .candidates
            .get(&destination)
            .is_some_and(|c| c.is_bootstrap())
        {
            return Ok(());
        }
        let SocketAddr::V4(destination_v4) = destination else {
            return Ok(());
        };
        let payload = builtin::IntroductionRequestPayload {
            destination: destination_v4,
            source_lan: local,
            source_wan: local,
            advice: true,
            identifier,
        };
        self.send_direct_request(
            overlay,
            builtin::INTRODUCTION_REQUEST,
            Box::new(payload),
            destination,
        );
        Ok(())
    }

    /// The `store_update_forward` pipeline for locally created messages.
    pub fn store_update_forward(
        &mut self,
        now: Instant,
        cid: &Cid,
        messages: Vec<Arc<Message>>,
        store: bool,
        update: bool,
        forward: bool,
    ) -> Result<(), EngineError> {
        {
            let overlay = self
                .overlays
                .get(cid)
                .ok_or(EngineError::UnknownOverlay(*cid))?;
            let conversion = overlay.default_conversion().ok_or(EngineError::NoConversion)?;
            for message in &messages {
                conversion.encode(message)?;
            }
        }

        if store {
            self.store_messages(cid, &messages);
        }

        if update {
            // Invoke accept handlers per meta, in batch order.
            let mut order: Vec<MetaId> = Vec::new();
            let mut groups: HashMap<MetaId, Vec<Arc<Message>>> = HashMap::new();
            for message in &messages {
                let meta_id = message.meta().database_id();
                if !groups.contains_key(&meta_id) {
                    order.push(meta_id);
                }
                groups.entry(meta_id).or_default().push(message.clone());
            }
            for meta_id in order {
                let Some(group) = groups.remove(&meta_id) else { continue };
                let Some(mut overlay) = self.overlays.remove(cid) else { break };
                let handlers = overlay.handlers(meta_id).cloned();
                let mut outgoing = Vec::new();
                let mut events = Vec::new();
                if let Some(handlers) = handlers {
                    let mut scope = HandlerScope {
                        overlay: &mut overlay,
                        store: self.store.as_ref(),
                        registry: self.registry.as_ref(),
                        now,
                        local_addr: self.local_v4(),
                        outgoing: &mut outgoing,
                        events: &mut events,
                    };
                    (handlers.on_accept)(&mut scope, &group);
                }
                self.overlays.insert(*cid, overlay);
                for out in outgoing {
                    self.dispatch_outgoing(now, *cid, out);
                }
                self.process_events(now, events);
            }
        }

        if forward {
            self.forward(now, cid, &messages);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // sync selection
    // ------------------------------------------------------------------

    /// Answer a peer's bloom-filter sync request with stored packets.
    pub fn select_sync_response(&mut self, cid: &Cid, selection: &SyncSelection) -> Vec<Vec<u8>> {
        let Some(overlay) = self.overlays.get(cid) else {
            return Vec::new();
        };
        if overlay.is_hard_killed() || !overlay.sync_enabled() {
            return Vec::new();
        }
        let descriptors: Vec<SyncMetaDescriptor> = overlay
            .table()
            .iter()
            .filter_map(|meta| {
                let distribution = meta.distribution();
                let priority = distribution.priority()?;
                if priority < MIN_SYNC_PRIORITY {
                    return None;
                }
                Some(SyncMetaDescriptor {
                    meta_id: meta.database_id(),
                    priority,
                    direction: distribution
                        .direction()
                        .unwrap_or(overmesh_core::Direction::Ascending),
                    pruning: distribution.pruning(),
                })
            })
            .collect();
        let overlay_time = overlay.global_time();
        let rng: &mut dyn RngCore = &mut self.rng;
        match self
            .store
            .select_sync(cid, &descriptors, overlay_time, selection, rng)
        {
            Ok(packets) => packets,
            Err(e) => {
                error!("sync selection failed: {e}");
                self.stats.store_failures += 1;
                Vec::new()
            }
        }
    }
}
