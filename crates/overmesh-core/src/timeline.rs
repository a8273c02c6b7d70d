//! Permission timeline: an append-only log of grants and revocations over
//! logical time, consulted to admit or delay messages.

use std::collections::HashMap;

use crate::member::Mid;
use crate::message::Message;
use crate::meta::{MetaId, MetaMessage};
use crate::resolution::{Resolution, ResolutionVariant};

/// Permission kinds tracked per (member, meta).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Permission {
    /// May create the message.
    Permit,
    /// May grant permissions on the message to others.
    Authorize,
    /// May revoke permissions on the message from others.
    Revoke,
    /// May undo previously accepted messages.
    Undo,
}

impl Permission {
    pub fn database_value(self) -> u8 {
        match self {
            Permission::Permit => 0,
            Permission::Authorize => 1,
            Permission::Revoke => 2,
            Permission::Undo => 3,
        }
    }

    pub fn from_database_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(Permission::Permit),
            1 => Some(Permission::Authorize),
            2 => Some(Permission::Revoke),
            3 => Some(Permission::Undo),
            _ => None,
        }
    }
}

/// One grant or revocation, ordered by (global_time, proof packet bytes).
#[derive(Clone, Debug)]
struct PolicyEvent {
    global_time: u64,
    /// True for authorize, false for revoke.
    granted: bool,
    /// Packet bytes of the message that caused this event; doubles as the
    /// tie-breaker and as the proof returned to peers.
    proof: Vec<u8>,
}

/// One dynamic-resolution switch.
#[derive(Clone, Debug)]
struct DynamicEvent {
    global_time: u64,
    index: u8,
    proof: Vec<u8>,
}

/// The decision for one checked message.
#[derive(Debug)]
pub struct CheckResult {
    pub allowed: bool,
    /// Proof packets backing the decision, so a peer can request missing
    /// links.
    pub proofs: Vec<Vec<u8>>,
}

impl CheckResult {
    fn allowed_with(proofs: Vec<Vec<u8>>) -> Self {
        Self {
            allowed: true,
            proofs,
        }
    }

    fn denied() -> Self {
        Self {
            allowed: false,
            proofs: Vec::new(),
        }
    }
}

/// Per-overlay permission state machine over logical time.
pub struct Timeline {
    master_mid: Mid,
    events: HashMap<(Mid, MetaId, Permission), Vec<PolicyEvent>>,
    dynamic: HashMap<MetaId, Vec<DynamicEvent>>,
}

impl Timeline {
    /// The master member is self-authorizing: its messages always pass.
    pub fn new(master_mid: Mid) -> Self {
        Self {
            master_mid,
            events: HashMap::new(),
            dynamic: HashMap::new(),
        }
    }

    pub fn master_mid(&self) -> Mid {
        self.master_mid
    }

    /// Decide whether `message` was permitted at its own global time.
    pub fn check(&self, message: &Message) -> CheckResult {
        let author = message.author().mid();
        let meta = message.meta();
        let global_time = message.global_time();

        if author == self.master_mid {
            return CheckResult::allowed_with(Vec::new());
        }

        let variant = match meta.resolution() {
            Resolution::Public => ResolutionVariant::Public,
            Resolution::Linear => ResolutionVariant::Linear,
            Resolution::Dynamic { .. } => {
                // The timeline, not the message, decides which variant is in
                // force at this global time; a message claiming another
                // variant is not admissible.
                let active = self.dynamic_index_at(meta.database_id(), global_time);
                match message.resolution().index() {
                    Some(index) if index == active => message.resolution().variant(),
                    _ => return CheckResult::denied(),
                }
            }
        };

        match variant {
            ResolutionVariant::Public => CheckResult::allowed_with(Vec::new()),
            ResolutionVariant::Linear => {
                self.check_permission(author, meta.database_id(), Permission::Permit, global_time)
            }
        }
    }

    /// Decide whether `member` currently holds `permission` for `meta`.
    pub fn allowed(&self, member: Mid, meta: &MetaMessage, permission: Permission) -> CheckResult {
        if member == self.master_mid {
            return CheckResult::allowed_with(Vec::new());
        }
        match meta.resolution() {
            Resolution::Public if permission == Permission::Permit => {
                CheckResult::allowed_with(Vec::new())
            }
            _ => self.check_permission(member, meta.database_id(), permission, u64::MAX),
        }
    }

    fn check_permission(
        &self,
        member: Mid,
        meta: MetaId,
        permission: Permission,
        global_time: u64,
    ) -> CheckResult {
        let Some(events) = self.events.get(&(member, meta, permission)) else {
            return CheckResult::denied();
        };
        // Events are kept sorted by (global_time, proof); the last event at
        // or before the message's time governs.
        match events.iter().rev().find(|e| e.global_time <= global_time) {
            Some(event) if event.granted => CheckResult::allowed_with(vec![event.proof.clone()]),
            _ => CheckResult::denied(),
        }
    }

    /// Whether `granter` may hand out grants for `meta` at `global_time`.
    pub fn may_authorize(&self, granter: Mid, meta: MetaId, global_time: u64) -> bool {
        granter == self.master_mid
            || self
                .check_permission(granter, meta, Permission::Authorize, global_time)
                .allowed
    }

    /// Whether `granter` may revoke grants for `meta` at `global_time`.
    pub fn may_revoke(&self, granter: Mid, meta: MetaId, global_time: u64) -> bool {
        granter == self.master_mid
            || self
                .check_permission(granter, meta, Permission::Revoke, global_time)
                .allowed
    }

    /// Append grants for the listed `(member, meta, permission)` triplets at
    /// `global_time`, proven by `proof` (the authorize packet).
    pub fn authorize(
        &mut self,
        triplets: &[(Mid, MetaId, Permission)],
        global_time: u64,
        proof: &[u8],
    ) {
        for (member, meta, permission) in triplets {
            self.push_event(
                (*member, *meta, *permission),
                PolicyEvent {
                    global_time,
                    granted: true,
                    proof: proof.to_vec(),
                },
            );
        }
    }

    /// Append revocations, the mirror of [`Timeline::authorize`].
    pub fn revoke(
        &mut self,
        triplets: &[(Mid, MetaId, Permission)],
        global_time: u64,
        proof: &[u8],
    ) {
        for (member, meta, permission) in triplets {
            self.push_event(
                (*member, *meta, *permission),
                PolicyEvent {
                    global_time,
                    granted: false,
                    proof: proof.to_vec(),
                },
            );
        }
    }

    fn push_event(&mut self, key: (Mid, MetaId, Permission), event: PolicyEvent) {
        let events = self.events.entry(key).or_default();
        let position = events
            .binary_search_by(|e| {
                e.global_time
                    .cmp(&event.global_time)
                    .then_with(|| e.proof.cmp(&event.proof))
            })
            .unwrap_or_else(|p| p);
        events.insert(position, event);
    }

    /// Record a dynamic-resolution switch for `meta` at `global_time`.
    pub fn apply_dynamic_settings(
        &mut self,
        switches: &[(MetaId, u8)],
        global_time: u64,
        proof: &[u8],
    ) {
        for (meta, index) in switches {
            let events = self.dynamic.entry(*meta).or_default();
            let event = DynamicEvent {
                global_time,
                index: *index,
                proof: proof.to_vec(),
            };
            let position = events
                .binary_search_by(|e| {
                    e.global_time
                        .cmp(&event.global_time)
                        .then_with(|| e.proof.cmp(&event.proof))
                })
                .unwrap_or_else(|p| p);
            events.insert(position, event);
        }
    }

    /// The dynamic-resolution variant index in force for `meta` at
    /// `global_time`: the last switch at or before that time, defaulting to
    /// the first variant.
    pub fn dynamic_index_at(&self, meta: MetaId, global_time: u64) -> u8 {
        self.dynamic
            .get(&meta)
            .and_then(|events| events.iter().rev().find(|e| e.global_time <= global_time))
            .map(|e| e.index)
            .unwrap_or(0)
    }

    /// Proof packets backing `member`'s permit on `meta` at `global_time`;
    /// served in answer to missing-proof requests.
    pub fn proofs_for(&self, member: Mid, meta: MetaId, global_time: u64) -> Vec<Vec<u8>> {
        self.check_permission(member, meta, Permission::Permit, global_time)
            .proofs
    }
}
