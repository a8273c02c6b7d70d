//! Candidate bookkeeping: the peers an overlay knows about, categorized by
//! how recently and in which direction contact happened.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use overmesh_core::member::Mid;
use rand::seq::SliceRandom;
use rand::Rng;

/// A peer stays in the walk category this long after we initiated contact.
pub const WALK_LIFETIME: Duration = Duration::from_millis(57_500);
/// A peer stays in the stumble category this long after it contacted us.
pub const STUMBLE_LIFETIME: Duration = Duration::from_millis(57_500);
/// A peer stays in the intro category this long after being introduced.
pub const INTRO_LIFETIME: Duration = Duration::from_millis(27_500);
/// Candidates untouched for this long are forgotten entirely.
const OBSOLETE_AFTER: Duration = Duration::from_secs(180);

/// Interaction category, refreshed by traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    /// We initiated contact within [`WALK_LIFETIME`].
    Walk,
    /// The peer initiated contact within [`STUMBLE_LIFETIME`].
    Stumble,
    /// A third party introduced the peer within [`INTRO_LIFETIME`].
    Intro,
    None,
}

/// Special candidate subtypes excluded from certain policies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandidateKind {
    Normal,
    /// Known a priori; excluded from forwarding and tracker walks.
    Bootstrap,
    /// The local endpoint itself.
    Loopback,
}

/// One known peer address.
#[derive(Clone, Debug)]
pub struct Candidate {
    addr: SocketAddr,
    kind: CandidateKind,
    last_walk: Option<Instant>,
    last_stumble: Option<Instant>,
    last_intro: Option<Instant>,
    mid: Option<Mid>,
}

impl Candidate {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            kind: CandidateKind::Normal,
            last_walk: None,
            last_stumble: None,
            last_intro: None,
            mid: None,
        }
    }

    pub fn bootstrap(addr: SocketAddr) -> Self {
        Self {
            kind: CandidateKind::Bootstrap,
            ..Self::new(addr)
        }
    }

    pub fn loopback(addr: SocketAddr) -> Self {
        Self {
            kind: CandidateKind::Loopback,
            ..Self::new(addr)
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn kind(&self) -> CandidateKind {
        self.kind
    }

    pub fn is_bootstrap(&self) -> bool {
        self.kind == CandidateKind::Bootstrap
    }

    pub fn is_loopback(&self) -> bool {
        self.kind == CandidateKind::Loopback
    }

    /// The member last seen using this address, learned from authentication
    /// bindings.
    pub fn mid(&self) -> Option<Mid> {
        self.mid
    }

    pub fn associate(&mut self, mid: Mid) {
        self.mid = Some(mid);
    }

    /// We sent a walk (introduction request) to this peer and got a reply.
    pub fn mark_walk(&mut self, now: Instant) {
        self.last_walk = Some(now);
    }

    /// The peer contacted us.
    pub fn mark_stumble(&mut self, now: Instant) {
        self.last_stumble = Some(now);
    }

    /// The peer was introduced to us.
    pub fn mark_intro(&mut self, now: Instant) {
        self.last_intro = Some(now);
    }

    fn within(stamp: Option<Instant>, now: Instant, lifetime: Duration) -> bool {
        stamp.is_some_and(|t| now.saturating_duration_since(t) < lifetime)
    }

    /// The current category; walk outranks stumble outranks intro.
    pub fn category(&self, now: Instant) -> Category {
        if Self::within(self.last_walk, now, WALK_LIFETIME) {
            Category::Walk
        } else if Self::within(self.last_stumble, now, STUMBLE_LIFETIME) {
            Category::Stumble
        } else if Self::within(self.last_intro, now, INTRO_LIFETIME) {
            Category::Intro
        } else {
            Category::None
        }
    }

    /// Live within its category's lifetime.
    pub fn is_active(&self, now: Instant) -> bool {
        self.category(now) != Category::None
    }

    fn last_seen(&self) -> Option<Instant> {
        [self.last_walk, self.last_stumble, self.last_intro]
            .into_iter()
            .flatten()
            .max()
    }
}

/// All candidates of one overlay, keyed by socket address.
#[derive(Default)]
pub struct CandidateTable {
    candidates: HashMap<SocketAddr, Candidate>,
    /// Insertion order, for the round-robin introduction iterator.
    order: Vec<SocketAddr>,
    rr_position: usize,
    last_introduced: Option<SocketAddr>,
}

impl CandidateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&Candidate> {
        self.candidates.get(addr)
    }

    pub fn get_or_insert(&mut self, addr: SocketAddr) -> &mut Candidate {
        if !self.candidates.contains_key(&addr) {
            self.order.push(addr);
        }
        self.candidates
            .entry(addr)
            .or_insert_with(|| Candidate::new(addr))
    }

    pub fn insert_bootstrap(&mut self, addr: SocketAddr) {
        if !self.candidates.contains_key(&addr) {
            self.order.push(addr);
        }
        self.candidates
            .entry(addr)
            .or_insert_with(|| Candidate::bootstrap(addr));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.values()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Any candidate currently in a live category.
    pub fn has_active(&self, now: Instant) -> bool {
        self.candidates.values().any(|c| c.is_active(now))
    }

    pub fn active_count(&self, now: Instant) -> usize {
        self.candidates.values().filter(|c| c.is_active(now)).count()
    }

    /// Last known address of a member, for member-destination routing.
    pub fn addr_of(&self, mid: &Mid) -> Option<SocketAddr> {
        self.candidates
            .values()
            .filter(|c| c.mid() == Some(*mid))
            .max_by_key(|c| c.last_seen())
            .map(|c| c.addr())
    }

    /// Sample up to `count` active candidates for community fan-out,
    /// excluding bootstrap and loopback peers and the listed addresses.
    pub fn sample<R: Rng>(
        &self,
        now: Instant,
        count: usize,
        exclude: &[SocketAddr],
        rng: &mut R,
    ) -> Vec<SocketAddr> {
        let mut eligible: Vec<SocketAddr> = self
            .candidates
            .values()
            .filter(|c| {
                c.kind() == CandidateKind::Normal
                    && c.is_active(now)
                    && !exclude.contains(&c.addr())
            })
            .map(|c| c.addr())
            .collect();
        eligible.shuffle(rng);
        eligible.truncate(count);
        eligible
    }

    /// Round-robin over walk/stumble candidates for introductions.  Yields
    /// `None` between repeats of the same candidate, signalling the caller
    /// to advertise itself instead.
    pub fn next_introduction(
        &mut self,
        now: Instant,
        exclude: Option<SocketAddr>,
    ) -> Option<SocketAddr> {
        let eligible: Vec<SocketAddr> = self
            .order
            .iter()
            .filter(|addr| {
                Some(**addr) != exclude
                    && self.candidates.get(addr).is_some_and(|c| {
                        c.kind() == CandidateKind::Normal
                            && matches!(c.category(now), Category::Walk | Category::Stumble)
                    })
            })
            .copied()
            .collect();
        if eligible.is_empty() {
            self.last_introduced = None;
            return None;
        }

        let pick = eligible[self.rr_position % eligible.len()];
        self.rr_position = self.rr_position.wrapping_add(1);
        if self.last_introduced == Some(pick) {
            self.last_introduced = None;
            None
        } else {
            self.last_introduced = Some(pick);
            Some(pick)
        }
    }

    /// Forget candidates that have been silent past the obsolete window.
    pub fn cleanup(&mut self, now: Instant) {
        let dead: Vec<SocketAddr> = self
            .candidates
            .values()
            .filter(|c| {
                c.kind() == CandidateKind::Normal
                    && match c.last_seen() {
                        Some(seen) => now.saturating_duration_since(seen) >= OBSOLETE_AFTER,
                        None => true,
                    }
            })
            .map(|c| c.addr())
            .collect();
        for addr in dead {
            self.candidates.remove(&addr);
            self.order.retain(|a| *a != addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{n}:6421").parse().unwrap()
    }

    #[test]
    fn test_category_lifetimes() {
        let now = Instant::now();
        let mut candidate = Candidate::new(addr(1));
        assert_eq!(candidate.category(now), Category::None);

        candidate.mark_intro(now);
        assert_eq!(candidate.category(now), Category::Intro);
        assert_eq!(
            candidate.category(now + INTRO_LIFETIME),
            Category::None
        );

        candidate.mark_stumble(now);
        assert_eq!(candidate.category(now), Category::Stumble);

        // Walk outranks stumble.
        candidate.mark_walk(now);
        assert_eq!(candidate.category(now), Category::Walk);
        assert!(!candidate.is_active(now + WALK_LIFETIME));
    }

    #[test]
    fn test_sample_excludes_bootstrap_and_sender() {
        let now = Instant::now();
        let mut table = CandidateTable::new();
        table.get_or_insert(addr(1)).mark_stumble(now);
        table.get_or_insert(addr(2)).mark_stumble(now);
        table.insert_bootstrap(addr(3));
        if let Some(c) = table.candidates.get_mut(&addr(3)) {
            c.mark_stumble(now);
        }

        let mut rng = rand::thread_rng();
        let sample = table.sample(now, 10, &[addr(1)], &mut rng);
        assert_eq!(sample, vec![addr(2)]);
    }

    #[test]
    fn test_round_robin_yields_none_between_repeats() {
        let now = Instant::now();
        let mut table = CandidateTable::new();
        table.get_or_insert(addr(1)).mark_stumble(now);

        // A single candidate alternates with None.
        assert_eq!(table.next_introduction(now, None), Some(addr(1)));
        assert_eq!(table.next_introduction(now, None), None);
        assert_eq!(table.next_introduction(now, None), Some(addr(1)));

        table.get_or_insert(addr(2)).mark_walk(now);
        let picks: Vec<_> = (0..4).map(|_| table.next_introduction(now, None)).collect();
        assert!(picks.contains(&Some(addr(2))));
    }

    #[test]
    fn test_addr_of_prefers_latest() {
        let now = Instant::now();
        let mid = Mid([9; 20]);
        let mut table = CandidateTable::new();
        let old = table.get_or_insert(addr(1));
        old.mark_stumble(now);
        old.associate(mid);
        let newer = table.get_or_insert(addr(2));
        newer.mark_stumble(now + Duration::from_secs(1));
        newer.associate(mid);

        assert_eq!(table.addr_of(&mid), Some(addr(2)));
    }

    #[test]
    fn test_cleanup_forgets_silent_peers() {
        let now = Instant::now();
        let mut table = CandidateTable::new();
        table.get_or_insert(addr(1)).mark_stumble(now);
        table.insert_bootstrap(addr(2));

        table.cleanup(now + OBSOLETE_AFTER);
        assert!(table.get(&addr(1)).is_none());
        // Bootstrap candidates are permanent.
        assert!(table.get(&addr(2)).is_some());
    }
}
