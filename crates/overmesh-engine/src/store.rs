//! Persistent sync store over sled.
//!
//! One row per stored packet, indexed two ways: by
//! `(community, meta, global_time)` for sync selection and by
//! `(community, member, meta, global_time)` for retention and lookups.
//! Double-signed rows are additionally indexed by the unordered member pair.

use overmesh_core::distribution::{Direction, Distribution, PruneState, Pruning};
use overmesh_core::error::StoreError;
use overmesh_core::member::{Cid, MemberStore, Mid};
use overmesh_core::meta::{MetaId, MetaMessage};
use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sled::Tree;
use thiserror::Error;

use crate::bloom::BloomFilter;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        StoreError::new(e.to_string())
    }
}

/// Outcome of a store insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored,
    /// Already present (or sequence already admitted); handlers must not run
    /// again.
    Duplicate,
}

#[derive(Debug, Serialize, Deserialize)]
struct MemberRow {
    id: u64,
    public_key: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetaRow {
    id: MetaId,
    priority: u8,
    direction: i8,
}

#[derive(Debug, Serialize, Deserialize)]
struct SyncRow {
    mid: [u8; 20],
    pair_mid: Option<[u8; 20]>,
    sequence: u32,
    packet: Vec<u8>,
}

/// Meta descriptor handed to sync selection.
#[derive(Debug, Clone, Copy)]
pub struct SyncMetaDescriptor {
    pub meta_id: MetaId,
    pub priority: u8,
    pub direction: Direction,
    pub pruning: Pruning,
}

/// A peer's sync request, as seen by the selector.  The bloom filter covers
/// the packets the peer already holds within the time range.
pub struct SyncSelection {
    pub time_low: u64,
    /// Zero means open-ended.
    pub time_high: u64,
    pub bloom: BloomFilter,
    /// When non-empty, only packets by these authors are eligible.
    pub members: Vec<Mid>,
    pub byte_budget: usize,
}

/// Sled-backed sync store; one instance shared by all overlays.
pub struct SyncStore {
    db: sled::Db,
    members: Tree,
    metas: Tree,
    sync: Tree,
    sync_member: Tree,
    sync_pair: Tree,
    sequences: Tree,
    metadata: Tree,
}

impl SyncStore {
    /// Open a persistent store at `path`.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// Open an in-memory store (tracker deployment).
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            members: db.open_tree("member")?,
            metas: db.open_tree("meta_message")?,
            sync: db.open_tree("sync")?,
            sync_member: db.open_tree("sync_member")?,
            sync_pair: db.open_tree("sync_pair")?,
            sequences: db.open_tree("sequence")?,
            metadata: db.open_tree("metadata")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // meta message rows
    // ------------------------------------------------------------------

    /// Register a meta message, returning its stable id.  The stored
    /// `(priority, direction)` row is only rewritten when the registered
    /// policy changed since the last load.
    pub fn register_meta(
        &self,
        cid: &Cid,
        name: &str,
        priority: u8,
        direction: i8,
    ) -> Result<MetaId, StorageError> {
        let mut key = Vec::with_capacity(20 + name.len());
        key.extend_from_slice(cid.as_bytes());
        key.extend_from_slice(name.as_bytes());

        if let Some(bytes) = self.metas.get(&key)? {
            let row: MetaRow = postcard::from_bytes(&bytes)?;
            if row.priority != priority || row.direction != direction {
                let updated = MetaRow {
                    id: row.id,
                    priority,
                    direction,
                };
                self.metas.insert(&key, postcard::to_allocvec(&updated)?)?;
            }
            return Ok(row.id);
        }

        let mut seq_key = b"meta_seq:".to_vec();
        seq_key.extend_from_slice(cid.as_bytes());
        let next = match self.metadata.get(&seq_key)? {
            Some(bytes) => {
                let mut buf = [0u8; 2];
                buf.copy_from_slice(&bytes);
                u16::from_be_bytes(buf) + 1
            }
            None => 1,
        };
        self.metadata.insert(&seq_key, &next.to_be_bytes())?;
        let row = MetaRow {
            id: next,
            priority,
            direction,
        };
        self.metas.insert(&key, postcard::to_allocvec(&row)?)?;
        Ok(next)
    }

    // ------------------------------------------------------------------
    // sync rows
    // ------------------------------------------------------------------

    /// Insert one packet under its meta's retention policy.
    pub fn insert(
        &self,
        cid: &Cid,
        meta: &MetaMessage,
        mid: Mid,
        pair_mid: Option<Mid>,
        global_time: u64,
        sequence: u32,
        packet: &[u8],
    ) -> Result<InsertOutcome, StorageError> {
        let hash = packet_hash(packet);
        let member_key = member_key(cid, &mid, meta.database_id(), global_time, &hash);
        if self.sync_member.contains_key(&member_key)? {
            return Ok(InsertOutcome::Duplicate);
        }

        if meta.distribution().enable_sequence_number() {
            let last = self.last_sequence(cid, &mid, meta.database_id())?;
            if sequence <= last {
                return Ok(InsertOutcome::Duplicate);
            }
            let seq_key = sequence_key(cid, &mid, meta.database_id());
            self.sequences.insert(seq_key, &sequence.to_be_bytes())?;
        }

        let row = SyncRow {
            mid: mid.0,
            pair_mid: pair_mid.map(|m| m.0),
            sequence,
            packet: packet.to_vec(),
        };
        let sync_key = sync_key(cid, meta.database_id(), global_time, &hash);
        let empty: &[u8] = &[];
        self.sync.insert(&sync_key, postcard::to_allocvec(&row)?)?;
        self.sync_member.insert(&member_key, empty)?;
        if let Some(pair) = pair_mid {
            let key = pair_key(cid, &mid, &pair, meta.database_id(), global_time, &hash);
            self.sync_pair.insert(&key, empty)?;
        }

        if let Distribution::LastSync { history_size, .. } = meta.distribution() {
            self.enforce_history(cid, meta.database_id(), &mid, pair_mid, *history_size)?;
        }

        Ok(InsertOutcome::Stored)
    }

    /// Trim rows beyond the history bound for one (member, meta) or
    /// (member pair, meta).  Rows are ranked by global time descending; on
    /// equal global time the lexicographically smaller packet survives.
    fn enforce_history(
        &self,
        cid: &Cid,
        meta_id: MetaId,
        mid: &Mid,
        pair_mid: Option<Mid>,
        history_size: u32,
    ) -> Result<(), StorageError> {
        let prefix = match pair_mid {
            Some(pair) => {
                let (lo, hi) = ordered_pair(mid, &pair);
                let mut prefix = Vec::with_capacity(62);
                prefix.extend_from_slice(cid.as_bytes());
                prefix.extend_from_slice(&lo.0);
                prefix.extend_from_slice(&hi.0);
                prefix.extend_from_slice(&meta_id.to_be_bytes());
                prefix
            }
            None => {
                let mut prefix = Vec::with_capacity(42);
                prefix.extend_from_slice(cid.as_bytes());
                prefix.extend_from_slice(&mid.0);
                prefix.extend_from_slice(&meta_id.to_be_bytes());
                prefix
            }
        };
        let index = if pair_mid.is_some() {
            &self.sync_pair
        } else {
            &self.sync_member
        };

        let mut rows: Vec<(u64, Vec<u8>, Vec<u8>)> = Vec::new();
        for item in index.scan_prefix(&prefix) {
            let (key, _) = item?;
            let (global_time, hash) = split_tail(&key)?;
            let sync_key = sync_key(cid, meta_id, global_time, &hash);
            let row = self.load_row(&sync_key)?;
            rows.push((global_time, row.packet, key.to_vec()));
        }
        if rows.len() <= history_size as usize {
            return Ok(());
        }

        rows.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        for (global_time, packet, index_key) in rows.into_iter().skip(history_size as usize) {
            let hash = packet_hash(&packet);
            self.remove_row(cid, meta_id, global_time, &hash)?;
            index.remove(index_key)?;
        }
        Ok(())
    }

    fn load_row(&self, sync_key: &[u8]) -> Result<SyncRow, StorageError> {
        let bytes = self
            .sync
            .get(sync_key)?
            .ok_or_else(|| StorageError::Corrupt("index points at a missing sync row".into()))?;
        Ok(postcard::from_bytes(&bytes)?)
    }

    /// Remove one row and all its index entries.
    fn remove_row(
        &self,
        cid: &Cid,
        meta_id: MetaId,
        global_time: u64,
        hash: &[u8; 8],
    ) -> Result<(), StorageError> {
        let sync_key = sync_key(cid, meta_id, global_time, hash);
        if let Some(bytes) = self.sync.remove(&sync_key)? {
            let row: SyncRow = postcard::from_bytes(&bytes)?;
            let mid = Mid(row.mid);
            self.sync_member
                .remove(member_key(cid, &mid, meta_id, global_time, hash))?;
            if let Some(pair) = row.pair_mid {
                let key = pair_key(cid, &mid, &Mid(pair), meta_id, global_time, hash);
                self.sync_pair.remove(key)?;
            }
        }
        Ok(())
    }

    /// Whether this exact packet is already stored.
    pub fn contains(
        &self,
        cid: &Cid,
        meta_id: MetaId,
        mid: &Mid,
        global_time: u64,
        packet: &[u8],
    ) -> Result<bool, StorageError> {
        let hash = packet_hash(packet);
        Ok(self
            .sync_member
            .contains_key(member_key(cid, mid, meta_id, global_time, &hash))?)
    }

    /// Highest admitted sequence number for `(member, meta)`.
    pub fn last_sequence(&self, cid: &Cid, mid: &Mid, meta_id: MetaId) -> Result<u32, StorageError> {
        match self.sequences.get(sequence_key(cid, mid, meta_id))? {
            Some(bytes) => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&bytes);
                Ok(u32::from_be_bytes(buf))
            }
            None => Ok(0),
        }
    }

    /// Stored packets for `(member, meta)` with sequence numbers in
    /// `[low, high]`, ordered by sequence.
    pub fn packets_for_sequence(
        &self,
        cid: &Cid,
        mid: &Mid,
        meta_id: MetaId,
        low: u32,
        high: u32,
    ) -> Result<Vec<Vec<u8>>, StorageError> {
        let mut found: Vec<(u32, Vec<u8>)> = Vec::new();
        for item in self.sync_member.scan_prefix(member_prefix(cid, mid, meta_id)) {
            let (key, _) = item?;
            let (global_time, hash) = split_tail(&key)?;
            let row = self.load_row(&sync_key(cid, meta_id, global_time, &hash))?;
            if row.sequence >= low && row.sequence <= high {
                found.push((row.sequence, row.packet));
            }
        }
        found.sort_by_key(|(sequence, _)| *sequence);
        Ok(found.into_iter().map(|(_, packet)| packet).collect())
    }

    /// All stored packets authored by `member` at exactly `global_time`.
    pub fn packets_by_member_at(
        &self,
        cid: &Cid,
        mid: &Mid,
        global_time: u64,
    ) -> Result<Vec<(MetaId, Vec<u8>)>, StorageError> {
        let mut prefix = Vec::with_capacity(40);
        prefix.extend_from_slice(cid.as_bytes());
        prefix.extend_from_slice(&mid.0);

        let mut found = Vec::new();
        for item in self.sync_member.scan_prefix(&prefix) {
            let (key, _) = item?;
            let meta_id = {
                let mut buf = [0u8; 2];
                buf.copy_from_slice(&key[40..42]);
                u16::from_be_bytes(buf)
            };
            let (row_time, hash) = split_tail(&key)?;
            if row_time == global_time {
                let row = self.load_row(&sync_key(cid, meta_id, row_time, &hash))?;
                found.push((meta_id, row.packet));
            }
        }
        Ok(found)
    }

    /// Most recent stored packets for `(member, meta)`, newest first.
    pub fn latest_packets(
        &self,
        cid: &Cid,
        mid: &Mid,
        meta_id: MetaId,
        limit: usize,
    ) -> Result<Vec<Vec<u8>>, StorageError> {
        let mut packets = Vec::new();
        for item in self
            .sync_member
            .scan_prefix(member_prefix(cid, mid, meta_id))
            .rev()
        {
            if packets.len() >= limit {
                break;
            }
            let (key, _) = item?;
            let (global_time, hash) = split_tail(&key)?;
            packets.push(self.load_row(&sync_key(cid, meta_id, global_time, &hash))?.packet);
        }
        Ok(packets)
    }

    pub fn count(&self, cid: &Cid, meta_id: MetaId) -> Result<usize, StorageError> {
        let mut prefix = Vec::with_capacity(22);
        prefix.extend_from_slice(cid.as_bytes());
        prefix.extend_from_slice(&meta_id.to_be_bytes());
        let mut count = 0;
        for item in self.sync.scan_prefix(&prefix) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    pub fn count_member(
        &self,
        cid: &Cid,
        mid: &Mid,
        meta_id: MetaId,
    ) -> Result<usize, StorageError> {
        let mut count = 0;
        for item in self.sync_member.scan_prefix(member_prefix(cid, mid, meta_id)) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Drop every row belonging to `cid`.
    pub fn delete_overlay(&self, cid: &Cid) -> Result<(), StorageError> {
        for tree in [&self.sync, &self.sync_member, &self.sync_pair, &self.sequences] {
            let keys: Vec<Vec<u8>> = tree
                .scan_prefix(cid.as_bytes())
                .map(|item| item.map(|(key, _)| key.to_vec()))
                .collect::<Result<_, _>>()?;
            for key in keys {
                tree.remove(key)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // sync selection
    // ------------------------------------------------------------------

    /// Select packets answering a peer's sync request.
    ///
    /// Rows are visited meta by meta in priority order (highest first), each
    /// meta's rows ordered by global time per its direction.  Pruned rows
    /// are deleted on the way.  Selection stops at the byte budget.
    pub fn select_sync(
        &self,
        cid: &Cid,
        metas: &[SyncMetaDescriptor],
        overlay_time: u64,
        selection: &SyncSelection,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Vec<u8>>, StorageError> {
        let mut metas: Vec<SyncMetaDescriptor> = metas.to_vec();
        metas.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.meta_id.cmp(&b.meta_id)));

        let time_high = if selection.time_high == 0 {
            u64::MAX
        } else {
            selection.time_high
        };

        let mut packets: Vec<Vec<u8>> = Vec::new();
        let mut budget = selection.byte_budget;
        'metas: for descriptor in metas {
            let mut rows: Vec<(u64, Vec<u8>)> = Vec::new();
            for item in self.sync.scan_prefix(meta_prefix(cid, descriptor.meta_id)) {
                let (key, value) = item?;
                let (global_time, hash) = split_tail(&key)?;
                let row: SyncRow = postcard::from_bytes(&value)?;

                if descriptor.pruning.state(global_time, overlay_time) == PruneState::Pruned {
                    self.remove_row(cid, descriptor.meta_id, global_time, &hash)?;
                    continue;
                }
                if global_time < selection.time_low || global_time > time_high {
                    continue;
                }
                if !selection.members.is_empty() && !selection.members.contains(&Mid(row.mid)) {
                    continue;
                }
                if selection.bloom.contains(&row.packet) {
                    continue;
                }
                rows.push((global_time, row.packet));
            }

            match descriptor.direction {
                Direction::Ascending => rows.sort_by_key(|(t, _)| *t),
                Direction::Descending => {
                    rows.sort_by_key(|(t, _)| *t);
                    rows.reverse();
                }
                Direction::Random => rows.shuffle(rng),
            }

            for (_, packet) in rows {
                if packet.len() > budget {
                    break 'metas;
                }
                budget -= packet.len();
                packets.push(packet);
            }
        }
        Ok(packets)
    }
}

impl MemberStore for SyncStore {
    fn persist_member(&self, id: u64, mid: &Mid, public_key: &[u8]) -> Result<(), StoreError> {
        let row = MemberRow {
            id,
            public_key: public_key.to_vec(),
        };
        let bytes = postcard::to_allocvec(&row).map_err(StorageError::from)?;
        self.members
            .insert(mid.as_bytes(), bytes)
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn load_members(&self) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let mut rows = Vec::new();
        for item in self.members.iter() {
            let (_, value) = item.map_err(StorageError::from)?;
            let row: MemberRow = postcard::from_bytes(&value).map_err(StorageError::from)?;
            rows.push((row.id, row.public_key));
        }
        Ok(rows)
    }
}

// ----------------------------------------------------------------------
// key layout helpers
// ----------------------------------------------------------------------

fn packet_hash(packet: &[u8]) -> [u8; 8] {
    let digest = blake3::hash(packet);
    let mut hash = [0u8; 8];
    hash.copy_from_slice(&digest.as_bytes()[..8]);
    hash
}

fn sync_key(cid: &Cid, meta_id: MetaId, global_time: u64, hash: &[u8; 8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(38);
    key.extend_from_slice(cid.as_bytes());
    key.extend_from_slice(&meta_id.to_be_bytes());
    key.extend_from_slice(&global_time.to_be_bytes());
    key.extend_from_slice(hash);
    key
}

fn meta_prefix(cid: &Cid, meta_id: MetaId) -> Vec<u8> {
    let mut key = Vec::with_capacity(22);
    key.extend_from_slice(cid.as_bytes());
    key.extend_from_slice(&meta_id.to_be_bytes());
    key
}

fn member_key(cid: &Cid, mid: &Mid, meta_id: MetaId, global_time: u64, hash: &[u8; 8]) -> Vec<u8> {
    let mut key = member_prefix(cid, mid, meta_id);
    key.extend_from_slice(&global_time.to_be_bytes());
    key.extend_from_slice(hash);
    key
}

fn member_prefix(cid: &Cid, mid: &Mid, meta_id: MetaId) -> Vec<u8> {
    let mut key = Vec::with_capacity(58);
    key.extend_from_slice(cid.as_bytes());
    key.extend_from_slice(&mid.0);
    key.extend_from_slice(&meta_id.to_be_bytes());
    key
}

fn ordered_pair(a: &Mid, b: &Mid) -> (Mid, Mid) {
    if a.0 <= b.0 {
        (*a, *b)
    } else {
        (*b, *a)
    }
}

fn pair_key(
    cid: &Cid,
    a: &Mid,
    b: &Mid,
    meta_id: MetaId,
    global_time: u64,
    hash: &[u8; 8],
) -> Vec<u8> {
    let (lo, hi) = ordered_pair(a, b);
    let mut key = Vec::with_capacity(78);
    key.extend_from_slice(cid.as_bytes());
    key.extend_from_slice(&lo.0);
    key.extend_from_slice(&hi.0);
    key.extend_from_slice(&meta_id.to_be_bytes());
    key.extend_from_slice(&global_time.to_be_bytes());
    key.extend_from_slice(hash);
    key
}

fn sequence_key(cid: &Cid, mid: &Mid, meta_id: MetaId) -> Vec<u8> {
    member_prefix(cid, mid, meta_id)
}

/// Split the trailing `global_time (8) || hash (8)` off an index key.
fn split_tail(key: &[u8]) -> Result<(u64, [u8; 8]), StorageError> {
    if key.len() < 16 {
        return Err(StorageError::Corrupt("index key too short".into()));
    }
    let tail = &key[key.len() - 16..];
    let mut time_buf = [0u8; 8];
    time_buf.copy_from_slice(&tail[..8]);
    let mut hash = [0u8; 8];
    hash.copy_from_slice(&tail[8..]);
    Ok((u64::from_be_bytes(time_buf), hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use overmesh_core::authentication::{Authentication, KeyEncoding};
    use overmesh_core::destination::Destination;
    use overmesh_core::payload::TextPayloadCodec;
    use overmesh_core::resolution::Resolution;

    fn store() -> SyncStore {
        SyncStore::temporary().unwrap()
    }

    fn last_sync_meta(id: MetaId, history: u32) -> MetaMessage {
        MetaMessage::new(
            format!("last-{history}-test"),
            id as u8,
            id,
            Authentication::member(KeyEncoding::Sha1),
            Resolution::Public,
            Distribution::last_sync(Direction::Ascending, 128, history).unwrap(),
            Destination::Community { node_count: 10 },
            Box::new(TextPayloadCodec),
        )
        .unwrap()
    }

    fn full_sync_meta(id: MetaId, priority: u8, sequence: bool) -> MetaMessage {
        MetaMessage::new(
            format!("full-sync-{id}"),
            id as u8,
            id,
            Authentication::member(KeyEncoding::Sha1),
            Resolution::Public,
            Distribution::full_sync(Direction::Ascending, priority, sequence),
            Destination::Community { node_count: 10 },
            Box::new(TextPayloadCodec),
        )
        .unwrap()
    }

    fn selection(budget: usize) -> SyncSelection {
        SyncSelection {
            time_low: 1,
            time_high: 0,
            bloom: BloomFilter::new(1024, 4),
            members: Vec::new(),
            byte_budget: budget,
        }
    }

    #[test]
    fn test_meta_registration_is_stable() {
        let store = store();
        let cid = Cid([1; 20]);
        let first = store.register_meta(&cid, "text", 128, 1).unwrap();
        let again = store.register_meta(&cid, "text", 128, 1).unwrap();
        assert_eq!(first, again);
        let other = store.register_meta(&cid, "other", 128, 1).unwrap();
        assert_ne!(first, other);
        // Changed policy rewrites the row but keeps the id.
        let rewritten = store.register_meta(&cid, "text", 200, -1).unwrap();
        assert_eq!(first, rewritten);
    }

    #[test]
    fn test_last_sync_retention_keeps_highest_global_time() {
        let store = store();
        let cid = Cid([1; 20]);
        let meta = last_sync_meta(1, 1);
        let author = Mid([2; 20]);

        for (global_time, packet) in [(5u64, b"at-5".as_slice()), (3, b"at-3"), (7, b"at-7")] {
            let outcome = store
                .insert(&cid, &meta, author, None, global_time, 0, packet)
                .unwrap();
            assert_eq!(outcome, InsertOutcome::Stored);
        }

        assert_eq!(store.count_member(&cid, &author, 1).unwrap(), 1);
        let packets = store.latest_packets(&cid, &author, 1, 10).unwrap();
        assert_eq!(packets, vec![b"at-7".to_vec()]);
    }

    #[test]
    fn test_last_sync_tie_break_keeps_smaller_packet() {
        let store = store();
        let cid = Cid([1; 20]);
        let meta = last_sync_meta(1, 1);
        let author = Mid([2; 20]);

        store.insert(&cid, &meta, author, None, 5, 0, b"zz").unwrap();
        store.insert(&cid, &meta, author, None, 5, 0, b"aa").unwrap();
        let packets = store.latest_packets(&cid, &author, 1, 10).unwrap();
        assert_eq!(packets, vec![b"aa".to_vec()]);
    }

    #[test]
    fn test_last_sync_double_member_keyed_by_unordered_pair() {
        let store = store();
        let cid = Cid([1; 20]);
        let meta = last_sync_meta(1, 1);
        let a = Mid([2; 20]);
        let b = Mid([3; 20]);

        // Same unordered pair, either binding order: one survivor.
        store.insert(&cid, &meta, a, Some(b), 5, 0, b"first").unwrap();
        store.insert(&cid, &meta, b, Some(a), 9, 0, b"second").unwrap();
        let total = store.count_member(&cid, &a, 1).unwrap() + store.count_member(&cid, &b, 1).unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_duplicate_insert() {
        let store = store();
        let cid = Cid([1; 20]);
        let meta = full_sync_meta(1, 128, false);
        let author = Mid([2; 20]);

        assert_eq!(
            store.insert(&cid, &meta, author, None, 5, 0, b"pkt").unwrap(),
            InsertOutcome::Stored
        );
        assert_eq!(
            store.insert(&cid, &meta, author, None, 5, 0, b"pkt").unwrap(),
            InsertOutcome::Duplicate
        );
        assert!(store.contains(&cid, 1, &author, 5, b"pkt").unwrap());
    }

    #[test]
    fn test_sequence_tracking() {
        let store = store();
        let cid = Cid([1; 20]);
        let meta = full_sync_meta(1, 128, true);
        let author = Mid([2; 20]);

        assert_eq!(store.last_sequence(&cid, &author, 1).unwrap(), 0);
        store.insert(&cid, &meta, author, None, 5, 1, b"s1").unwrap();
        store.insert(&cid, &meta, author, None, 6, 2, b"s2").unwrap();
        assert_eq!(store.last_sequence(&cid, &author, 1).unwrap(), 2);
        // Replay of an admitted sequence is a duplicate.
        assert_eq!(
            store.insert(&cid, &meta, author, None, 7, 2, b"s2'").unwrap(),
            InsertOutcome::Duplicate
        );

        let packets = store.packets_for_sequence(&cid, &author, 1, 1, 2).unwrap();
        assert_eq!(packets, vec![b"s1".to_vec(), b"s2".to_vec()]);
    }

    #[test]
    fn test_select_sync_priority_and_direction() {
        let store = store();
        let cid = Cid([1; 20]);
        let low = full_sync_meta(1, 100, false);
        let high = full_sync_meta(2, 200, false);
        let author = Mid([2; 20]);

        store.insert(&cid, &low, author, None, 1, 0, b"low-1").unwrap();
        store.insert(&cid, &low, author, None, 2, 0, b"low-2").unwrap();
        store.insert(&cid, &high, author, None, 1, 0, b"high-1").unwrap();
        store.insert(&cid, &high, author, None, 2, 0, b"high-2").unwrap();

        let metas = [
            SyncMetaDescriptor {
                meta_id: 1,
                priority: 100,
                direction: Direction::Descending,
                pruning: Pruning::None,
            },
            SyncMetaDescriptor {
                meta_id: 2,
                priority: 200,
                direction: Direction::Ascending,
                pruning: Pruning::None,
            },
        ];
        let packets = store
            .select_sync(&cid, &metas, 10, &selection(1024), &mut rand::thread_rng())
            .unwrap();
        assert_eq!(
            packets,
            vec![
                b"high-1".to_vec(),
                b"high-2".to_vec(),
                b"low-2".to_vec(),
                b"low-1".to_vec(),
            ]
        );
    }

    #[test]
    fn test_select_sync_respects_bloom_and_budget() {
        let store = store();
        let cid = Cid([1; 20]);
        let meta = full_sync_meta(1, 128, false);
        let author = Mid([2; 20]);

        store.insert(&cid, &meta, author, None, 1, 0, b"aaaa").unwrap();
        store.insert(&cid, &meta, author, None, 2, 0, b"bbbb").unwrap();
        store.insert(&cid, &meta, author, None, 3, 0, b"cccc").unwrap();

        let descriptor = SyncMetaDescriptor {
            meta_id: 1,
            priority: 128,
            direction: Direction::Ascending,
            pruning: Pruning::None,
        };

        // The peer already has the first packet.
        let mut request = selection(1024);
        request.bloom.insert(b"aaaa");
        let packets = store
            .select_sync(&cid, &[descriptor], 10, &request, &mut rand::thread_rng())
            .unwrap();
        assert_eq!(packets, vec![b"bbbb".to_vec(), b"cccc".to_vec()]);

        // The byte budget cuts the response short.
        let packets = store
            .select_sync(&cid, &[descriptor], 10, &selection(9), &mut rand::thread_rng())
            .unwrap();
        assert_eq!(packets, vec![b"aaaa".to_vec(), b"bbbb".to_vec()]);
    }

    #[test]
    fn test_select_sync_member_filter() {
        let store = store();
        let cid = Cid([1; 20]);
        let meta = full_sync_meta(1, 128, false);
        let a = Mid([2; 20]);
        let b = Mid([3; 20]);

        store.insert(&cid, &meta, a, None, 1, 0, b"from-a").unwrap();
        store.insert(&cid, &meta, b, None, 2, 0, b"from-b").unwrap();

        let descriptor = SyncMetaDescriptor {
            meta_id: 1,
            priority: 128,
            direction: Direction::Ascending,
            pruning: Pruning::None,
        };
        let mut request = selection(1024);
        request.members = vec![a];
        let packets = store
            .select_sync(&cid, &[descriptor], 10, &request, &mut rand::thread_rng())
            .unwrap();
        assert_eq!(packets, vec![b"from-a".to_vec()]);
    }

    #[test]
    fn test_select_sync_deletes_pruned_rows() {
        let store = store();
        let cid = Cid([1; 20]);
        let pruning = Pruning::global_time(10, 20).unwrap();
        let meta = MetaMessage::new(
            "pruned-text",
            1,
            1,
            Authentication::member(KeyEncoding::Sha1),
            Resolution::Public,
            Distribution::full_sync(Direction::Ascending, 128, false)
                .with_pruning(pruning)
                .unwrap(),
            Destination::Community { node_count: 10 },
            Box::new(TextPayloadCodec),
        )
        .unwrap();
        let author = Mid([2; 20]);

        store.insert(&cid, &meta, author, None, 5, 0, b"old").unwrap();
        store.insert(&cid, &meta, author, None, 95, 0, b"fresh").unwrap();

        let descriptor = SyncMetaDescriptor {
            meta_id: 1,
            priority: 128,
            direction: Direction::Ascending,
            pruning,
        };
        // Overlay clock at 100: the row at 5 is pruned and disappears.
        let packets = store
            .select_sync(&cid, &[descriptor], 100, &selection(1024), &mut rand::thread_rng())
            .unwrap();
        assert_eq!(packets, vec![b"fresh".to_vec()]);
        assert_eq!(store.count(&cid, 1).unwrap(), 1);
    }

    #[test]
    fn test_member_store_roundtrip() {
        let store = store();
        let mid = Mid([9; 20]);
        store.persist_member(3, &mid, &[1, 2, 3]).unwrap();
        let rows = store.load_members().unwrap();
        assert_eq!(rows, vec![(3, vec![1, 2, 3])]);
    }

    #[test]
    fn test_delete_overlay() {
        let store = store();
        let cid = Cid([1; 20]);
        let other = Cid([9; 20]);
        let meta = full_sync_meta(1, 128, false);
        let author = Mid([2; 20]);

        store.insert(&cid, &meta, author, None, 1, 0, b"mine").unwrap();
        store.insert(&other, &meta, author, None, 1, 0, b"theirs").unwrap();
        store.delete_overlay(&cid).unwrap();
        assert_eq!(store.count(&cid, 1).unwrap(), 0);
        assert_eq!(store.count(&other, 1).unwrap(), 1);
    }
}
