//! Member identity and the member registry.
//!
//! A member is identified by its Ed25519 public key; the 20-byte member id
//! (MID) is the SHA-1 digest of the key bytes.  Members observed only by MID
//! exist as dummies until an identity packet supplies the key.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH};
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::error::StoreError;

/// 20-byte member identifier: SHA-1 of the public key bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mid(pub [u8; 20]);

impl Mid {
    pub fn from_public_key(key_bytes: &[u8]) -> Self {
        let digest = Sha1::digest(key_bytes);
        let mut mid = [0u8; 20];
        mid.copy_from_slice(&digest);
        Mid(mid)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for Mid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mid({})", hex::encode(self.0))
    }
}

impl fmt::Display for Mid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// 20-byte overlay identifier: the MID of the overlay's master member.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid(pub [u8; 20]);

impl Cid {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn as_mid(&self) -> Mid {
        Mid(self.0)
    }
}

impl From<Mid> for Cid {
    fn from(mid: Mid) -> Self {
        Cid(mid.0)
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", hex::encode(self.0))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Requested key strength for `new_random`.  All strengths currently map to
/// Ed25519; the parameter is kept so callers can express intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyStrength {
    VeryLow,
    Low,
    Medium,
    High,
}

/// Member errors.
#[derive(Debug, Error)]
pub enum MemberError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("member {0} has no private key")]
    NoPrivateKey(Mid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Member({})", hex::encode(&self.mid.0[..8]))
    }
}

/// A participant, never mutated after creation except for key promotion.
pub struct Member {
    database_id: u64,
    mid: Mid,
    public_key: RwLock<Option<VerifyingKey>>,
    private_key: Option<SigningKey>,
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("database_id", &self.database_id)
            .field("mid", &self.mid)
            .field("dummy", &self.is_dummy())
            .field("has_private_key", &self.private_key.is_some())
            .finish()
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.mid == other.mid
    }
}

impl Eq for Member {}

impl Member {
    fn from_key(database_id: u64, key: VerifyingKey, private_key: Option<SigningKey>) -> Self {
        Self {
            database_id,
            mid: Mid::from_public_key(key.as_bytes()),
            public_key: RwLock::new(Some(key)),
            private_key,
        }
    }

    /// Placeholder for a member whose key has not been observed yet.
    fn dummy(mid: Mid) -> Self {
        Self {
            database_id: 0,
            mid,
            public_key: RwLock::new(None),
            private_key: None,
        }
    }

    pub fn database_id(&self) -> u64 {
        self.database_id
    }

    pub fn mid(&self) -> Mid {
        self.mid
    }

    /// True while the public key is unknown.
    pub fn is_dummy(&self) -> bool {
        self.public_key.read().is_none()
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    pub fn public_key(&self) -> Option<VerifyingKey> {
        *self.public_key.read()
    }

    pub fn public_key_bytes(&self) -> Option<[u8; PUBLIC_KEY_LENGTH]> {
        self.public_key.read().map(|key| *key.as_bytes())
    }

    /// Sign `body` with the private key.
    pub fn sign(&self, body: &[u8]) -> Result<Signature, MemberError> {
        match &self.private_key {
            Some(key) => Ok(key.sign(body)),
            None => Err(MemberError::NoPrivateKey(self.mid)),
        }
    }

    /// Verify `signature` over `body` against the public key.  A dummy member
    /// verifies nothing.
    pub fn verify(&self, body: &[u8], signature: &Signature) -> bool {
        match *self.public_key.read() {
            Some(key) => key.verify(body, signature).is_ok(),
            None => false,
        }
    }
}

/// Persistence seam for member rows.  The engine backs this with its row
/// store; tests use [`MemoryMemberStore`].
pub trait MemberStore: Send + Sync {
    /// Persist `(id, public_key)`.  Must fail loudly, never drop silently.
    fn persist_member(&self, id: u64, mid: &Mid, public_key: &[u8]) -> Result<(), StoreError>;

    /// Load all previously persisted `(id, public_key)` rows.
    fn load_members(&self) -> Result<Vec<(u64, Vec<u8>)>, StoreError>;
}

/// In-memory member store for tests and short-lived deployments.
#[derive(Default)]
pub struct MemoryMemberStore {
    rows: RwLock<Vec<(u64, Vec<u8>)>>,
}

impl MemberStore for MemoryMemberStore {
    fn persist_member(&self, id: u64, _mid: &Mid, public_key: &[u8]) -> Result<(), StoreError> {
        self.rows.write().push((id, public_key.to_vec()));
        Ok(())
    }

    fn load_members(&self) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        Ok(self.rows.read().clone())
    }
}

struct RegistryInner {
    by_mid: HashMap<Mid, Arc<Member>>,
    next_id: u64,
}

/// Registry of all members known to the engine, keyed by MID.
pub struct MemberRegistry {
    store: Arc<dyn MemberStore>,
    inner: RwLock<RegistryInner>,
}

impl MemberRegistry {
    /// Create a registry, loading previously persisted members.
    pub fn new(store: Arc<dyn MemberStore>) -> Result<Self, MemberError> {
        let mut by_mid = HashMap::new();
        let mut next_id = 1;
        for (id, key_bytes) in store.load_members()? {
            let key = parse_public_key(&key_bytes)?;
            let member = Arc::new(Member::from_key(id, key, None));
            next_id = next_id.max(id + 1);
            by_mid.insert(member.mid(), member);
        }
        Ok(Self {
            store,
            inner: RwLock::new(RegistryInner { by_mid, next_id }),
        })
    }

    /// Idempotent lookup-or-create by public key.  Promotes an existing dummy
    /// in place when the key arrives.
    pub fn get_or_create(&self, public_key: &[u8]) -> Result<Arc<Member>, MemberError> {
        let key = parse_public_key(public_key)?;
        let mid = Mid::from_public_key(public_key);

        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_mid.get(&mid).cloned() {
            if existing.is_dummy() {
                *existing.public_key.write() = Some(key);
                let id = inner.next_id;
                inner.next_id += 1;
                self.store.persist_member(id, &mid, public_key)?;
            }
            return Ok(existing);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        self.store.persist_member(id, &mid, public_key)?;
        let member = Arc::new(Member::from_key(id, key, None));
        inner.by_mid.insert(mid, member.clone());
        Ok(member)
    }

    /// Lookup by MID, yielding a dummy placeholder for unknown members.
    pub fn get_by_mid(&self, mid: &Mid) -> Arc<Member> {
        let mut inner = self.inner.write();
        inner
            .by_mid
            .entry(*mid)
            .or_insert_with(|| Arc::new(Member::dummy(*mid)))
            .clone()
    }

    /// Lookup by MID without creating a placeholder.
    pub fn find_by_mid(&self, mid: &Mid) -> Option<Arc<Member>> {
        self.inner.read().by_mid.get(mid).cloned()
    }

    /// Generate a member with a fresh private key.
    pub fn new_random(&self, _strength: KeyStrength) -> Result<Arc<Member>, MemberError> {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        let key = signing.verifying_key();
        let mid = Mid::from_public_key(key.as_bytes());

        let mut inner = self.inner.write();
        let id = inner.next_id;
        inner.next_id += 1;
        self.store.persist_member(id, &mid, key.as_bytes())?;
        let member = Arc::new(Member::from_key(id, key, Some(signing)));
        inner.by_mid.insert(mid, member.clone());
        Ok(member)
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_mid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_mid.is_empty()
    }
}

fn parse_public_key(bytes: &[u8]) -> Result<VerifyingKey, MemberError> {
    let array: [u8; PUBLIC_KEY_LENGTH] = bytes
        .try_into()
        .map_err(|_| MemberError::InvalidPublicKey(format!("{} byte key", bytes.len())))?;
    VerifyingKey::from_bytes(&array)
        .map_err(|e| MemberError::InvalidPublicKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MemberRegistry {
        MemberRegistry::new(Arc::new(MemoryMemberStore::default())).unwrap()
    }

    #[test]
    fn test_mid_is_sha1_of_key() {
        let reg = registry();
        let member = reg.new_random(KeyStrength::Medium).unwrap();
        let expected = Mid::from_public_key(&member.public_key_bytes().unwrap());
        assert_eq!(member.mid(), expected);
    }

    #[test]
    fn test_get_or_create_idempotent() {
        let reg = registry();
        let member = reg.new_random(KeyStrength::Low).unwrap();
        let key = member.public_key_bytes().unwrap();

        let again = reg.get_or_create(&key).unwrap();
        assert_eq!(again.database_id(), member.database_id());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_dummy_promotion() {
        let reg = registry();
        let other = MemberRegistry::new(Arc::new(MemoryMemberStore::default())).unwrap();
        let member = other.new_random(KeyStrength::Medium).unwrap();
        let key = member.public_key_bytes().unwrap();

        let dummy = reg.get_by_mid(&member.mid());
        assert!(dummy.is_dummy());

        let promoted = reg.get_or_create(&key).unwrap();
        assert!(!promoted.is_dummy());
        // Promotion happens in place: the original handle sees the key.
        assert!(!dummy.is_dummy());
        assert_eq!(dummy.public_key_bytes(), Some(key));
    }

    #[test]
    fn test_sign_verify() {
        let reg = registry();
        let member = reg.new_random(KeyStrength::High).unwrap();
        let signature = member.sign(b"body").unwrap();
        assert!(member.verify(b"body", &signature));
        assert!(!member.verify(b"other", &signature));
    }

    #[test]
    fn test_registry_reload() {
        let store = Arc::new(MemoryMemberStore::default());
        let mid;
        {
            let reg = MemberRegistry::new(store.clone()).unwrap();
            mid = reg.new_random(KeyStrength::Medium).unwrap().mid();
        }
        let reloaded = MemberRegistry::new(store).unwrap();
        let member = reloaded.find_by_mid(&mid).expect("persisted member");
        assert!(!member.is_dummy());
    }

    #[test]
    fn test_invalid_key_rejected() {
        let reg = registry();
        assert!(reg.get_or_create(&[1, 2, 3]).is_err());
    }
}
