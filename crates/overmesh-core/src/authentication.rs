//! Authentication policy: who signed a message and how the signer is bound
//! on the wire.

use std::fmt;
use std::sync::Arc;

use ed25519_dalek::Signature;

use crate::member::Member;
use crate::message::Message;

/// How the signer is identified in the packet: the 20-byte MID digest or the
/// full public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyEncoding {
    /// 20-byte SHA-1 digest of the public key.  Compact, but the receiver
    /// must already know the key.
    Sha1,
    /// Length-prefixed full public key.  Self-contained; used by identity
    /// announcements to teach keys to strangers.
    Bin,
}

/// Callback consulted when a co-sign request arrives for a double-member
/// meta.  Returning true triggers an automatic countersign.
pub type AllowSignatureFn = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Authentication meta: per-type configuration.
#[derive(Clone)]
pub enum Authentication {
    /// One signer.
    Member { encoding: KeyEncoding },
    /// An ordered pair of signers; both signatures must be present before
    /// the message may be stored or forwarded.
    DoubleMember {
        encoding: KeyEncoding,
        allow_signature: AllowSignatureFn,
    },
}

impl Authentication {
    pub fn member(encoding: KeyEncoding) -> Self {
        Authentication::Member { encoding }
    }

    pub fn double_member(encoding: KeyEncoding, allow_signature: AllowSignatureFn) -> Self {
        Authentication::DoubleMember {
            encoding,
            allow_signature,
        }
    }

    pub fn encoding(&self) -> KeyEncoding {
        match self {
            Authentication::Member { encoding } => *encoding,
            Authentication::DoubleMember { encoding, .. } => *encoding,
        }
    }

    pub fn is_double(&self) -> bool {
        matches!(self, Authentication::DoubleMember { .. })
    }

    /// Number of signature slots at the packet tail.
    pub fn signature_count(&self) -> usize {
        if self.is_double() {
            2
        } else {
            1
        }
    }

    pub fn allow_signature(&self) -> Option<&AllowSignatureFn> {
        match self {
            Authentication::Member { .. } => None,
            Authentication::DoubleMember {
                allow_signature, ..
            } => Some(allow_signature),
        }
    }
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authentication::Member { encoding } => f
                .debug_struct("Member")
                .field("encoding", encoding)
                .finish(),
            Authentication::DoubleMember { encoding, .. } => f
                .debug_struct("DoubleMember")
                .field("encoding", encoding)
                .finish(),
        }
    }
}

/// Per-message authentication state.
#[derive(Clone)]
pub enum AuthenticationImpl {
    Single {
        member: Arc<Member>,
        signature: Option<Signature>,
    },
    Double {
        /// Signer binding order as encoded on the wire.
        members: [Arc<Member>; 2],
        signatures: [Option<Signature>; 2],
    },
}

impl AuthenticationImpl {
    pub fn single(member: Arc<Member>) -> Self {
        AuthenticationImpl::Single {
            member,
            signature: None,
        }
    }

    pub fn double(first: Arc<Member>, second: Arc<Member>) -> Self {
        AuthenticationImpl::Double {
            members: [first, second],
            signatures: [None, None],
        }
    }

    /// The message author: the sole signer, or the first of the pair.
    pub fn member(&self) -> &Arc<Member> {
        match self {
            AuthenticationImpl::Single { member, .. } => member,
            AuthenticationImpl::Double { members, .. } => &members[0],
        }
    }

    pub fn members(&self) -> Vec<&Arc<Member>> {
        match self {
            AuthenticationImpl::Single { member, .. } => vec![member],
            AuthenticationImpl::Double { members, .. } => members.iter().collect(),
        }
    }

    /// A message is signed once every slot carries a signature.  Unsigned
    /// double-member messages may travel only inside signature requests.
    pub fn is_signed(&self) -> bool {
        match self {
            AuthenticationImpl::Single { signature, .. } => signature.is_some(),
            AuthenticationImpl::Double { signatures, .. } => {
                signatures.iter().all(|s| s.is_some())
            }
        }
    }

    pub fn set_signature(&mut self, slot: usize, signature: Signature) {
        match self {
            AuthenticationImpl::Single { signature: s, .. } => {
                debug_assert_eq!(slot, 0);
                *s = Some(signature);
            }
            AuthenticationImpl::Double { signatures, .. } => signatures[slot] = Some(signature),
        }
    }
}

impl fmt::Debug for AuthenticationImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthenticationImpl::Single { member, signature } => f
                .debug_struct("Single")
                .field("member", &member.mid())
                .field("signed", &signature.is_some())
                .finish(),
            AuthenticationImpl::Double {
                members,
                signatures,
            } => f
                .debug_struct("Double")
                .field("members", &[members[0].mid(), members[1].mid()])
                .field(
                    "signed",
                    &[signatures[0].is_some(), signatures[1].is_some()],
                )
                .finish(),
        }
    }
}
