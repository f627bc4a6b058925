//! Members: long-lived Ed25519 identities.
//!
//! A member is a public key plus, for identities owned by this process, the
//! matching private key. Externally a member is referred to by its [`Mid`].
//! Members are cheap to clone and compare equal when their public keys do.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dispersy_types::{Mid, SIGNATURE_LEN};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroizing;

/// Length of an encoded public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Member key errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemberError {
    /// The public key bytes are not a valid Ed25519 point.
    #[error("invalid public key ({0} bytes)")]
    InvalidPublicKey(usize),

    /// The private key bytes have the wrong length.
    #[error("invalid private key ({0} bytes)")]
    InvalidPrivateKey(usize),

    /// Signing requires a private key this member does not have.
    #[error("member {0} has no private key")]
    NoPrivateKey(Mid),
}

struct MemberInner {
    public_key: [u8; PUBLIC_KEY_LEN],
    verifying: VerifyingKey,
    mid: Mid,
    signing: Option<SigningKey>,
}

/// An identity in the network.
#[derive(Clone)]
pub struct Member(Arc<MemberInner>);

impl Member {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing)
    }

    /// A member known only by its public key.
    pub fn from_public_key(public_key: &[u8]) -> Result<Self, MemberError> {
        let bytes: [u8; PUBLIC_KEY_LEN] = public_key
            .try_into()
            .map_err(|_| MemberError::InvalidPublicKey(public_key.len()))?;
        let verifying = VerifyingKey::from_bytes(&bytes)
            .map_err(|_| MemberError::InvalidPublicKey(public_key.len()))?;
        Ok(Self(Arc::new(MemberInner {
            public_key: bytes,
            verifying,
            mid: Mid::from_public_key(&bytes),
            signing: None,
        })))
    }

    /// A member owned by this process, restored from its private key.
    pub fn from_private_key(private_key: &[u8]) -> Result<Self, MemberError> {
        let bytes: Zeroizing<[u8; 32]> = Zeroizing::new(
            private_key
                .try_into()
                .map_err(|_| MemberError::InvalidPrivateKey(private_key.len()))?,
        );
        Ok(Self::from_signing_key(SigningKey::from_bytes(&bytes)))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let verifying = signing.verifying_key();
        let public_key = verifying.to_bytes();
        Self(Arc::new(MemberInner {
            public_key,
            verifying,
            mid: Mid::from_public_key(&public_key),
            signing: Some(signing),
        }))
    }

    /// The 20-byte digest of the public key.
    pub fn mid(&self) -> Mid {
        self.0.mid
    }

    /// The encoded public key.
    pub fn public_key(&self) -> &[u8] {
        &self.0.public_key
    }

    /// Whether this process can sign as this member.
    pub fn has_private_key(&self) -> bool {
        self.0.signing.is_some()
    }

    /// The private key bytes, for persisting an owned identity.
    pub fn private_key(&self) -> Option<Zeroizing<Vec<u8>>> {
        self.0
            .signing
            .as_ref()
            .map(|key| Zeroizing::new(key.to_bytes().to_vec()))
    }

    /// A copy of this member without the private key.
    pub fn public_only(&self) -> Member {
        Self(Arc::new(MemberInner {
            public_key: self.0.public_key,
            verifying: self.0.verifying,
            mid: self.0.mid,
            signing: None,
        }))
    }

    /// Sign `data`.
    pub fn sign(&self, data: &[u8]) -> Result<[u8; SIGNATURE_LEN], MemberError> {
        let key = self
            .0
            .signing
            .as_ref()
            .ok_or(MemberError::NoPrivateKey(self.0.mid))?;
        Ok(key.sign(data).to_bytes())
    }

    /// Check a signature made by this member over `data`.
    pub fn verify(&self, data: &[u8], signature: &[u8; SIGNATURE_LEN]) -> bool {
        let signature = Signature::from_bytes(signature);
        self.0.verifying.verify(data, &signature).is_ok()
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.0.public_key == other.0.public_key
    }
}

impl Eq for Member {}

impl Hash for Member {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.public_key.hash(state);
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("mid", &self.0.mid)
            .field("private", &self.has_private_key())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_member_signs_and_verifies() {
        let member = Member::generate();
        let signature = member.sign(b"payload").unwrap();
        assert!(member.verify(b"payload", &signature));
        assert!(!member.verify(b"other payload", &signature));
    }

    #[test]
    fn public_only_member_cannot_sign() {
        let member = Member::generate().public_only();
        assert!(!member.has_private_key());
        assert_eq!(
            member.sign(b"x").unwrap_err(),
            MemberError::NoPrivateKey(member.mid())
        );
    }

    #[test]
    fn public_copy_equals_original() {
        let member = Member::generate();
        let public = Member::from_public_key(member.public_key()).unwrap();
        assert_eq!(member, public);
        assert_eq!(member.mid(), public.mid());
    }

    #[test]
    fn private_key_restores_identity() {
        let member = Member::generate();
        let private = member.private_key().unwrap();
        let restored = Member::from_private_key(&private).unwrap();
        assert_eq!(member, restored);
        assert!(restored.has_private_key());
    }

    #[test]
    fn invalid_public_key_rejected() {
        assert_eq!(
            Member::from_public_key(&[1u8; 7]).unwrap_err(),
            MemberError::InvalidPublicKey(7)
        );
    }

    #[test]
    fn mid_is_digest_of_public_key() {
        let member = Member::generate();
        assert_eq!(member.mid(), Mid::from_public_key(member.public_key()));
    }

    #[test]
    fn signature_by_other_member_fails() {
        let alice = Member::generate();
        let bob = Member::generate();
        let signature = alice.sign(b"data").unwrap();
        assert!(!bob.verify(b"data", &signature));
    }
}
