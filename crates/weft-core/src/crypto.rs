//! Ed25519 authority keys and justification checks.
//!
//! A justification is valid for a header hash when strictly more than two
//! thirds of the distinct members of the authority set signed that hash.
//! Signatures from non-members or that fail verification reject the whole
//! justification rather than being skipped.

use std::collections::HashSet;

use ed25519_dalek::{Signer, Verifier};

use crate::error::CryptoError;
use crate::types::{AuthorityId, Hash256, Justification, SetId};

/// Signing key of an authority. Used by block producers and test fixtures.
pub struct AuthorityKey {
    signing_key: ed25519_dalek::SigningKey,
}

impl AuthorityKey {
    /// Deterministic key from 32 bytes of secret material.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(&seed),
        }
    }

    pub fn public(&self) -> AuthorityId {
        AuthorityId(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a header hash, returning the 64-byte signature.
    pub fn sign(&self, hash: &Hash256) -> Vec<u8> {
        self.signing_key.sign(hash.as_bytes()).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for AuthorityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorityKey")
            .field("public", &hex::encode(self.public().0))
            .finish()
    }
}

/// Number of distinct signatures needed out of `set_size` authorities.
pub fn signature_threshold(set_size: usize) -> usize {
    set_size - set_size.saturating_sub(1) / 3
}

/// Build a justification signed by every key in `keys`.
pub fn justify(hash: &Hash256, set_id: SetId, keys: &[AuthorityKey]) -> Justification {
    Justification {
        set_id,
        signatures: keys.iter().map(|k| (k.public(), k.sign(hash))).collect(),
    }
}

/// Verify `justification` over `hash` against `authorities`.
pub fn verify_justification(
    hash: &Hash256,
    justification: &Justification,
    authorities: &[AuthorityId],
) -> Result<(), CryptoError> {
    if authorities.is_empty() {
        return Err(CryptoError::EmptyAuthoritySet);
    }
    let members: HashSet<&AuthorityId> = authorities.iter().collect();
    let mut signers = HashSet::new();

    for (signer, signature) in &justification.signatures {
        if !members.contains(signer) {
            return Err(CryptoError::UnknownAuthority);
        }
        let key = ed25519_dalek::VerifyingKey::from_bytes(&signer.0)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let signature = ed25519_dalek::Signature::from_slice(signature)
            .map_err(|_| CryptoError::InvalidSignature)?;
        key.verify(hash.as_bytes(), &signature)
            .map_err(|_| CryptoError::InvalidSignature)?;
        signers.insert(*signer);
    }

    let needed = signature_threshold(members.len());
    if signers.len() < needed {
        return Err(CryptoError::InsufficientSignatures {
            got: signers.len(),
            needed,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: u8) -> Vec<AuthorityKey> {
        (1..=n).map(|i| AuthorityKey::from_seed([i; 32])).collect()
    }

    fn ids(keys: &[AuthorityKey]) -> Vec<AuthorityId> {
        keys.iter().map(AuthorityKey::public).collect()
    }

    #[test]
    fn threshold_is_strict_supermajority() {
        assert_eq!(signature_threshold(1), 1);
        assert_eq!(signature_threshold(3), 3);
        assert_eq!(signature_threshold(4), 3);
        assert_eq!(signature_threshold(7), 5);
        assert_eq!(signature_threshold(10), 7);
    }

    #[test]
    fn full_set_justification_verifies() {
        let keys = keys(4);
        let hash = Hash256([9; 32]);
        let j = justify(&hash, 0, &keys);
        assert!(verify_justification(&hash, &j, &ids(&keys)).is_ok());
    }

    #[test]
    fn too_few_signers_rejected() {
        let keys = keys(4);
        let hash = Hash256([9; 32]);
        let j = justify(&hash, 0, &keys[..2]);
        assert_eq!(
            verify_justification(&hash, &j, &ids(&keys)),
            Err(CryptoError::InsufficientSignatures { got: 2, needed: 3 })
        );
    }

    #[test]
    fn duplicate_signatures_count_once() {
        let keys = keys(4);
        let hash = Hash256([9; 32]);
        let mut j = justify(&hash, 0, &keys[..2]);
        j.signatures.extend(j.signatures.clone());
        assert!(matches!(
            verify_justification(&hash, &j, &ids(&keys)),
            Err(CryptoError::InsufficientSignatures { got: 2, .. })
        ));
    }

    #[test]
    fn signature_over_other_hash_rejected() {
        let keys = keys(3);
        let j = justify(&Hash256([1; 32]), 0, &keys);
        assert_eq!(
            verify_justification(&Hash256([2; 32]), &j, &ids(&keys)),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn outsider_signature_rejected() {
        let keys = keys(3);
        let outsider = AuthorityKey::from_seed([0xEE; 32]);
        let hash = Hash256([3; 32]);
        let mut j = justify(&hash, 0, &keys);
        j.signatures.push((outsider.public(), outsider.sign(&hash)));
        assert_eq!(
            verify_justification(&hash, &j, &ids(&keys)),
            Err(CryptoError::UnknownAuthority)
        );
    }

    #[test]
    fn empty_set_rejected() {
        let hash = Hash256([3; 32]);
        let j = Justification { set_id: 0, signatures: vec![] };
        assert_eq!(
            verify_justification(&hash, &j, &[]),
            Err(CryptoError::EmptyAuthoritySet)
        );
    }
}
