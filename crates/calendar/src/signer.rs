//! Block signer: long-lived Ed25519 keypair over block hashes.
//!
//! The secret arrives Base64-encoded at startup and never rotates within a
//! run. Signatures go into blocks as `fingerprint12:base64sig`, where the
//! fingerprint is the first 12 hex chars of `SHA-256(public_key)`; the
//! prefix lets verifiers pick the right key when multiple organizations
//! write into shared downstream systems.

use anyhow::{anyhow, Result};
use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer as _, Verifier as _};

use dtsn_common::crypto::sha256_hex;

/// Hex chars of the public-key digest used as the signature prefix.
const FINGERPRINT_LEN: usize = 12;

pub struct Signer {
    keypair: Keypair,
    fingerprint: String,
}

impl Signer {
    /// Build from a Base64-encoded 32-byte Ed25519 secret.
    pub fn from_base64_secret(b64: &str) -> Result<Self> {
        let raw = base64::decode(b64.trim()).map_err(|e| anyhow!("signing secret is not base64: {}", e))?;
        Self::from_secret_bytes(&raw)
    }

    pub fn from_secret_bytes(raw: &[u8]) -> Result<Self> {
        let secret = SecretKey::from_bytes(raw).map_err(|e| anyhow!("invalid secret key: {}", e))?;
        let public: PublicKey = (&secret).into();
        let fingerprint = sha256_hex(public.as_bytes())[..FINGERPRINT_LEN].to_string();
        Ok(Signer {
            keypair: Keypair { secret, public },
            fingerprint,
        })
    }

    /// First 12 hex chars of `SHA-256(public_key_bytes)`.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.keypair.public.to_bytes()
    }

    /// Base64 detached signature over the ASCII of `hash_hex`.
    pub fn sign_hash_hex(&self, hash_hex: &str) -> String {
        base64::encode(self.keypair.sign(hash_hex.as_bytes()).to_bytes())
    }

    /// The block `sig` field: `fingerprint12:base64Signature`.
    pub fn signature_field(&self, hash_hex: &str) -> String {
        format!("{}:{}", self.fingerprint, self.sign_hash_hex(hash_hex))
    }
}

/// Verify a `fingerprint12:base64sig` field against a known public key.
///
/// Both the fingerprint prefix and the signature itself must match.
pub fn verify_signature_field(pubkey_bytes: &[u8], hash_hex: &str, sig_field: &str) -> Result<bool> {
    let (fingerprint, sig_b64) = sig_field
        .split_once(':')
        .ok_or_else(|| anyhow!("signature field missing fingerprint prefix"))?;
    let expected_fp = &sha256_hex(pubkey_bytes)[..FINGERPRINT_LEN];
    if fingerprint != expected_fp {
        return Ok(false);
    }
    let pk = PublicKey::from_bytes(pubkey_bytes).map_err(|e| anyhow!("invalid public key: {}", e))?;
    let sig_raw = base64::decode(sig_b64).map_err(|e| anyhow!("signature is not base64: {}", e))?;
    let sig = Signature::from_bytes(&sig_raw).map_err(|e| anyhow!("invalid signature: {}", e))?;
    Ok(pk.verify(hash_hex.as_bytes(), &sig).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_signer() -> Signer {
        Signer::from_secret_bytes(&[7u8; 32]).expect("signer")
    }

    #[test]
    fn fingerprint_is_12_hex() {
        let s = test_signer();
        assert_eq!(s.fingerprint().len(), 12);
        assert!(s.fingerprint().bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(&sha256_hex(&s.public_key_bytes())[..12], s.fingerprint());
    }

    #[test]
    fn sign_verify_roundtrip() {
        let s = test_signer();
        let hash = "ab".repeat(32);
        let field = s.signature_field(&hash);
        assert!(field.starts_with(&format!("{}:", s.fingerprint())));
        assert!(verify_signature_field(&s.public_key_bytes(), &hash, &field).unwrap());
    }

    #[test]
    fn wrong_hash_rejected() {
        let s = test_signer();
        let field = s.signature_field(&"ab".repeat(32));
        assert!(!verify_signature_field(&s.public_key_bytes(), &"cd".repeat(32), &field).unwrap());
    }

    #[test]
    fn wrong_fingerprint_rejected() {
        let s = test_signer();
        let other = Signer::from_secret_bytes(&[9u8; 32]).unwrap();
        let hash = "ab".repeat(32);
        let field = s.signature_field(&hash);
        // verifying under a different key: fingerprint prefix already fails
        assert!(!verify_signature_field(&other.public_key_bytes(), &hash, &field).unwrap());
    }

    #[test]
    fn base64_secret_loading() {
        let b64 = base64::encode([7u8; 32]);
        let s = Signer::from_base64_secret(&b64).unwrap();
        assert_eq!(s.fingerprint(), test_signer().fingerprint());
        assert!(Signer::from_base64_secret("not-base64!!").is_err());
        assert!(Signer::from_base64_secret(&base64::encode([1u8; 16])).is_err());
    }
}
