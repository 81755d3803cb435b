//! Deterministic key derivation from a single master secret.
//!
//! Given the same 32-byte master secret and the same name, [`derive`] always
//! produces the same seed, [`keypair`] always produces the same keypair from
//! that seed, and [`discovery_key_of`] always produces the same discovery key
//! from that keypair's public key. Two stores with different master secrets
//! never collide with non-negligible probability.

use ed25519_dalek::{SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use rand::RngCore;

/// Fixed ASCII domain-separation tag for chain keypair derivation.
const NAMESPACE_TAG: &str = "chainstore";

/// Fixed label folded into the discovery key's keyed hash.
const DISCOVERY_TAG: &[u8] = b"bitweb";

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SECRET_KEY_LEN: usize = 64;
pub const DISCOVERY_KEY_LEN: usize = 32;

pub type PublicKey = [u8; PUBLIC_KEY_LEN];
pub type SecretKey = [u8; SECRET_KEY_LEN];
pub type DiscoveryKey = [u8; DISCOVERY_KEY_LEN];

/// Derives a 32-byte seed from `master` and `name`, scoped to the fixed
/// `"chainstore"` namespace tag so that seeds derived here never collide
/// with seeds some other subsystem might derive from the same master secret.
pub fn derive(master: &[u8; 32], name: &[u8]) -> [u8; 32] {
    let mut key_material = Vec::with_capacity(master.len() + name.len());
    key_material.extend_from_slice(master);
    key_material.extend_from_slice(name);
    *blake3::derive_key(NAMESPACE_TAG, &key_material).as_ref()
}

/// Produces a deterministic ed25519 keypair from a 32-byte seed.
pub fn keypair(seed: &[u8; 32]) -> (PublicKey, SecretKey) {
    let signing_key = SigningKey::from_bytes(seed);
    let verifying_key = signing_key.verifying_key();

    let mut secret_key = [0u8; SECRET_KEY_LEN];
    secret_key[..SECRET_KEY_LENGTH].copy_from_slice(&signing_key.to_bytes());
    secret_key[SECRET_KEY_LENGTH..].copy_from_slice(verifying_key.as_bytes());

    (*verifying_key.as_bytes(), secret_key)
}

/// Recovers the ed25519 verifying key bytes from a 64-byte secret key in the
/// `seed || public_key` layout produced by [`keypair`].
pub fn public_key_from_secret(secret_key: &SecretKey) -> PublicKey {
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&secret_key[..SECRET_KEY_LENGTH]);
    let signing_key = SigningKey::from_bytes(&seed);
    *signing_key.verifying_key().as_bytes()
}

/// Validates that `public_key` is a well-formed ed25519 point.
pub fn validate_public_key(public_key: &PublicKey) -> bool {
    VerifyingKey::from_bytes(public_key).is_ok()
}

/// Computes the discovery key for a public key: an HMAC-style keyed hash
/// tying the public key to the fixed `"bitweb"` announcement label, so that
/// the discovery key can be shared with peers without revealing the public
/// key itself.
pub fn discovery_key_of(public_key: &PublicKey) -> DiscoveryKey {
    let mac_key = blake3::hash(DISCOVERY_TAG);
    let mut hasher = blake3::Hasher::new_keyed(mac_key.as_bytes());
    hasher.update(public_key);
    *hasher.finalize().as_bytes()
}

/// Fills a buffer of `n` cryptographically random bytes.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Random 32-byte master secret, generated on first open of a fresh store.
pub fn random_master_secret() -> [u8; 32] {
    let mut buf = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}
