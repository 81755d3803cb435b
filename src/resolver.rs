//! Turns the five `GetOptions` input shapes into a single resolved key
//! record, deciding how (or whether) a keypair is obtained, per spec.md
//! §4.3. Pure and synchronous: it touches no storage, only the master
//! secret already held in memory by the engine.

use crate::crypto::{self, DiscoveryKey, PublicKey, SecretKey};
use crate::error::{Error, Result};
use crate::options::GetOptions;

/// The outcome of resolving one `GetOptions` value.
#[derive(Clone)]
pub struct ResolvedKeys {
    pub public_key: Option<PublicKey>,
    pub secret_key: Option<SecretKey>,
    pub discovery_key: DiscoveryKey,
    /// Set only for chains whose keypair was derived from the master
    /// secret — this is what lets the key-aware storage shim rehydrate a
    /// keypair from disk without ever persisting the secret key itself.
    pub name: Option<Vec<u8>>,
}

pub fn resolve(master: &[u8; 32], opts: &GetOptions) -> Result<ResolvedKeys> {
    if let Some(key_pair) = opts.key_pair {
        let discovery_key = crypto::discovery_key_of(&key_pair.public_key);
        return Ok(ResolvedKeys {
            public_key: Some(key_pair.public_key),
            secret_key: key_pair.secret_key,
            discovery_key,
            name: None,
        });
    }

    if let Some(public_key) = opts.key {
        let discovery_key = crypto::discovery_key_of(&public_key);
        return Ok(ResolvedKeys {
            public_key: Some(public_key),
            secret_key: None,
            discovery_key,
            name: None,
        });
    }

    if let Some(name) = &opts.name {
        return Ok(resolve_name(master, name.as_bytes().to_vec()));
    }

    if opts.default {
        // `{ default: true }` with no name to derive from.
        return Err(Error::MissingName);
    }

    if let Some(discovery_key) = opts.discovery_key {
        // Passive reference: the keypair (if any) is only discoverable once
        // the chain is actually loaded from disk, see `crate::inner`.
        return Ok(ResolvedKeys {
            public_key: None,
            secret_key: None,
            discovery_key,
            name: None,
        });
    }

    // Empty options: derive from a fresh random name.
    Ok(resolve_name(master, crypto::random_bytes(32)))
}

fn resolve_name(master: &[u8; 32], name: Vec<u8>) -> ResolvedKeys {
    let seed = crypto::derive(master, &name);
    let (public_key, secret_key) = crypto::keypair(&seed);
    let discovery_key = crypto::discovery_key_of(&public_key);
    ResolvedKeys {
        public_key: Some(public_key),
        secret_key: Some(secret_key),
        discovery_key,
        name: Some(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::KeyPair;
    use test_case::test_case;

    const MASTER: [u8; 32] = [42u8; 32];

    #[test]
    fn key_pair_input_passes_through() {
        let seed = crypto::derive(&MASTER, b"whatever");
        let (pk, sk) = crypto::keypair(&seed);
        let resolved = resolve(
            &MASTER,
            &GetOptions::key_pair(KeyPair {
                public_key: pk,
                secret_key: Some(sk),
            }),
        )
        .unwrap();
        assert_eq!(resolved.public_key, Some(pk));
        assert_eq!(resolved.secret_key, Some(sk));
        assert_eq!(resolved.discovery_key, crypto::discovery_key_of(&pk));
        assert!(resolved.name.is_none());
    }

    #[test]
    fn key_input_has_no_secret_and_no_name() {
        let seed = crypto::derive(&MASTER, b"whatever");
        let (pk, _) = crypto::keypair(&seed);
        let resolved = resolve(&MASTER, &GetOptions::key(pk)).unwrap();
        assert_eq!(resolved.public_key, Some(pk));
        assert!(resolved.secret_key.is_none());
        assert!(resolved.name.is_none());
    }

    #[test]
    fn name_input_derives_full_keypair() {
        let resolved = resolve(&MASTER, &GetOptions::name("alice")).unwrap();
        assert!(resolved.public_key.is_some());
        assert!(resolved.secret_key.is_some());
        assert_eq!(resolved.name.as_deref(), Some(b"alice".as_slice()));
    }

    #[test]
    fn discovery_key_input_is_passive() {
        let dk = [9u8; 32];
        let resolved = resolve(&MASTER, &GetOptions::discovery_key(dk)).unwrap();
        assert!(resolved.public_key.is_none());
        assert!(resolved.secret_key.is_none());
        assert_eq!(resolved.discovery_key, dk);
    }

    #[test]
    fn empty_input_derives_from_a_random_name() {
        let a = resolve(&MASTER, &GetOptions::empty()).unwrap();
        let b = resolve(&MASTER, &GetOptions::empty()).unwrap();
        assert!(a.public_key.is_some());
        assert_ne!(a.discovery_key, b.discovery_key);
    }

    #[test]
    fn default_without_name_is_missing_name_error() {
        let err = resolve(&MASTER, &GetOptions::default_flag()).unwrap_err();
        assert!(matches!(err, Error::MissingName));
    }

    #[test_case("alice"; "alice")]
    #[test_case("bob"; "bob")]
    #[test_case(""; "empty string name")]
    fn same_name_same_master_is_deterministic(name: &str) {
        let a = resolve(&MASTER, &GetOptions::name(name)).unwrap();
        let b = resolve(&MASTER, &GetOptions::name(name)).unwrap();
        assert_eq!(a.discovery_key, b.discovery_key);
        assert_eq!(a.public_key, b.public_key);
    }

    #[test]
    fn different_names_yield_different_keys() {
        let a = resolve(&MASTER, &GetOptions::name("a")).unwrap();
        let b = resolve(&MASTER, &GetOptions::name("b")).unwrap();
        assert_ne!(a.discovery_key, b.discovery_key);
    }
}
