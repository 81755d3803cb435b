//! A factory and lifecycle manager for a collection of append-only,
//! cryptographically-addressed chains sharing one storage root, one master
//! secret and one set of peer connections.
//!
//! A [`view::Store`] derives every chain's keypair from a single master
//! secret ([`crypto`]), resolves `get` requests against that derivation
//! ([`resolver`]), keeps a bounded, reference-counted cache of open chain
//! handles ([`cache`]) backed by a pluggable byte-addressable storage root
//! ([`storage`]), and fans chains out onto peer connections as they become
//! ready ([`replication`]). The actual append-only log structure — the
//! Merkle tree, the sparse replication protocol — is deliberately out of
//! scope; this crate only manages *which* chains exist, *where* they're
//! stored and *who* they're replicated to. See [`chain::Chain`] and
//! [`peer::PeerStream`] for the two traits a concrete implementation must
//! provide.

mod cache;
pub mod chain;
pub mod crypto;
mod error;
mod inner;
pub mod options;
pub mod peer;
mod replication;
mod resolver;
pub mod storage;
mod view;

pub use chain::{Chain, ChainFactory};
pub use crypto::{DiscoveryKey, PublicKey, SecretKey};
pub use error::{Error, Result};
pub use options::{ChainOptions, GetOptions, KeyPair, StoreOptions, SubCache};
pub use peer::{PeerEvent, PeerStream};
pub use storage::{Stat, Storage, StorageFactory};
pub use view::{Store, StoreEvent};
