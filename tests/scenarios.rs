//! End-to-end scenarios exercising the public `Store` surface against the
//! in-memory and filesystem storage backends, standing in for the real
//! `Chain`/`PeerStream` implementations a production caller would supply.

use std::sync::Arc;
use std::time::Duration;

use chainstore::chain::{InMemoryChain, InMemoryChainFactory};
use chainstore::peer::InMemoryPeerStream;
use chainstore::storage::fs::FsStorageFactory;
use chainstore::storage::memory::MemoryStorageFactory;
use chainstore::{ChainOptions, GetOptions, KeyPair, Store, StoreOptions};

async fn memory_store() -> Store {
    Store::open(
        Arc::new(MemoryStorageFactory::default()),
        Arc::new(InMemoryChainFactory),
        StoreOptions::default(),
    )
    .await
    .unwrap()
}

fn entries_of(chain: &Arc<dyn chainstore::Chain>) -> Vec<Vec<u8>> {
    chain.as_any().downcast_ref::<InMemoryChain>().unwrap().entries()
}

fn append(chain: &Arc<dyn chainstore::Chain>, data: &[u8]) {
    chain.as_any().downcast_ref::<InMemoryChain>().unwrap().append_sync(data);
}

#[tokio::test]
async fn default_round_trip_in_memory() {
    let store = memory_store().await;
    let c = store.default(ChainOptions::default()).await.unwrap();
    c.ready().await.unwrap();
    append(&c, b"hello");

    let by_key = store.get(GetOptions::key(c.public_key())).await.unwrap();
    let by_discovery = store
        .get(GetOptions::discovery_key(c.discovery_key()))
        .await
        .unwrap();
    let by_key_pair = store
        .get(GetOptions::key_pair(KeyPair {
            public_key: c.public_key(),
            secret_key: c.secret_key(),
        }))
        .await
        .unwrap();

    for other in [&by_key, &by_discovery, &by_key_pair] {
        other.ready().await.unwrap();
        assert!(Arc::ptr_eq(&c, other));
    }
}

#[tokio::test]
async fn simple_replication_converges_both_directions() {
    let s1 = memory_store().await;
    let s2 = memory_store().await;

    let c1 = s1.default(ChainOptions::default()).await.unwrap();
    let c2 = s1.get(GetOptions::empty()).await.unwrap();
    c1.ready().await.unwrap();
    c2.ready().await.unwrap();
    append(&c1, b"hello");
    append(&c1, b"world");
    append(&c2, b"cat");
    append(&c2, b"dog");

    // S2 already knows both chains' public keys before replication starts.
    let c3 = s2.get(GetOptions::key(c1.public_key())).await.unwrap();
    let c4 = s2.get(GetOptions::key(c2.public_key())).await.unwrap();
    c3.ready().await.unwrap();
    c4.ready().await.unwrap();

    let (stream1, stream2) = InMemoryPeerStream::pair();
    s1.replicate(stream1, true, ChainOptions::default()).await.unwrap();
    s2.replicate(stream2, false, ChainOptions::default()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(entries_of(&c3), vec![b"hello".to_vec(), b"world".to_vec()]);
    assert_eq!(entries_of(&c4), vec![b"cat".to_vec(), b"dog".to_vec()]);
}

#[tokio::test]
async fn sparse_live_replication_injects_a_chain_opened_after_the_stream_is_up() {
    let s1 = memory_store().await;
    let s2 = memory_store().await;
    let sparse = ChainOptions { sparse: true };

    // Both sides only know about their own default chain when replication
    // begins.
    let d1 = s1.default(sparse.clone()).await.unwrap();
    let d2 = s2.default(sparse.clone()).await.unwrap();
    d1.ready().await.unwrap();
    d2.ready().await.unwrap();

    let (stream1, stream2) = InMemoryPeerStream::pair();
    s1.replicate(stream1, true, sparse.clone()).await.unwrap();
    s2.replicate(stream2, false, sparse.clone()).await.unwrap();

    // A second chain appears on S1 only after the stream is already live.
    let late = s1.get(GetOptions::name("late")).await.unwrap();
    late.ready().await.unwrap();
    append(&late, b"after-injection");
    let late_key = late.public_key();

    tokio::time::sleep(Duration::from_millis(20)).await;

    let on_s2 = s2.get(GetOptions::key(late_key)).await.unwrap();
    on_s2.ready().await.unwrap();
    assert_eq!(entries_of(&on_s2), vec![b"after-injection".to_vec()]);
}

#[tokio::test]
async fn reopen_by_discovery_key_recovers_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsStorageFactory::new(dir.path()));

    let discovery_key = {
        let store = Store::open(
            storage.clone(),
            Arc::new(InMemoryChainFactory),
            StoreOptions::default(),
        )
        .await
        .unwrap();
        let c = store.default(ChainOptions::default()).await.unwrap();
        c.ready().await.unwrap();
        append(&c, b"hello");
        let dk = c.discovery_key();
        store.close().await.unwrap();
        dk
    };

    let reopened = Store::open(storage, Arc::new(InMemoryChainFactory), StoreOptions::default())
        .await
        .unwrap();
    assert!(reopened.is_loaded(&discovery_key).await == false);

    let c = reopened
        .get(GetOptions::discovery_key(discovery_key))
        .await
        .unwrap();
    c.ready().await.unwrap();
    assert_eq!(c.discovery_key(), discovery_key);
    assert!(reopened.is_loaded(&discovery_key).await);
}

#[tokio::test]
async fn namespaced_ref_count_deduplicates_per_view() {
    let store = memory_store().await;
    let s2 = store.namespace("a");
    let s3 = store.namespace("b");

    let f1 = s2.default(ChainOptions::default()).await.unwrap();
    f1.ready().await.unwrap();

    for _ in 0..3 {
        let got = s3.get(GetOptions::key(f1.public_key())).await.unwrap();
        got.ready().await.unwrap();
    }

    assert!(store.is_external(&f1.discovery_key()).await);
}

#[tokio::test]
async fn top_level_replicates_chains_from_every_namespace() {
    let s1 = memory_store().await;
    let s2 = memory_store().await;

    let root_default = s1.default(ChainOptions::default()).await.unwrap();
    root_default.ready().await.unwrap();
    append(&root_default, b"root-entry");

    let child = s1.namespace("child");
    let child_chain = child.get(GetOptions::name("c")).await.unwrap();
    child_chain.ready().await.unwrap();
    append(&child_chain, b"child-entry");
    let child_key = child_chain.public_key();

    let (stream1, stream2) = InMemoryPeerStream::pair();
    s1.replicate(stream1, true, ChainOptions::default()).await.unwrap();
    s2.replicate(stream2, false, ChainOptions::default()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;

    let on_s2 = s2.get(GetOptions::key(child_key)).await.unwrap();
    on_s2.ready().await.unwrap();
    assert_eq!(entries_of(&on_s2), vec![b"child-entry".to_vec()]);
}
