//! End-to-end store / load / list / remove scenarios.

mod common;

use common::{eventually, RawConn, TestCluster, TIMEOUT_MS};
use repfs::Error;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn test_store_list_load_roundtrip() {
    let cluster = TestCluster::start(3, 2, false).await;
    cluster.wait_ready().await;
    let mut client = cluster.client().await;

    let targets = client.store("a.txt", b"hello").await.unwrap();
    assert_eq!(targets.len(), 2, "exactly replication-factor targets");

    assert_eq!(client.list().await.unwrap(), vec!["a.txt".to_string()]);
    assert_eq!(client.load("a.txt").await.unwrap(), b"hello");

    eventually(
        || cluster.holders_on_disk("a.txt").len() == 2,
        "both replicas on disk",
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_roundtrip_is_bit_exact_for_binary_blobs() {
    let cluster = TestCluster::start(2, 2, false).await;
    cluster.wait_ready().await;
    let mut client = cluster.client().await;

    let blob: Vec<u8> = (0..=255u8).cycle().take(64 * 1024 + 7).collect();
    client.store("blob.bin", &blob).await.unwrap();
    assert_eq!(client.load("blob.bin").await.unwrap(), blob);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_not_enough_nodes_rejects_everything() {
    let cluster = TestCluster::start(2, 3, false).await;
    let mut client = cluster.client().await;

    assert!(matches!(
        client.store("a.txt", b"hi").await,
        Err(Error::NotEnoughNodes)
    ));
    assert!(matches!(
        client.load("a.txt").await,
        Err(Error::NotEnoughNodes)
    ));
    assert!(matches!(
        client.remove("a.txt").await,
        Err(Error::NotEnoughNodes)
    ));
    assert!(matches!(client.list().await, Err(Error::NotEnoughNodes)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_store_conflicts_with_pending_store() {
    let cluster = TestCluster::start(3, 2, false).await;
    cluster.wait_ready().await;

    // first STORE is left hanging after STORE_TO: no bytes are pushed
    let mut raw = RawConn::connect(cluster.controller.addr()).await;
    raw.send("STORE a.txt 5").await;
    assert!(raw.recv().await.starts_with("STORE_TO "));

    let mut client = cluster.client().await;
    assert!(matches!(
        client.store("a.txt", b"hello").await,
        Err(Error::FileAlreadyExists(_))
    ));

    // a file mid-store is invisible to LIST
    assert!(client.list().await.unwrap().is_empty());

    // once the quorum timeout discards the pending store, the name frees up
    tokio::time::sleep(Duration::from_millis(TIMEOUT_MS + 300)).await;
    client.store("a.txt", b"hello").await.unwrap();
    assert_eq!(client.load("a.txt").await.unwrap(), b"hello");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_store_conflicts_with_committed_file() {
    let cluster = TestCluster::start(2, 2, false).await;
    cluster.wait_ready().await;
    let mut client = cluster.client().await;

    client.store("a.txt", b"hello").await.unwrap();
    assert!(matches!(
        client.store("a.txt", b"other").await,
        Err(Error::FileAlreadyExists(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remove_semantics() {
    let cluster = TestCluster::start(2, 2, false).await;
    cluster.wait_ready().await;
    let mut client = cluster.client().await;

    assert!(matches!(
        client.remove("ghost.txt").await,
        Err(Error::FileNotFound(_))
    ));

    client.store("a.txt", b"hello").await.unwrap();
    client.remove("a.txt").await.unwrap();

    assert!(client.list().await.unwrap().is_empty());
    assert!(matches!(
        client.load("a.txt").await,
        Err(Error::FileNotFound(_))
    ));
    assert!(matches!(
        client.remove("a.txt").await,
        Err(Error::FileNotFound(_))
    ));
    eventually(
        || cluster.holders_on_disk("a.txt").is_empty(),
        "replicas deleted from disk",
    )
    .await;

    // the name is reusable after removal
    client.store("a.txt", b"again").await.unwrap();
    assert_eq!(client.load("a.txt").await.unwrap(), b"again");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_placement_prefers_least_loaded_nodes() {
    let cluster = TestCluster::start(3, 1, false).await;
    cluster.wait_ready().await;
    let mut client = cluster.client().await;

    for i in 0..6 {
        client
            .store(&format!("file-{}.txt", i), b"data")
            .await
            .unwrap();
    }
    // six single-replica files over three nodes: two each
    eventually(
        || {
            let counts: Vec<usize> = cluster
                .nodes
                .iter()
                .map(|n| cluster.files_on_disk(n.port()))
                .collect();
            counts.iter().all(|c| *c == 2)
        },
        "stores spread evenly",
    )
    .await;
}
