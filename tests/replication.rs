//! Client-visible replication behavior: puts, gets, redirects, and
//! cross-replica convergence.

use std::time::Duration;

use tokio::time::timeout;

use raftkv::core::message::{Message, Payload, BROADCAST};
use raftkv::testing::TestCluster;
use raftkv::transport::Transport;

#[tokio::test]
async fn test_put_then_get_roundtrip() {
    let mut cluster = TestCluster::start(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("no leader elected");

    let mut client = cluster.client();
    client.put("a", "1").await.expect("put not acknowledged");
    assert_eq!(client.get("a").await.unwrap(), Some("1".to_string()));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_get_missing_key_fails() {
    let mut cluster = TestCluster::start(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("no leader elected");

    let mut client = cluster.client();
    assert_eq!(client.get("never-written").await.unwrap(), None);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_follower_redirects_to_leader() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("no leader elected");
    let follower = cluster
        .ids
        .iter()
        .find(|id| **id != leader)
        .unwrap()
        .clone();

    // Let the first heartbeat round teach the followers who won.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Speak the wire protocol by hand so the redirect itself is visible.
    let mut endpoint = cluster.net.endpoint("CFFE");
    endpoint
        .send(Message {
            src: "CFFE".to_string(),
            dst: follower.clone(),
            leader: BROADCAST.to_string(),
            term: 0,
            payload: Payload::Put {
                key: "a".to_string(),
                value: "1".to_string(),
                mid: "m-redirect".to_string(),
            },
        })
        .await
        .unwrap();

    let reply = timeout(Duration::from_millis(500), endpoint.recv())
        .await
        .expect("follower stayed silent")
        .unwrap();
    assert_eq!(reply.src, follower);
    assert_eq!(reply.leader, leader);
    assert_eq!(
        reply.payload,
        Payload::Redirect {
            mid: "m-redirect".to_string()
        }
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_back_to_back_puts_keep_last_value() {
    let mut cluster = TestCluster::start(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("no leader elected");

    let mut client = cluster.client();
    client.put("a", "1").await.unwrap();
    client.put("a", "2").await.unwrap();
    assert_eq!(client.get("a").await.unwrap(), Some("2".to_string()));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_many_keys_survive_replication() {
    let mut cluster = TestCluster::start(5).await;
    cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("no leader elected");

    let mut client = cluster.client();
    for i in 0..20 {
        client
            .put(&format!("key-{}", i), &format!("value-{}", i))
            .await
            .unwrap();
    }
    for i in 0..20 {
        assert_eq!(
            client.get(&format!("key-{}", i)).await.unwrap(),
            Some(format!("value-{}", i))
        );
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_logs_and_data_converge_across_replicas() {
    let mut cluster = TestCluster::start(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("no leader elected");

    let mut client = cluster.client();
    for i in 0..5 {
        client.put(&format!("k{}", i), &format!("v{}", i)).await.unwrap();
    }

    // Give the heartbeat rhythm a few rounds to carry the final commit
    // index to every follower.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let reference = cluster.replicas[0].lock().await.log.clone();
    assert_eq!(reference.len(), 5);
    for shared in &cluster.replicas {
        let replica = shared.lock().await;
        assert_eq!(replica.log, reference, "log diverged on {}", replica.id());
        assert_eq!(replica.committed_index, reference.len() as i64 - 1);
        for i in 0..5 {
            assert_eq!(
                replica.data().get(&format!("k{}", i)),
                Some(format!("v{}", i).as_str()),
                "data diverged on {}",
                replica.id()
            );
        }
    }

    cluster.shutdown().await;
}
