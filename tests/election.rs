//! Leader election integration tests over the in-memory network.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use raftkv::testing::TestCluster;

#[tokio::test]
async fn test_cold_start_elects_single_leader() {
    let cluster = TestCluster::start(5).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("no leader elected from cold start");
    assert!(cluster.ids.contains(&leader));

    // Followers learn who the leader is through its append traffic.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for shared in &cluster.replicas {
        let replica = shared.lock().await;
        assert_eq!(replica.leader_id, leader, "replica {} disagrees", replica.id());
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leader_is_stable_under_heartbeats() {
    let cluster = TestCluster::start(3).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("no leader elected");
    let term = cluster.replica(&leader).lock().await.current_term;

    // Several election windows pass; the heartbeat stream must keep
    // followers from starting elections.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let leaders = cluster.current_leaders().await;
    assert_eq!(leaders, vec![leader.clone()]);
    assert_eq!(
        cluster.replica(&leader).lock().await.current_term,
        term,
        "term churned while the leader was healthy"
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_at_most_one_leader_per_term() {
    let cluster = TestCluster::start(5).await;

    let mut leaders_by_term: HashMap<u64, HashSet<String>> = HashMap::new();
    for _ in 0..100 {
        for shared in &cluster.replicas {
            let replica = shared.lock().await;
            if replica.role == raftkv::core::replica::Role::Leader {
                leaders_by_term
                    .entry(replica.current_term)
                    .or_default()
                    .insert(replica.id().to_string());
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for (term, leaders) in &leaders_by_term {
        assert!(
            leaders.len() <= 1,
            "term {} had multiple leaders: {:?}",
            term,
            leaders
        );
    }
    assert!(
        !leaders_by_term.is_empty(),
        "no leader was ever observed"
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_terms_never_decrease() {
    let cluster = TestCluster::start(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("no leader elected");

    let mut last_terms: HashMap<String, u64> = HashMap::new();
    for _ in 0..50 {
        for shared in &cluster.replicas {
            let replica = shared.lock().await;
            let prev = last_terms
                .insert(replica.id().to_string(), replica.current_term)
                .unwrap_or(0);
            assert!(
                replica.current_term >= prev,
                "term went backwards on {}",
                replica.id()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cluster.shutdown().await;
}
