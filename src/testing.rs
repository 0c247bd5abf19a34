//! Testing utilities for cluster integration tests.
//!
//! `TestCluster` spins up an in-process cluster over the in-memory
//! switchboard; `TestClient` speaks the client side of the wire protocol,
//! following redirects and retrying timeouts the way real clients must.

use std::time::Duration;

use tokio::time::timeout;

use crate::core::config::ReplicaConfig;
use crate::core::message::{Message, Payload, BROADCAST};
use crate::core::replica::{Replica, Role};
use crate::core::server::{ReplicaServer, ServerHandle, SharedReplica};
use crate::transport::memory::{MemoryNet, MemoryTransport};
use crate::transport::Transport;

/// How long a client waits for one reply before trying elsewhere.
const REPLY_TIMEOUT: Duration = Duration::from_millis(300);
/// Attempts before a client operation is declared failed.
const MAX_ATTEMPTS: usize = 40;

/// An in-process cluster of replicas over a [`MemoryNet`].
pub struct TestCluster {
    pub net: MemoryNet,
    pub ids: Vec<String>,
    pub replicas: Vec<SharedReplica>,
    handles: Vec<ServerHandle>,
    clients_created: usize,
}

impl TestCluster {
    /// Start `count` replicas with test-friendly timing.
    pub async fn start(count: usize) -> Self {
        let config = ReplicaConfig::default()
            .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300))
            .with_heartbeat_interval(Duration::from_millis(15));
        Self::start_with_config(count, config).await
    }

    pub async fn start_with_config(count: usize, config: ReplicaConfig) -> Self {
        let ids: Vec<String> = (0..count).map(|i| format!("{:04X}", i)).collect();
        let net = MemoryNet::new();

        let mut replicas = Vec::new();
        let mut handles = Vec::new();
        for id in &ids {
            let peers: Vec<String> = ids.iter().filter(|p| *p != id).cloned().collect();
            let transport = net.endpoint(id);
            let replica = Replica::new(id.clone(), peers);
            let (server, shared) = ReplicaServer::with_config(replica, transport, config.clone());
            handles.push(server.start());
            replicas.push(shared);
        }

        TestCluster {
            net,
            ids,
            replicas,
            handles,
            clients_created: 0,
        }
    }

    /// A fresh client endpoint on the switchboard.
    pub fn client(&mut self) -> TestClient {
        self.clients_created += 1;
        let id = format!("C{:03X}", self.clients_created);
        TestClient::new(self.net.endpoint(&id), id, self.ids.clone())
    }

    /// Ids of every replica currently in the Leader role.
    pub async fn current_leaders(&self) -> Vec<String> {
        let mut leaders = Vec::new();
        for shared in &self.replicas {
            let replica = shared.lock().await;
            if replica.role == Role::Leader {
                leaders.push(replica.id().to_string());
            }
        }
        leaders
    }

    /// Poll until exactly one leader exists, or give up.
    pub async fn wait_for_leader(&self, wait: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + wait;
        while tokio::time::Instant::now() < deadline {
            let leaders = self.current_leaders().await;
            if leaders.len() == 1 {
                return Some(leaders.into_iter().next().unwrap());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    /// Shared state for the replica with the given id.
    pub fn replica(&self, id: &str) -> &SharedReplica {
        let idx = self.ids.iter().position(|i| i == id).expect("unknown id");
        &self.replicas[idx]
    }

    pub async fn shutdown(self) {
        for handle in &self.handles {
            handle.shutdown().await;
        }
    }
}

/// A wire-protocol client: sends `get`/`put`, follows `redirect`s,
/// rotates replicas on timeouts.
pub struct TestClient {
    transport: MemoryTransport,
    id: String,
    replicas: Vec<String>,
    leader_hint: String,
    seq: u64,
}

impl TestClient {
    pub fn new(transport: MemoryTransport, id: String, replicas: Vec<String>) -> Self {
        TestClient {
            transport,
            id,
            replicas,
            leader_hint: BROADCAST.to_string(),
            seq: 0,
        }
    }

    fn next_mid(&mut self) -> String {
        self.seq += 1;
        format!("{}-{}", self.id, self.seq)
    }

    fn target(&self, attempt: usize) -> String {
        if self.leader_hint != BROADCAST {
            self.leader_hint.clone()
        } else {
            self.replicas[attempt % self.replicas.len()].clone()
        }
    }

    /// Wait for the reply carrying `mid`, discarding strays from earlier
    /// attempts.
    async fn recv_reply(&mut self, mid: &str) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + REPLY_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let msg = timeout(remaining, self.transport.recv()).await.ok()?.ok()?;
            let reply_mid = match &msg.payload {
                Payload::Ok { mid, .. } => mid.as_deref(),
                Payload::Fail { mid } => mid.as_deref(),
                Payload::Redirect { mid } => Some(mid.as_str()),
                _ => None,
            };
            if reply_mid == Some(mid) {
                return Some(msg);
            }
        }
    }

    async fn request(&mut self, payload: Payload, mid: &str) -> Result<Message, String> {
        for attempt in 0..MAX_ATTEMPTS {
            let dst = self.target(attempt);
            let msg = Message {
                src: self.id.clone(),
                dst: dst.clone(),
                leader: self.leader_hint.clone(),
                term: 0,
                payload: payload.clone(),
            };
            if self.transport.send(msg).await.is_err() {
                return Err("client endpoint closed".to_string());
            }

            match self.recv_reply(mid).await {
                Some(reply) => match &reply.payload {
                    Payload::Redirect { .. } => {
                        self.leader_hint = reply.leader.clone();
                        if self.leader_hint == BROADCAST {
                            tokio::time::sleep(Duration::from_millis(30)).await;
                        }
                    }
                    _ => return Ok(reply),
                },
                None => {
                    // No answer: the target may be down, partitioned, or
                    // mid-election. Forget the hint and try elsewhere.
                    self.leader_hint = BROADCAST.to_string();
                }
            }
        }
        Err(format!("no reply after {} attempts", MAX_ATTEMPTS))
    }

    /// Write a key, returning once the cluster has acknowledged it.
    pub async fn put(&mut self, key: &str, value: &str) -> Result<(), String> {
        let mid = self.next_mid();
        let reply = self
            .request(
                Payload::Put {
                    key: key.to_string(),
                    value: value.to_string(),
                    mid: mid.clone(),
                },
                &mid,
            )
            .await?;
        match reply.payload {
            Payload::Ok { .. } => {
                self.leader_hint = reply.src;
                Ok(())
            }
            other => Err(format!("put rejected: {:?}", other)),
        }
    }

    /// Read a key from the leader. `Ok(None)` means the key is unknown.
    pub async fn get(&mut self, key: &str) -> Result<Option<String>, String> {
        let mid = self.next_mid();
        let reply = self
            .request(
                Payload::Get {
                    key: key.to_string(),
                    mid: mid.clone(),
                },
                &mid,
            )
            .await?;
        match reply.payload {
            Payload::Ok { value, .. } => {
                self.leader_hint = reply.src;
                Ok(value)
            }
            Payload::Fail { .. } => Ok(None),
            other => Err(format!("get rejected: {:?}", other)),
        }
    }
}
