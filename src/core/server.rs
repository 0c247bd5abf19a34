//! Event loop & timers.
//!
//! One loop per replica: wait for the next inbound message or for the
//! role's deadline to expire, whichever comes first. Deadline expiry
//! means election start for followers and candidates, or a heartbeat
//! round (plus commit advancement) for the leader. All state mutation is
//! serialized through this loop; the shared handle exists for wiring and
//! test inspection.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, Instant};
use tracing::{error, info};

use super::config::ReplicaConfig;
use super::replica::{Effects, Replica, Role};
use crate::transport::Transport;

/// Shared handle to a replica's protocol state.
pub type SharedReplica = Arc<Mutex<Replica>>;

/// Handle for stopping a running server.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl ServerHandle {
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Owns the transport and drives one replica until shut down.
pub struct ReplicaServer<T: Transport> {
    replica: SharedReplica,
    transport: T,
    config: ReplicaConfig,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl<T: Transport + 'static> ReplicaServer<T> {
    /// Create a server with default timing. Returns the server and the
    /// shared replica state.
    pub fn new(replica: Replica, transport: T) -> (Self, SharedReplica) {
        Self::with_config(replica, transport, ReplicaConfig::default())
    }

    pub fn with_config(
        replica: Replica,
        transport: T,
        config: ReplicaConfig,
    ) -> (Self, SharedReplica) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let shared = Arc::new(Mutex::new(replica));
        let server = ReplicaServer {
            replica: shared.clone(),
            transport,
            config,
            shutdown_rx,
            shutdown_tx,
        };
        (server, shared)
    }

    /// Spawn the event loop and return a handle for stopping it.
    pub fn start(self) -> ServerHandle {
        let handle = ServerHandle {
            shutdown_tx: self.shutdown_tx.clone(),
        };
        tokio::spawn(self.run());
        handle
    }

    /// Run the event loop to completion.
    pub async fn run(mut self) {
        // Cold start: nobody has heard from a leader yet.
        let mut deadline = Instant::now() + self.config.random_election_timeout();

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    let replica = self.replica.lock().await;
                    info!(id = %replica.id(), "replica shutting down");
                    break;
                }
                received = self.transport.recv() => {
                    match received {
                        Ok(msg) => {
                            let effects = self.replica.lock().await.handle_message(msg);
                            self.apply_effects(effects, &mut deadline).await;
                        }
                        Err(err) => {
                            error!(%err, "transport failed, stopping replica");
                            break;
                        }
                    }
                }
                _ = sleep_until(deadline) => {
                    let effects = {
                        let mut replica = self.replica.lock().await;
                        match replica.role {
                            Role::Leader => replica.heartbeat_tick(),
                            Role::Follower | Role::Candidate => replica.election_timeout(),
                        }
                    };
                    self.apply_effects(effects, &mut deadline).await;
                }
            }
        }
    }

    /// Transmit outbound messages and re-arm the deadline when asked.
    /// Followers and candidates get a fresh random election timeout per
    /// reset; the leader runs on the heartbeat interval.
    async fn apply_effects(&mut self, effects: Effects, deadline: &mut Instant) {
        for msg in effects.messages {
            if let Err(err) = self.transport.send(msg).await {
                error!(%err, "dropping outbound message");
            }
        }
        if effects.reset_election_timer {
            let role = self.replica.lock().await.role;
            let interval = match role {
                Role::Leader => self.config.heartbeat_interval,
                Role::Follower | Role::Candidate => self.config.random_election_timeout(),
            };
            *deadline = Instant::now() + interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{Message, Payload, BROADCAST};
    use crate::transport::memory::MemoryNet;
    use std::time::Duration;

    fn test_config() -> ReplicaConfig {
        ReplicaConfig::default()
            .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300))
            .with_heartbeat_interval(Duration::from_millis(15))
    }

    #[tokio::test]
    async fn test_lone_follower_starts_election() {
        let net = MemoryNet::new();
        let transport = net.endpoint("0000");
        let mut observer = net.endpoint("0001");

        let replica = Replica::new("0000".to_string(), vec!["0001".to_string()]);
        let (server, shared) = ReplicaServer::with_config(replica, transport, test_config());
        let handle = server.start();

        // With no leader traffic the election timer must fire and a vote
        // request must reach the peer.
        let msg = tokio::time::timeout(Duration::from_secs(2), observer.recv())
            .await
            .expect("no election within deadline")
            .unwrap();
        assert!(matches!(msg.payload, Payload::RequestVote { .. }));
        assert_eq!(msg.src, "0000");
        assert_eq!(shared.lock().await.role, Role::Candidate);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeats_suppress_elections() {
        let net = MemoryNet::new();
        let transport = net.endpoint("0001");
        let mut fake_leader = net.endpoint("0000");

        let replica = Replica::new("0001".to_string(), vec!["0000".to_string()]);
        let (server, shared) = ReplicaServer::with_config(replica, transport, test_config());
        let handle = server.start();

        // Feed heartbeats faster than the election window for a while.
        for _ in 0..20 {
            fake_leader
                .send(Message {
                    src: "0000".to_string(),
                    dst: "0001".to_string(),
                    leader: "0000".to_string(),
                    term: 1,
                    payload: Payload::AppendEntries {
                        committed: -1,
                        next_index: 0,
                        last_index: -1,
                        last_term: -1,
                        entries: vec![],
                    },
                })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let replica = shared.lock().await;
        assert_eq!(replica.role, Role::Follower);
        assert_eq!(replica.current_term, 1);
        assert_eq!(replica.leader_id, "0000");
        drop(replica);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        let net = MemoryNet::new();
        let transport = net.endpoint("0000");
        let replica = Replica::new("0000".to_string(), vec![]);
        let (server, _shared) = ReplicaServer::with_config(replica, transport, test_config());

        let handle = server.start();
        handle.shutdown().await;

        // The endpoint can be re-registered once the loop is gone; this
        // is just a liveness check that shutdown completes.
        let _ = net.endpoint(BROADCAST);
    }
}
