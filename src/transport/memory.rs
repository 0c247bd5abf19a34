//! In-memory datagram switchboard for tests.
//!
//! A [`MemoryNet`] routes messages between registered endpoints the way
//! the simulated network does: unicast by `dst`, fan-out for the
//! broadcast destination, and silent loss across partition boundaries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::message::{Message, BROADCAST};
use crate::transport::{Transport, TransportError};

#[derive(Default)]
struct NetInner {
    endpoints: HashMap<String, mpsc::UnboundedSender<Message>>,
    /// Partition group per endpoint; endpoints in different groups cannot
    /// exchange messages. Unassigned endpoints are in group 0.
    groups: HashMap<String, usize>,
}

/// The shared switchboard. Cloning yields another handle to the same
/// network.
#[derive(Clone, Default)]
pub struct MemoryNet {
    inner: Arc<Mutex<NetInner>>,
}

impl MemoryNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return its transport. Re-registering an id
    /// replaces the previous endpoint.
    pub fn endpoint(&self, id: &str) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap()
            .endpoints
            .insert(id.to_string(), tx);
        MemoryTransport {
            id: id.to_string(),
            net: self.clone(),
            rx,
        }
    }

    /// Split the network: each listed set becomes its own group and any
    /// endpoint not named (including ones registered later) lands in the
    /// first group. Messages only flow within a group.
    pub fn partition(&self, sets: &[&[&str]]) {
        let mut inner = self.inner.lock().unwrap();
        inner.groups.clear();
        for (group, set) in sets.iter().enumerate() {
            for id in *set {
                inner.groups.insert(id.to_string(), group + 1);
            }
        }
    }

    /// Remove all partitions.
    pub fn heal(&self) {
        self.inner.lock().unwrap().groups.clear();
    }

    fn route(&self, msg: Message) {
        let inner = self.inner.lock().unwrap();
        let group_of = |id: &str| inner.groups.get(id).copied().unwrap_or(1);
        let src_group = group_of(&msg.src);

        if msg.dst == BROADCAST {
            for (id, tx) in &inner.endpoints {
                if *id == msg.src {
                    continue;
                }
                if group_of(id) == src_group {
                    let _ = tx.send(msg.clone());
                }
            }
        } else {
            match inner.endpoints.get(&msg.dst) {
                Some(tx) if group_of(&msg.dst) == src_group => {
                    let _ = tx.send(msg);
                }
                // Partitioned or unknown destination: the datagram is lost.
                _ => debug!(dst = %msg.dst, "datagram dropped by switchboard"),
            }
        }
    }
}

/// One endpoint's view of the switchboard.
pub struct MemoryTransport {
    id: String,
    net: MemoryNet,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl MemoryTransport {
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        self.net.route(msg);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Message, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}
