//! Unix datagram transport.
//!
//! Every participant (replica or client) owns a datagram socket bound at
//! `<dir>/<id>` and addresses others by their id under the same
//! directory. A broadcast destination fans out to every configured peer.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::net::UnixDatagram;
use tracing::debug;

use crate::core::message::{Message, BROADCAST, MAX_DATAGRAM};
use crate::transport::{Transport, TransportError};

pub struct UnixDatagramTransport {
    dir: PathBuf,
    socket: UnixDatagram,
    /// Recipients of a broadcast destination.
    peers: Vec<String>,
    buf: Vec<u8>,
}

impl UnixDatagramTransport {
    /// Bind the endpoint named by `id` under `dir`. Peer endpoints are
    /// expected (eventually) at `<dir>/<peer>`.
    pub fn bind(dir: &Path, id: &str, peers: Vec<String>) -> std::io::Result<Self> {
        let path = dir.join(id);
        // A stale socket file from a previous run would fail the bind.
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let socket = UnixDatagram::bind(&path)?;
        Ok(UnixDatagramTransport {
            dir: dir.to_path_buf(),
            socket,
            peers,
            buf: vec![0; MAX_DATAGRAM],
        })
    }

    /// Best-effort single-destination send. An absent or unreachable
    /// endpoint is indistinguishable from a lost datagram.
    async fn send_to(&self, bytes: &[u8], dst: &str) {
        let path = self.dir.join(dst);
        if let Err(err) = self.socket.send_to(bytes, &path).await {
            debug!(%dst, %err, "datagram dropped");
        }
    }
}

#[async_trait]
impl Transport for UnixDatagramTransport {
    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        let bytes = msg.to_bytes()?;
        if msg.dst == BROADCAST {
            for peer in &self.peers {
                self.send_to(&bytes, peer).await;
            }
        } else {
            self.send_to(&bytes, &msg.dst).await;
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Message, TransportError> {
        loop {
            let n = self.socket.recv(&mut self.buf).await?;
            match Message::from_bytes(&self.buf[..n]) {
                Ok(msg) => return Ok(msg),
                // Empty or unparseable datagrams are dropped silently.
                Err(err) => debug!(%err, len = n, "dropping undecodable datagram"),
            }
        }
    }
}
