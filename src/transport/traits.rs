//! Transport abstraction: a framed datagram send/receive pair.
//!
//! A transport carries whole [`Message`]s with datagram semantics: a send
//! is best-effort and may be lost, duplicated, or reordered; a receive
//! yields exactly one decoded message. The protocol core tolerates all
//! three failure modes, so implementations never retry.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::message::Message;

/// A framed, message-boundary-preserving datagram channel.
#[async_trait]
pub trait Transport: Send {
    /// Send one message toward `msg.dst` (or every peer for a broadcast
    /// destination). Delivery is best-effort.
    async fn send(&mut self, msg: Message) -> Result<(), TransportError>;

    /// Wait for the next decodable inbound message. Undecodable or empty
    /// datagrams are dropped without surfacing here.
    async fn recv(&mut self) -> Result<Message, TransportError>;
}

/// Errors that can occur during transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint is gone; the replica cannot continue.
    #[error("datagram endpoint closed")]
    Closed,
    #[error("message does not encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("endpoint i/o failed: {0}")]
    Io(#[from] std::io::Error),
}
