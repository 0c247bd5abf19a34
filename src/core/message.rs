//! Wire format for replica-to-replica and client-to-replica traffic.
//!
//! Every message is a single JSON-encoded record carried in one datagram.
//! The envelope fields `src`, `dst`, `leader`, `term`, and `type` are common
//! to all messages; the remaining fields depend on `type`.

use serde::{Deserialize, Serialize};

/// Destination meaning "no specific replica": used by clients before a
/// leader is known and by replicas as the leader hint when none exists.
pub const BROADCAST: &str = "FFFF";

/// Upper bound on an encoded datagram. The transport guarantees at least
/// 32 KiB; one page of slack on top keeps large append batches safe.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// A single replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Zero-based position in the log.
    pub index: usize,
    /// Leader's term when the entry was appended.
    pub term: u64,
    pub key: String,
    pub value: String,
}

/// Common envelope around every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sender id.
    pub src: String,
    /// Recipient id, or [`BROADCAST`].
    pub dst: String,
    /// Sender's best-known leader id, or [`BROADCAST`].
    pub leader: String,
    /// Sender's current term. Clients send 0.
    #[serde(default)]
    pub term: u64,
    #[serde(flatten)]
    pub payload: Payload,
}

/// The `type`-tagged body of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Client read.
    Get {
        key: String,
        #[serde(rename = "MID")]
        mid: String,
    },
    /// Client write.
    Put {
        key: String,
        value: String,
        #[serde(rename = "MID")]
        mid: String,
    },
    /// Candidate solicits a vote. `last_index`/`last_term` describe the
    /// candidate's log tail (−1 when the log is empty) so voters can
    /// refuse candidates that are behind.
    RequestVote { last_index: i64, last_term: i64 },
    /// A granted vote; `vote` names the candidate.
    Vote { vote: String },
    /// Log replication and heartbeat. `entries` is the suffix of the
    /// leader's log starting at `next_index`; empty when the follower is
    /// caught up.
    AppendEntries {
        /// Leader's committed index (−1 when nothing is committed).
        committed: i64,
        /// First index carried in `entries`; 0 means "replace your log
        /// with `entries` wholesale".
        next_index: usize,
        /// Index immediately before `entries` (−1 at the log head).
        last_index: i64,
        /// Term of the entry at `last_index` (−1 at the log head).
        last_term: i64,
        entries: Vec<LogEntry>,
    },
    /// Success reply. To a client it echoes `MID` (and carries `value`
    /// for a `get`); between replicas it carries the follower's
    /// resulting log length as `next_index`.
    Ok {
        #[serde(rename = "MID", default, skip_serializing_if = "Option::is_none")]
        mid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_index: Option<usize>,
    },
    /// Failure reply. To a client it echoes `MID`; between replicas it
    /// signals a log mismatch and carries no extra fields.
    Fail {
        #[serde(rename = "MID", default, skip_serializing_if = "Option::is_none")]
        mid: Option<String>,
    },
    /// A non-leader's refusal to serve a client; `leader` in the
    /// envelope is the best-known leader id.
    Redirect {
        #[serde(rename = "MID")]
        mid: String,
    },
}

impl Message {
    /// Encode into the single-datagram JSON representation.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a received datagram.
    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Message> {
        serde_json::from_slice(bytes)
    }

    /// The message type name as it appears on the wire, for logs.
    pub fn kind(&self) -> &'static str {
        match self.payload {
            Payload::Get { .. } => "get",
            Payload::Put { .. } => "put",
            Payload::RequestVote { .. } => "request_vote",
            Payload::Vote { .. } => "vote",
            Payload::AppendEntries { .. } => "append_entries",
            Payload::Ok { .. } => "ok",
            Payload::Fail { .. } => "fail",
            Payload::Redirect { .. } => "redirect",
        }
    }
}
