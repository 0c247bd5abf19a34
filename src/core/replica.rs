//! The replication protocol core.
//!
//! `Replica` is a deterministic state machine: messages and timer events go
//! in, state mutates, and outbound messages come back as [`Effects`]. All
//! I/O and clock handling lives in the surrounding event loop
//! (`core::server`), which keeps every protocol rule unit-testable without
//! a transport.
//!
//! Roles follow the usual leader-election scheme: followers redirect
//! clients and answer vote and append traffic, candidates solicit votes,
//! and the leader owns the log, replicates it, and acknowledges writes
//! once they are committed on a majority.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::core::message::{LogEntry, Message, Payload, BROADCAST};
use crate::store::KvStore;

/// Cap on entries carried by a single append so the encoded datagram
/// stays within `MAX_DATAGRAM`; a lagging follower catches up across
/// successive rounds.
const MAX_APPEND_ENTRIES: usize = 64;

/// Replica role. Per-message behavior is dispatched on (role, type);
/// anything outside a role's expected set is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Outcome of feeding one event into the core: messages to transmit and
/// whether the caller must re-arm the election timer.
#[derive(Debug, Default)]
pub struct Effects {
    pub messages: Vec<Message>,
    pub reset_election_timer: bool,
}

/// A client write waiting for its log entry to commit.
#[derive(Debug, Clone)]
struct PendingPut {
    client: String,
    mid: String,
}

/// Protocol state for one replica.
pub struct Replica {
    id: String,
    peers: Vec<String>,

    pub role: Role,
    /// Monotonically non-decreasing.
    pub current_term: u64,
    /// term → candidate voted for in that term. At most one entry per
    /// term is ever inserted, which is what bounds votes to one per term.
    voted_for: HashMap<u64, String>,
    /// Zero-indexed, append-only except for truncation by a newer leader.
    pub log: Vec<LogEntry>,
    /// Best-known leader, `BROADCAST` when none.
    pub leader_id: String,
    /// Highest committed log index, −1 when nothing is committed.
    pub committed_index: i64,
    store: KvStore,

    /// Peers that granted a vote in the current candidacy (plus self).
    votes_received: HashSet<String>,
    /// Leader bookkeeping: next log index to send to each peer.
    next_index: HashMap<String, usize>,
    /// Leader bookkeeping: writes awaiting commit, keyed by log index.
    pending_puts: HashMap<usize, PendingPut>,
}

impl Replica {
    pub fn new(id: String, peers: Vec<String>) -> Self {
        Replica {
            id,
            peers,
            role: Role::Follower,
            current_term: 0,
            voted_for: HashMap::new(),
            log: Vec::new(),
            leader_id: BROADCAST.to_string(),
            committed_index: -1,
            store: KvStore::new(),
            votes_received: HashSet::new(),
            next_index: HashMap::new(),
            pending_puts: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The committed key→value state, for reads and test inspection.
    pub fn data(&self) -> &KvStore {
        &self.store
    }

    /// Quorum size counting this replica: ⌊(N+1)/2⌋ + 1 for N peers.
    fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn last_log_index(&self) -> i64 {
        self.log.len() as i64 - 1
    }

    fn last_log_term(&self) -> i64 {
        self.log.last().map(|e| e.term as i64).unwrap_or(-1)
    }

    /// Build an outbound message stamped with our identity and term.
    fn envelope(&self, dst: &str, payload: Payload) -> Message {
        Message {
            src: self.id.clone(),
            dst: dst.to_string(),
            leader: self.leader_id.clone(),
            term: self.current_term,
            payload,
        }
    }

    // === Event entry points ===

    /// Process one inbound message.
    pub fn handle_message(&mut self, msg: Message) -> Effects {
        let mut fx = Effects::default();

        // A strictly greater term attached to a real leader deposes
        // whatever we were doing, before any role-specific dispatch.
        if msg.term > self.current_term && msg.leader != BROADCAST {
            self.become_follower(msg.term, msg.leader.clone(), &mut fx);
        }

        let Message {
            src, term, payload, ..
        } = msg;

        match payload {
            Payload::Get { key, mid } => self.handle_get(&src, &key, mid, &mut fx),
            Payload::Put { key, value, mid } => self.handle_put(src, key, value, mid, &mut fx),
            Payload::RequestVote {
                last_index,
                last_term,
            } => self.handle_request_vote(&src, term, last_index, last_term, &mut fx),
            Payload::Vote { vote } => self.handle_vote(&src, term, &vote, &mut fx),
            Payload::AppendEntries {
                committed,
                next_index,
                last_index,
                last_term,
                entries,
            } => self.handle_append_entries(
                &src, term, committed, next_index, last_index, last_term, entries, &mut fx,
            ),
            Payload::Ok { next_index, .. } => {
                self.handle_append_ok(&src, term, next_index, &mut fx)
            }
            Payload::Fail { mid } => self.handle_append_fail(&src, term, mid),
            // Replicas never act on redirects.
            Payload::Redirect { .. } => {}
        }

        fx
    }

    /// The election timer fired: start (or restart) an election.
    pub fn election_timeout(&mut self) -> Effects {
        let mut fx = Effects::default();
        if self.role == Role::Leader {
            return fx;
        }

        self.current_term += 1;
        self.role = Role::Candidate;
        self.leader_id = BROADCAST.to_string();
        self.votes_received.clear();
        self.votes_received.insert(self.id.clone());
        self.voted_for
            .insert(self.current_term, self.id.clone());
        info!(id = %self.id, term = self.current_term, "became candidate");

        // A single-replica cluster is won by the self-vote alone.
        if self.votes_received.len() >= self.majority() {
            self.become_leader(&mut fx);
            return fx;
        }

        fx.messages.push(self.envelope(
            BROADCAST,
            Payload::RequestVote {
                last_index: self.last_log_index(),
                last_term: self.last_log_term(),
            },
        ));
        fx.reset_election_timer = true;
        fx
    }

    /// The heartbeat timer fired: emit an append round and advance commits.
    pub fn heartbeat_tick(&mut self) -> Effects {
        let mut fx = Effects::default();
        if self.role != Role::Leader {
            return fx;
        }
        self.broadcast_appends(&mut fx);
        self.try_advance_commit(&mut fx);
        fx.reset_election_timer = true;
        fx
    }

    // === Client interface ===

    fn handle_get(&mut self, src: &str, key: &str, mid: String, fx: &mut Effects) {
        match self.role {
            Role::Leader => {
                let payload = match self.store.get(key) {
                    Some(value) => Payload::Ok {
                        mid: Some(mid),
                        value: Some(value.to_string()),
                        next_index: None,
                    },
                    None => Payload::Fail { mid: Some(mid) },
                };
                fx.messages.push(self.envelope(src, payload));
            }
            Role::Follower => {
                fx.messages
                    .push(self.envelope(src, Payload::Redirect { mid }));
            }
            // Mid-election there is nobody to redirect to; the client
            // retries.
            Role::Candidate => {}
        }
    }

    fn handle_put(&mut self, src: String, key: String, value: String, mid: String, fx: &mut Effects) {
        match self.role {
            Role::Leader => {
                let index = self.log.len();
                self.log.push(LogEntry {
                    index,
                    term: self.current_term,
                    key,
                    value,
                });
                self.pending_puts.insert(index, PendingPut { client: src, mid });
                // A single-replica cluster is its own quorum; everyone
                // else waits for append acknowledgements.
                self.try_advance_commit(fx);
            }
            Role::Follower => {
                fx.messages
                    .push(self.envelope(&src, Payload::Redirect { mid }));
            }
            Role::Candidate => {}
        }
    }

    // === Election ===

    fn handle_request_vote(
        &mut self,
        candidate: &str,
        term: u64,
        last_index: i64,
        last_term: i64,
        fx: &mut Effects,
    ) {
        if term < self.current_term {
            return;
        }
        if self.voted_for.contains_key(&term) {
            // One vote per term; a candidate has already voted for itself.
            return;
        }

        // Adopt the higher term even when the vote is withheld below;
        // the request's leader field is always BROADCAST so the generic
        // adoption above never fires for vote solicitations.
        if term > self.current_term {
            self.become_follower(term, BROADCAST.to_string(), fx);
        }

        let up_to_date = last_term > self.last_log_term()
            || (last_term == self.last_log_term() && last_index >= self.last_log_index());
        if !up_to_date {
            debug!(id = %self.id, %candidate, term, "vote withheld, candidate log behind");
            return;
        }

        self.voted_for.insert(term, candidate.to_string());
        fx.messages.push(self.envelope(
            candidate,
            Payload::Vote {
                vote: candidate.to_string(),
            },
        ));
        fx.reset_election_timer = true;
    }

    fn handle_vote(&mut self, voter: &str, term: u64, vote: &str, fx: &mut Effects) {
        if self.role != Role::Candidate || term != self.current_term || vote != self.id {
            return;
        }
        self.votes_received.insert(voter.to_string());
        if self.votes_received.len() >= self.majority() {
            self.become_leader(fx);
        }
    }

    fn become_leader(&mut self, fx: &mut Effects) {
        self.role = Role::Leader;
        self.leader_id = self.id.clone();
        self.pending_puts.clear();
        for peer in &self.peers {
            self.next_index.insert(peer.clone(), self.log.len());
        }
        info!(id = %self.id, term = self.current_term, "became leader");

        // First heartbeat doubles as the inauguration announcement.
        self.broadcast_appends(fx);
        self.try_advance_commit(fx);
        fx.reset_election_timer = true;
    }

    /// Adopt `term` and fall back to follower. In-flight client writes
    /// are dropped silently; their clients retry against the new leader.
    fn become_follower(&mut self, term: u64, leader: String, fx: &mut Effects) {
        let was = self.role;
        self.current_term = term;
        self.leader_id = leader;
        if was != Role::Follower {
            self.role = Role::Follower;
            self.votes_received.clear();
            self.pending_puts.clear();
            fx.reset_election_timer = true;
            info!(id = %self.id, term, was = ?was, "stepped down to follower");
        }
    }

    // === Log replication ===

    /// One append message per peer, carrying the log suffix that peer is
    /// still missing (empty when it is caught up).
    fn broadcast_appends(&mut self, fx: &mut Effects) {
        let mut out = Vec::with_capacity(self.peers.len());
        for peer in &self.peers {
            let next = self
                .next_index
                .get(peer)
                .copied()
                .unwrap_or(self.log.len());
            let end = (next + MAX_APPEND_ENTRIES).min(self.log.len());
            let entries: Vec<LogEntry> = self.log[next.min(self.log.len())..end].to_vec();
            let last_index = next as i64 - 1;
            let last_term = if last_index < 0 {
                -1
            } else {
                self.log[last_index as usize].term as i64
            };
            out.push(self.envelope(
                peer,
                Payload::AppendEntries {
                    committed: self.committed_index,
                    next_index: next,
                    last_index,
                    last_term,
                    entries,
                },
            ));
        }
        fx.messages.append(&mut out);
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_append_entries(
        &mut self,
        src: &str,
        term: u64,
        committed: i64,
        next_index: usize,
        last_index: i64,
        last_term: i64,
        entries: Vec<LogEntry>,
        fx: &mut Effects,
    ) {
        if term < self.current_term {
            // A deposed leader; refuse without touching log or timer so
            // it backs off and eventually hears the real term.
            fx.messages
                .push(self.envelope(src, Payload::Fail { mid: None }));
            return;
        }

        // term >= ours: the sender is the live leader for this term.
        self.current_term = term;
        if self.role != Role::Follower {
            self.role = Role::Follower;
            self.votes_received.clear();
            self.pending_puts.clear();
            info!(id = %self.id, term, leader = %src, "append received, deferring to leader");
        }
        self.leader_id = src.to_string();
        fx.reset_election_timer = true;

        // Commit information flows even when the log match below fails;
        // the leader only ever advertises majority-replicated indexes.
        self.apply_committed(committed);

        if next_index == 0 {
            // Leader has nothing earlier to match against: take its log
            // wholesale.
            self.log = entries;
            self.reply_append_ok(src, fx);
        } else {
            match self.log.get(last_index as usize) {
                Some(entry) if entry.term as i64 == last_term => {
                    self.log.truncate((last_index + 1) as usize);
                    self.log.extend(entries);
                    self.reply_append_ok(src, fx);
                }
                _ => {
                    fx.messages
                        .push(self.envelope(src, Payload::Fail { mid: None }));
                }
            }
        }
    }

    fn reply_append_ok(&self, src: &str, fx: &mut Effects) {
        fx.messages.push(self.envelope(
            src,
            Payload::Ok {
                mid: None,
                value: None,
                next_index: Some(self.log.len()),
            },
        ));
    }

    fn handle_append_ok(
        &mut self,
        src: &str,
        term: u64,
        next_index: Option<usize>,
        fx: &mut Effects,
    ) {
        // An acknowledgement from an earlier tenure says nothing about
        // the follower's position in the current log.
        if self.role != Role::Leader || term != self.current_term {
            return;
        }
        let Some(next) = next_index else {
            return;
        };
        self.next_index.insert(src.to_string(), next);
        self.try_advance_commit(fx);
    }

    fn handle_append_fail(&mut self, src: &str, term: u64, mid: Option<String>) {
        // fail with a MID is a client-facing reply, never ours to handle.
        if self.role != Role::Leader || term != self.current_term || mid.is_some() {
            return;
        }
        let next = self
            .next_index
            .get(src)
            .copied()
            .unwrap_or(self.log.len());
        self.next_index.insert(src.to_string(), next.saturating_sub(1));
        debug!(id = %self.id, peer = %src, next_index = next.saturating_sub(1), "append rejected, backing off");
    }

    /// Leader commit rule: sort our own log length together with every
    /// peer's acknowledged `next_index` in decreasing order; the value at
    /// position majority−1 is one past the highest index replicated on a
    /// quorum. Only an entry from the current term advances the commit
    /// point directly; older entries ride along underneath it.
    fn try_advance_commit(&mut self, fx: &mut Effects) {
        if self.role != Role::Leader {
            return;
        }

        let mut reach: Vec<usize> = Vec::with_capacity(self.peers.len() + 1);
        reach.push(self.log.len());
        for peer in &self.peers {
            reach.push(self.next_index.get(peer).copied().unwrap_or(0));
        }
        reach.sort_unstable_by(|a, b| b.cmp(a));

        let quorum_next = reach[self.majority() - 1];
        let candidate = (quorum_next as i64 - 1).min(self.last_log_index());
        if candidate <= self.committed_index {
            return;
        }
        if self.log[candidate as usize].term != self.current_term {
            return;
        }

        self.apply_committed(candidate);
        self.ack_committed_puts(fx);
    }

    /// Advance `committed_index` toward `target` (clamped to the log we
    /// actually hold) and replay the newly committed entries into `data`.
    fn apply_committed(&mut self, target: i64) {
        let target = target.min(self.last_log_index());
        while self.committed_index < target {
            self.committed_index += 1;
            self.store.apply(&self.log[self.committed_index as usize]);
        }
    }

    /// Acknowledge every pending write whose entry has now committed.
    fn ack_committed_puts(&mut self, fx: &mut Effects) {
        let mut ready: Vec<usize> = self
            .pending_puts
            .keys()
            .copied()
            .filter(|&index| index as i64 <= self.committed_index)
            .collect();
        ready.sort_unstable();

        for index in ready {
            let pending = self.pending_puts.remove(&index).unwrap();
            debug!(id = %self.id, index, mid = %pending.mid, "put committed");
            fx.messages.push(self.envelope(
                &pending.client,
                Payload::Ok {
                    mid: Some(pending.mid),
                    value: None,
                    next_index: None,
                },
            ));
        }
    }
}
