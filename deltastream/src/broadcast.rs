//! Fan-out of sequenced messages to every session of a document.
//!
//! Each session owns an unbounded channel. Sends happen while the sequencer
//! holds its state lock, so every session receives frames in exactly the
//! order they were sequenced and nothing is dropped for a live receiver.
//! Sessions whose receiver has gone away are counted as dropped until the
//! sequencer processes their leave.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::protocol::{SequencedMessage, ServerFrame};

/// Sending half of a session's frame channel.
pub type FrameSender = mpsc::UnboundedSender<ServerFrame>;
/// Receiving half of a session's frame channel.
pub type FrameReceiver = mpsc::UnboundedReceiver<ServerFrame>;

/// Identifies one attached session inside a sequencer.
pub type SessionId = u64;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub frames_dropped: u64,
    pub active_members: usize,
}

/// Lock-free counters; read via [`BroadcastGroup::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Broadcast group for a single document.
#[derive(Default)]
pub struct BroadcastGroup {
    members: HashMap<SessionId, FrameSender>,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a session. Returns the receiver the session reads frames from.
    pub fn add_member(&mut self, session: SessionId) -> FrameReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.members.insert(session, tx);
        rx
    }

    pub fn remove_member(&mut self, session: SessionId) -> bool {
        self.members.remove(&session).is_some()
    }

    pub fn has_member(&self, session: SessionId) -> bool {
        self.members.contains_key(&session)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Send one batch of sequenced messages to every member, including the
    /// originator. Returns the number of members that accepted the frame.
    pub fn broadcast(&self, messages: &[SequencedMessage]) -> usize {
        if messages.is_empty() {
            return 0;
        }
        let mut delivered = 0;
        for tx in self.members.values() {
            if tx.send(ServerFrame::Op(messages.to_vec())).is_ok() {
                delivered += 1;
            } else {
                self.atomic_stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.atomic_stats
            .messages_sent
            .fetch_add(messages.len() as u64, Ordering::Relaxed);
        delivered
    }

    /// Send a frame to a single member (nacks, connect replies).
    pub fn send_to(&self, session: SessionId, frame: ServerFrame) -> bool {
        let sent = self
            .members
            .get(&session)
            .is_some_and(|tx| tx.send(frame).is_ok());
        if !sent {
            self.atomic_stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            frames_dropped: self.atomic_stats.frames_dropped.load(Ordering::Relaxed),
            active_members: self.members.len(),
        }
    }
}
