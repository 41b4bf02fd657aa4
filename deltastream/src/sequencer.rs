//! Per-document sequencer: the single writer of the sequence number.
//!
//! ```text
//! join ──► ClientJoin ─┐
//! submit ─► validate ──┼─► next seq ──► history ──► BroadcastGroup ──► sessions
//!              │       │
//!              ▼       └─ Summarize ─► SummaryAck / SummaryNack
//!            Nack ──► submitting session only
//! leave ─► ClientLeave ─► (NoClient when the last client leaves)
//! ```
//!
//! All state lives behind one mutex. Sequencing, quorum updates and fan-out
//! happen under that lock so every session observes the same gapless order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats, FrameReceiver, SessionId};
use crate::protocol::{
    to_json, to_json_string, Client, ClientJoin, ConnectionDetails, ConnectionMode,
    DocumentMessage, MessageType, Nack, NackReason, ProtocolError, SequencedMessage, ServerFrame,
    SummaryAckContent, SummaryNackContent, SummaryProposal,
};
use crate::quorum::{Quorum, QuorumError};
use crate::summary::{ProtocolAttributes, ProtocolState, SummaryError, SummaryTree};

/// Sequencer configuration.
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Maximum concurrently joined clients
    pub max_clients: usize,
    /// Append a `NoClient` message when the last client leaves
    pub emit_no_client: bool,
    /// Maximum operation contents size in bytes
    pub max_message_size: usize,
    /// Retained catch-up history (None = unbounded)
    pub history_limit: Option<usize>,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_clients: 100,
            emit_no_client: true,
            max_message_size: 16 * 1024,
            history_limit: None,
        }
    }
}

/// Sequencer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequencerStats {
    pub sequence_number: u64,
    pub minimum_sequence_number: u64,
    pub sequenced: u64,
    pub nacked: u64,
    pub joins: u64,
    pub leaves: u64,
    pub active_clients: usize,
    pub broadcast: BroadcastStats,
}

#[derive(Default)]
struct AtomicSequencerStats {
    sequenced: AtomicU64,
    nacked: AtomicU64,
    joins: AtomicU64,
    leaves: AtomicU64,
}

/// What a transport receives when a client is admitted.
#[derive(Debug)]
pub struct SessionHandle {
    pub session: SessionId,
    pub details: ConnectionDetails,
    /// Frames for this session, starting with its own `ClientJoin`
    pub frames: FrameReceiver,
}

/// Result of one submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub sequenced: usize,
    pub nacked: usize,
}

/// Identity bound to a session at connect time.
struct Session {
    client_id: Uuid,
    mode: ConnectionMode,
    last_client_sequence_number: u64,
    /// Latest reference sequence number, for the minimum sequence number
    reference_sequence_number: u64,
}

struct SequencerState {
    branch: String,
    sequence_number: u64,
    minimum_sequence_number: u64,
    last_summary_sequence_number: u64,
    next_session: SessionId,
    sessions: HashMap<SessionId, Session>,
    quorum: Quorum,
    broadcast: BroadcastGroup,
    history: VecDeque<SequencedMessage>,
}

impl SequencerState {
    fn from_protocol(state: &ProtocolState) -> Self {
        Self {
            branch: state.attributes.branch.clone(),
            sequence_number: state.attributes.sequence_number,
            minimum_sequence_number: state.attributes.minimum_sequence_number,
            // The loaded summary counts as the last acknowledged one.
            last_summary_sequence_number: state.attributes.sequence_number,
            next_session: 1,
            sessions: HashMap::new(),
            quorum: state.quorum(),
            broadcast: BroadcastGroup::new(),
            history: VecDeque::new(),
        }
    }

    fn next_sequence_number(&mut self) -> u64 {
        self.sequence_number += 1;
        self.sequence_number
    }

    /// Recompute the minimum sequence number. It never moves backwards.
    fn update_minimum_sequence_number(&mut self) -> u64 {
        let msn = self
            .sessions
            .values()
            .map(|s| s.reference_sequence_number)
            .min()
            .unwrap_or(self.sequence_number);
        self.minimum_sequence_number = self.minimum_sequence_number.max(msn);
        self.quorum
            .update_minimum_sequence_number(self.minimum_sequence_number);
        self.minimum_sequence_number
    }

    fn append(&mut self, message: SequencedMessage, limit: Option<usize>) {
        self.history.push_back(message);
        if let Some(limit) = limit {
            while self.history.len() > limit {
                self.history.pop_front();
            }
        }
    }

    /// Build the sequencer's answer to a sequenced `Summarize`.
    fn summary_response(
        &mut self,
        summarize: &SequencedMessage,
    ) -> Result<SequencedMessage, ProtocolError> {
        let summary_proposal = SummaryProposal {
            summary_sequence_number: summarize.sequence_number,
        };
        let verdict = match summarize.summary_content() {
            Ok(content) if content.handle.is_empty() => Err("summary handle is empty".to_string()),
            Ok(_)
                if self.last_summary_sequence_number > 0
                    && summarize.reference_sequence_number
                        < self.last_summary_sequence_number as i64 =>
            {
                Err(format!(
                    "summary at reference {} is older than acknowledged summary {}",
                    summarize.reference_sequence_number, self.last_summary_sequence_number
                ))
            }
            Ok(content) => Ok(content),
            Err(e) => Err(format!("invalid summary contents: {e}")),
        };

        let (msg_type, contents) = match verdict {
            Ok(content) => (
                MessageType::SummaryAck,
                to_json(&SummaryAckContent {
                    handle: content.handle,
                    summary_proposal,
                })?,
            ),
            Err(message) => {
                log::warn!("Summary at {} rejected: {message}", summarize.sequence_number);
                (
                    MessageType::SummaryNack,
                    to_json(&SummaryNackContent {
                        message,
                        summary_proposal,
                    })?,
                )
            }
        };
        if msg_type == MessageType::SummaryAck {
            self.last_summary_sequence_number = summarize.sequence_number;
        }

        let seq = self.next_sequence_number();
        let msn = self.update_minimum_sequence_number();
        let mut response = SequencedMessage::system(msg_type, seq, msn);
        response.contents = Some(contents);
        Ok(response)
    }
}

/// Check one client message against the identity and position of its session.
fn validate(
    session: &Session,
    claimed_client_id: Uuid,
    message: &DocumentMessage,
    sequence_number: u64,
    minimum_sequence_number: u64,
    max_message_size: usize,
) -> Result<(), (NackReason, String)> {
    if claimed_client_id != session.client_id {
        return Err((
            NackReason::IdentityMismatch,
            format!(
                "submission claims client {claimed_client_id} but connection is bound to {}",
                session.client_id
            ),
        ));
    }
    if message.msg_type.is_sequencer_only() {
        return Err((
            NackReason::SystemMessage,
            format!("{} may only be originated by the sequencer", message.msg_type),
        ));
    }
    if session.mode == ConnectionMode::Read && message.msg_type != MessageType::NoOp {
        return Err((
            NackReason::ReadOnlyClient,
            format!("read-mode client cannot submit {}", message.msg_type),
        ));
    }
    if message.contents_len() > max_message_size {
        return Err((
            NackReason::MessageTooLarge,
            format!(
                "contents of {} bytes exceed limit of {max_message_size}",
                message.contents_len()
            ),
        ));
    }
    if message.client_sequence_number <= session.last_client_sequence_number {
        return Err((
            NackReason::InvalidClientSequenceNumber,
            format!(
                "client sequence number {} does not follow {}",
                message.client_sequence_number, session.last_client_sequence_number
            ),
        ));
    }
    let rsn = message.reference_sequence_number;
    if rsn > sequence_number as i64 || (rsn >= 0 && (rsn as u64) < minimum_sequence_number) {
        return Err((
            NackReason::InvalidReferenceSequenceNumber,
            format!(
                "reference sequence number {rsn} outside [{minimum_sequence_number}, {sequence_number}]"
            ),
        ));
    }
    Ok(())
}

/// Orders and rebroadcasts the operations of one document.
pub struct Sequencer {
    doc_id: Uuid,
    config: SequencerConfig,
    state: Mutex<SequencerState>,
    stats: AtomicSequencerStats,
}

impl Sequencer {
    /// Create a sequencer for a new document (virgin state).
    pub fn new(doc_id: Uuid, config: SequencerConfig) -> Self {
        Self::with_state(doc_id, config, &ProtocolState::default())
    }

    pub fn with_defaults(doc_id: Uuid) -> Self {
        Self::new(doc_id, SequencerConfig::default())
    }

    /// Create a sequencer positioned at the protocol state of a summary.
    pub fn from_summary(
        doc_id: Uuid,
        config: SequencerConfig,
        summary: &SummaryTree,
    ) -> Result<Self, SequencerError> {
        let state = ProtocolState::from_summary(summary)?;
        log::info!(
            "Loaded document {doc_id} at sequence {} with {} quorum members",
            state.attributes.sequence_number,
            state.quorum.members.len()
        );
        Ok(Self::with_state(doc_id, config, &state))
    }

    fn with_state(doc_id: Uuid, config: SequencerConfig, state: &ProtocolState) -> Self {
        Self {
            doc_id,
            config,
            state: Mutex::new(SequencerState::from_protocol(state)),
            stats: AtomicSequencerStats::default(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SequencerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a client: bind a fresh identity to a new session and sequence
    /// its `ClientJoin`.
    pub fn join(&self, client: Client) -> Result<SessionHandle, SequencerError> {
        let mut state = self.lock_state();
        if state.sessions.len() >= self.config.max_clients {
            return Err(SequencerError::TooManyClients {
                doc_id: self.doc_id,
                max_clients: self.config.max_clients,
            });
        }

        let client_id = Uuid::new_v4();
        let session = state.next_session;
        let data = to_json_string(&ClientJoin {
            client_id,
            detail: client.clone(),
        })?;

        state.next_session += 1;
        let frames = state.broadcast.add_member(session);
        let seq = state.next_sequence_number();
        state.sessions.insert(
            session,
            Session {
                client_id,
                mode: client.mode,
                last_client_sequence_number: 0,
                reference_sequence_number: seq,
            },
        );
        let msn = state.update_minimum_sequence_number();

        let mut join = SequencedMessage::system(MessageType::ClientJoin, seq, msn);
        join.data = Some(data);
        state.quorum.process(&join)?;
        state.append(join.clone(), self.config.history_limit);
        state.broadcast.broadcast(&[join]);

        self.stats.joins.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Client {client_id} ({}) joined doc {} at {seq}",
            client.user.id,
            self.doc_id
        );

        Ok(SessionHandle {
            session,
            details: ConnectionDetails {
                client_id,
                doc_id: self.doc_id,
                mode: client.mode,
                claims: client,
                join_sequence_number: seq,
                max_message_size: self.config.max_message_size,
            },
            frames,
        })
    }

    /// Validate and sequence a submission made on `session` under the
    /// identity `client_id` the connection currently claims.
    ///
    /// Accepted messages are broadcast to every session as one batch; rejected
    /// ones are nacked to the submitting session only.
    pub fn submit(
        &self,
        session: SessionId,
        client_id: Uuid,
        messages: Vec<DocumentMessage>,
    ) -> Result<SubmitOutcome, SequencerError> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        if !state.sessions.contains_key(&session) {
            return Err(SequencerError::UnknownSession(session));
        }

        let mut batch = Vec::with_capacity(messages.len());
        let mut nacks = Vec::new();
        // Whatever was sequenced is broadcast even if a later message fails,
        // so the history never runs ahead of what sessions have seen.
        let result =
            self.sequence_messages(state, session, client_id, messages, &mut batch, &mut nacks);

        state.broadcast.broadcast(&batch);
        if !nacks.is_empty() {
            state.broadcast.send_to(session, ServerFrame::Nack(nacks.clone()));
        }

        let accepted = batch
            .iter()
            .filter(|m| m.client_id.is_some())
            .count();
        self.stats.sequenced.fetch_add(accepted as u64, Ordering::Relaxed);
        self.stats.nacked.fetch_add(nacks.len() as u64, Ordering::Relaxed);
        result?;
        Ok(SubmitOutcome {
            sequenced: accepted,
            nacked: nacks.len(),
        })
    }

    fn sequence_messages(
        &self,
        state: &mut SequencerState,
        session: SessionId,
        client_id: Uuid,
        messages: Vec<DocumentMessage>,
        batch: &mut Vec<SequencedMessage>,
        nacks: &mut Vec<Nack>,
    ) -> Result<(), SequencerError> {
        for message in messages {
            let Some(bound) = state.sessions.get_mut(&session) else {
                return Err(SequencerError::UnknownSession(session));
            };
            if let Err((reason, text)) = validate(
                bound,
                client_id,
                &message,
                state.sequence_number,
                state.minimum_sequence_number,
                self.config.max_message_size,
            ) {
                log::warn!("Nack {} from {client_id}: {text}", message.msg_type);
                nacks.push(Nack::new(message, state.sequence_number, reason, text));
                continue;
            }

            bound.last_client_sequence_number = message.client_sequence_number;
            if message.reference_sequence_number >= 0 {
                bound.reference_sequence_number = bound
                    .reference_sequence_number
                    .max(message.reference_sequence_number as u64);
            }
            let origin = bound.client_id;

            let seq = state.next_sequence_number();
            let msn = state.update_minimum_sequence_number();
            let sequenced = SequencedMessage::from_client(message, origin, seq, msn);
            log::trace!("Sequenced {} from {origin} at {seq}", sequenced.msg_type);

            state.append(sequenced.clone(), self.config.history_limit);
            let summarize = (sequenced.msg_type == MessageType::Summarize).then(|| sequenced.clone());
            batch.push(sequenced);
            if let Some(summarize) = summarize {
                let response = state.summary_response(&summarize)?;
                state.append(response.clone(), self.config.history_limit);
                batch.push(response);
            }
        }
        Ok(())
    }

    /// Detach a session and sequence its `ClientLeave`.
    pub fn leave(&self, session: SessionId) -> Result<(), SequencerError> {
        let mut state = self.lock_state();
        let removed = state
            .sessions
            .remove(&session)
            .ok_or(SequencerError::UnknownSession(session))?;
        state.broadcast.remove_member(session);

        let data = to_json_string(&removed.client_id)?;
        let seq = state.next_sequence_number();
        let msn = state.update_minimum_sequence_number();
        let mut leave = SequencedMessage::system(MessageType::ClientLeave, seq, msn);
        leave.data = Some(data);
        state.quorum.process(&leave)?;
        state.append(leave.clone(), self.config.history_limit);
        state.broadcast.broadcast(&[leave]);

        self.stats.leaves.fetch_add(1, Ordering::Relaxed);
        log::info!("Client {} left doc {} at {seq}", removed.client_id, self.doc_id);

        if state.sessions.is_empty() && self.config.emit_no_client {
            let seq = state.next_sequence_number();
            let msn = state.update_minimum_sequence_number();
            let no_client = SequencedMessage::system(MessageType::NoClient, seq, msn);
            state.append(no_client, self.config.history_limit);
            log::debug!("Doc {} has no clients at {seq}", self.doc_id);
        }
        Ok(())
    }

    /// Retained messages with `from < sequence_number < to`.
    pub fn deltas(&self, from: u64, to: Option<u64>) -> Vec<SequencedMessage> {
        let state = self.lock_state();
        state
            .history
            .iter()
            .filter(|m| m.sequence_number > from && to.map_or(true, |to| m.sequence_number < to))
            .cloned()
            .collect()
    }

    /// Protocol state as of now.
    pub fn protocol_state(&self) -> ProtocolState {
        let state = self.lock_state();
        ProtocolState {
            attributes: ProtocolAttributes {
                branch: state.branch.clone(),
                minimum_sequence_number: state.minimum_sequence_number,
                sequence_number: state.sequence_number,
            },
            quorum: state.quorum.snapshot(),
        }
    }

    /// Document summary with an empty application subtree.
    pub fn summarize(&self) -> Result<SummaryTree, SequencerError> {
        Ok(SummaryTree::document(SummaryTree::default(), &self.protocol_state())?)
    }

    pub fn quorum(&self) -> Quorum {
        self.lock_state().quorum.clone()
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    pub fn sequence_number(&self) -> u64 {
        self.lock_state().sequence_number
    }

    pub fn minimum_sequence_number(&self) -> u64 {
        self.lock_state().minimum_sequence_number
    }

    pub fn client_count(&self) -> usize {
        self.lock_state().sessions.len()
    }

    pub fn stats(&self) -> SequencerStats {
        let state = self.lock_state();
        SequencerStats {
            sequence_number: state.sequence_number,
            minimum_sequence_number: state.minimum_sequence_number,
            sequenced: self.stats.sequenced.load(Ordering::Relaxed),
            nacked: self.stats.nacked.load(Ordering::Relaxed),
            joins: self.stats.joins.load(Ordering::Relaxed),
            leaves: self.stats.leaves.load(Ordering::Relaxed),
            active_clients: state.sessions.len(),
            broadcast: state.broadcast.stats(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("document {doc_id} already has {max_clients} clients")]
    TooManyClients { doc_id: Uuid, max_clients: usize },
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error(transparent)]
    Quorum(#[from] QuorumError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Summary(#[from] SummaryError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SummaryContent;

    fn drain(frames: &mut FrameReceiver) -> (Vec<SequencedMessage>, Vec<Nack>) {
        let mut ops = Vec::new();
        let mut nacks = Vec::new();
        while let Ok(frame) = frames.try_recv() {
            match frame {
                ServerFrame::Op(messages) => ops.extend(messages),
                ServerFrame::Nack(n) => nacks.extend(n),
                other => panic!("unexpected frame {other:?}"),
            }
        }
        (ops, nacks)
    }

    fn summary_content(handle: &str) -> SummaryContent {
        SummaryContent {
            handle: handle.to_string(),
            head: String::new(),
            message: "test summary".to_string(),
            parents: Vec::new(),
        }
    }

    #[test]
    fn test_config_default() {
        let config = SequencerConfig::default();
        assert_eq!(config.max_clients, 100);
        assert!(config.emit_no_client);
        assert_eq!(config.max_message_size, 16384);
        assert!(config.history_limit.is_none());
    }

    #[test]
    fn test_join_sequences_client_join() {
        let seq = Sequencer::with_defaults(Uuid::new_v4());
        let mut handle = seq.join(Client::new("alice")).unwrap();

        assert_eq!(handle.details.join_sequence_number, 1);
        let (ops, nacks) = drain(&mut handle.frames);
        assert!(nacks.is_empty());
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].msg_type, MessageType::ClientJoin);
        assert!(ops[0].is_system());
        assert_eq!(ops[0].client_join().unwrap().client_id, handle.details.client_id);
        assert!(seq.quorum().has_member(&handle.details.client_id));
    }

    #[test]
    fn test_operation_echoed_to_all() {
        let seq = Sequencer::with_defaults(Uuid::new_v4());
        let mut a = seq.join(Client::new("a")).unwrap();
        let mut b = seq.join(Client::new("b")).unwrap();
        drain(&mut a.frames);
        drain(&mut b.frames);

        let outcome = seq
            .submit(
                a.session,
                a.details.client_id,
                vec![DocumentMessage::operation(1, -1, vec![7])],
            )
            .unwrap();
        assert_eq!(outcome, SubmitOutcome { sequenced: 1, nacked: 0 });

        let (ops_a, _) = drain(&mut a.frames);
        let (ops_b, _) = drain(&mut b.frames);
        assert_eq!(ops_a, ops_b);
        assert_eq!(ops_a[0].sequence_number, 3);
        assert_eq!(ops_a[0].client_id, Some(a.details.client_id));
    }

    #[test]
    fn test_client_generated_join_is_nacked() {
        let seq = Sequencer::with_defaults(Uuid::new_v4());
        let mut a = seq.join(Client::new("a")).unwrap();
        drain(&mut a.frames);

        let forged = DocumentMessage::new(MessageType::ClientJoin, 1, -1).with_data("{}");
        let outcome = seq.submit(a.session, a.details.client_id, vec![forged]).unwrap();
        assert_eq!(outcome.nacked, 1);

        let (ops, nacks) = drain(&mut a.frames);
        assert!(ops.is_empty());
        assert_eq!(nacks[0].reason, NackReason::SystemMessage);
        assert_eq!(seq.sequence_number(), 1);
    }

    #[test]
    fn test_client_generated_leave_is_nacked() {
        let seq = Sequencer::with_defaults(Uuid::new_v4());
        let mut a = seq.join(Client::new("a")).unwrap();
        drain(&mut a.frames);

        let forged = DocumentMessage::new(MessageType::ClientLeave, 1, -1);
        seq.submit(a.session, a.details.client_id, vec![forged]).unwrap();
        let (ops, nacks) = drain(&mut a.frames);
        assert!(ops.is_empty());
        assert_eq!(nacks.len(), 1);
        assert!(seq.quorum().has_member(&a.details.client_id));
    }

    #[test]
    fn test_identity_mismatch_is_nacked() {
        let seq = Sequencer::with_defaults(Uuid::new_v4());
        let mut a = seq.join(Client::new("a")).unwrap();
        let mut b = seq.join(Client::new("b")).unwrap();
        drain(&mut a.frames);
        drain(&mut b.frames);

        // Session A claims B's identity.
        seq.submit(
            a.session,
            b.details.client_id,
            vec![DocumentMessage::new(MessageType::Operation, 1, -1)],
        )
        .unwrap();

        let (ops, nacks) = drain(&mut a.frames);
        assert!(ops.is_empty());
        assert_eq!(nacks[0].reason, NackReason::IdentityMismatch);
        assert_eq!(nacks[0].code, 403);
        // Nacks never reach other sessions.
        assert_eq!(drain(&mut b.frames), (Vec::new(), Vec::new()));
    }

    #[test]
    fn test_read_client_may_only_noop() {
        let seq = Sequencer::with_defaults(Uuid::new_v4());
        let mut r = seq.join(Client::read_only("reader")).unwrap();
        drain(&mut r.frames);

        let outcome = seq
            .submit(
                r.session,
                r.details.client_id,
                vec![
                    DocumentMessage::new(MessageType::Operation, 1, -1),
                    DocumentMessage::new(MessageType::NoOp, 2, -1),
                ],
            )
            .unwrap();
        assert_eq!(outcome, SubmitOutcome { sequenced: 1, nacked: 1 });
        let (_, nacks) = drain(&mut r.frames);
        assert_eq!(nacks[0].reason, NackReason::ReadOnlyClient);
    }

    #[test]
    fn test_client_sequence_number_must_increase() {
        let seq = Sequencer::with_defaults(Uuid::new_v4());
        let mut a = seq.join(Client::new("a")).unwrap();
        drain(&mut a.frames);

        let outcome = seq
            .submit(
                a.session,
                a.details.client_id,
                vec![
                    DocumentMessage::operation(1, -1, vec![]),
                    DocumentMessage::operation(1, -1, vec![]),
                    DocumentMessage::operation(2, -1, vec![]),
                ],
            )
            .unwrap();
        assert_eq!(outcome, SubmitOutcome { sequenced: 2, nacked: 1 });
        let (_, nacks) = drain(&mut a.frames);
        assert_eq!(nacks[0].reason, NackReason::InvalidClientSequenceNumber);
    }

    #[test]
    fn test_reference_ahead_of_stream_is_nacked() {
        let seq = Sequencer::with_defaults(Uuid::new_v4());
        let mut a = seq.join(Client::new("a")).unwrap();
        drain(&mut a.frames);

        seq.submit(
            a.session,
            a.details.client_id,
            vec![DocumentMessage::operation(1, 50, vec![])],
        )
        .unwrap();
        let (_, nacks) = drain(&mut a.frames);
        assert_eq!(nacks[0].reason, NackReason::InvalidReferenceSequenceNumber);
    }

    #[test]
    fn test_oversized_contents_nacked() {
        let config = SequencerConfig {
            max_message_size: 4,
            ..SequencerConfig::default()
        };
        let seq = Sequencer::new(Uuid::new_v4(), config);
        let mut a = seq.join(Client::new("a")).unwrap();
        drain(&mut a.frames);

        seq.submit(
            a.session,
            a.details.client_id,
            vec![DocumentMessage::operation(1, -1, vec![0; 5])],
        )
        .unwrap();
        let (_, nacks) = drain(&mut a.frames);
        assert_eq!(nacks[0].reason, NackReason::MessageTooLarge);
        assert_eq!(nacks[0].code, 413);
    }

    #[test]
    fn test_summarize_is_acked() {
        let seq = Sequencer::with_defaults(Uuid::new_v4());
        let mut a = seq.join(Client::new("a")).unwrap();
        drain(&mut a.frames);

        let summarize = DocumentMessage::summarize(1, 1, &summary_content("handle-1")).unwrap();
        seq.submit(a.session, a.details.client_id, vec![summarize]).unwrap();

        let (ops, _) = drain(&mut a.frames);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].msg_type, MessageType::Summarize);
        assert_eq!(ops[1].msg_type, MessageType::SummaryAck);
        assert!(ops[1].is_system());
        let ack = ops[1].summary_ack().unwrap();
        assert_eq!(ack.handle, "handle-1");
        assert_eq!(ack.summary_proposal.summary_sequence_number, ops[0].sequence_number);
    }

    #[test]
    fn test_invalid_summary_is_nacked_in_stream() {
        let seq = Sequencer::with_defaults(Uuid::new_v4());
        let mut a = seq.join(Client::new("a")).unwrap();
        drain(&mut a.frames);

        let summarize = DocumentMessage::new(MessageType::Summarize, 1, 1);
        seq.submit(a.session, a.details.client_id, vec![summarize]).unwrap();

        let (ops, nacks) = drain(&mut a.frames);
        assert!(nacks.is_empty());
        assert_eq!(ops[1].msg_type, MessageType::SummaryNack);
        assert_eq!(ops[1].summary_proposal().unwrap(), ops[0].sequence_number);
    }

    #[test]
    fn test_stale_summary_is_nacked() {
        let seq = Sequencer::with_defaults(Uuid::new_v4());
        let mut a = seq.join(Client::new("a")).unwrap();
        drain(&mut a.frames);

        let first = DocumentMessage::summarize(1, 1, &summary_content("h1")).unwrap();
        let stale = DocumentMessage::summarize(2, 1, &summary_content("h0")).unwrap();
        seq.submit(a.session, a.details.client_id, vec![first, stale]).unwrap();

        let (ops, _) = drain(&mut a.frames);
        let kinds: Vec<MessageType> = ops.iter().map(|m| m.msg_type).collect();
        assert_eq!(
            kinds,
            vec![
                MessageType::Summarize,
                MessageType::SummaryAck,
                MessageType::Summarize,
                MessageType::SummaryNack
            ]
        );
    }

    #[test]
    fn test_leave_and_no_client() {
        let seq = Sequencer::with_defaults(Uuid::new_v4());
        let a = seq.join(Client::new("a")).unwrap();
        let mut b = seq.join(Client::new("b")).unwrap();
        drain(&mut b.frames);

        seq.leave(a.session).unwrap();
        let (ops, _) = drain(&mut b.frames);
        assert_eq!(ops[0].msg_type, MessageType::ClientLeave);
        assert_eq!(ops[0].client_leave().unwrap(), a.details.client_id);
        assert!(!seq.quorum().has_member(&a.details.client_id));

        seq.leave(b.session).unwrap();
        let history = seq.deltas(0, None);
        assert_eq!(history.last().unwrap().msg_type, MessageType::NoClient);
        assert!(seq.quorum().is_empty());
        assert!(matches!(seq.leave(b.session), Err(SequencerError::UnknownSession(_))));
    }

    #[test]
    fn test_too_many_clients() {
        let config = SequencerConfig {
            max_clients: 1,
            ..SequencerConfig::default()
        };
        let seq = Sequencer::new(Uuid::new_v4(), config);
        let _a = seq.join(Client::new("a")).unwrap();
        assert!(matches!(
            seq.join(Client::new("b")),
            Err(SequencerError::TooManyClients { max_clients: 1, .. })
        ));
    }

    #[test]
    fn test_unknown_session_submit() {
        let seq = Sequencer::with_defaults(Uuid::new_v4());
        assert!(matches!(
            seq.submit(42, Uuid::new_v4(), Vec::new()),
            Err(SequencerError::UnknownSession(42))
        ));
    }

    #[test]
    fn test_minimum_sequence_number_tracks_slowest_client() {
        let seq = Sequencer::with_defaults(Uuid::new_v4());
        let a = seq.join(Client::new("a")).unwrap();
        let b = seq.join(Client::new("b")).unwrap();
        assert_eq!(seq.minimum_sequence_number(), 1);

        for csn in 1..=3 {
            seq.submit(
                b.session,
                b.details.client_id,
                vec![DocumentMessage::operation(csn, 1 + csn as i64, vec![])],
            )
            .unwrap();
        }
        // A has not referenced anything past its join.
        assert_eq!(seq.minimum_sequence_number(), 1);

        seq.submit(
            a.session,
            a.details.client_id,
            vec![DocumentMessage::operation(1, 5, vec![])],
        )
        .unwrap();
        // B last referenced 4.
        assert_eq!(seq.minimum_sequence_number(), 4);
    }

    #[test]
    fn test_deltas_bounds_and_history_limit() {
        let config = SequencerConfig {
            history_limit: Some(3),
            ..SequencerConfig::default()
        };
        let seq = Sequencer::new(Uuid::new_v4(), config);
        let a = seq.join(Client::new("a")).unwrap();
        let ops = (1..=5)
            .map(|csn| DocumentMessage::operation(csn, -1, vec![]))
            .collect();
        seq.submit(a.session, a.details.client_id, ops).unwrap();

        let retained: Vec<u64> = seq.deltas(0, None).iter().map(|m| m.sequence_number).collect();
        assert_eq!(retained, vec![4, 5, 6]);
        let window: Vec<u64> = seq.deltas(4, Some(6)).iter().map(|m| m.sequence_number).collect();
        assert_eq!(window, vec![5]);
    }

    #[test]
    fn test_summary_roundtrip_restores_position() {
        let doc_id = Uuid::new_v4();
        let seq = Sequencer::with_defaults(doc_id);
        let a = seq.join(Client::new("a")).unwrap();
        seq.submit(
            a.session,
            a.details.client_id,
            vec![DocumentMessage::operation(1, 1, vec![])],
        )
        .unwrap();

        let summary = seq.summarize().unwrap();
        let restored = Sequencer::from_summary(doc_id, SequencerConfig::default(), &summary).unwrap();
        assert_eq!(restored.sequence_number(), 2);
        assert!(restored.quorum().has_member(&a.details.client_id));

        let mut b = restored.join(Client::new("b")).unwrap();
        assert_eq!(b.details.join_sequence_number, 3);
        let (ops, _) = drain(&mut b.frames);
        assert_eq!(ops[0].sequence_number, 3);
    }

    #[test]
    fn test_mixed_batch_history_matches_broadcast() {
        let seq = Sequencer::with_defaults(Uuid::new_v4());
        let mut a = seq.join(Client::new("a")).unwrap();
        let mut b = seq.join(Client::new("b")).unwrap();
        drain(&mut a.frames);
        drain(&mut b.frames);

        let outcome = seq
            .submit(
                a.session,
                a.details.client_id,
                vec![
                    DocumentMessage::operation(1, 2, vec![1]),
                    DocumentMessage::summarize(2, 2, &summary_content("h")).unwrap(),
                    DocumentMessage::new(MessageType::ClientJoin, 3, 2),
                    DocumentMessage::operation(4, 2, vec![2]),
                ],
            )
            .unwrap();
        assert_eq!(outcome, SubmitOutcome { sequenced: 3, nacked: 1 });

        let (seen_a, nacks_a) = drain(&mut a.frames);
        let (seen_b, nacks_b) = drain(&mut b.frames);
        assert_eq!(seen_a, seen_b);
        assert_eq!(nacks_a.len(), 1);
        assert!(nacks_b.is_empty());

        let seqs: Vec<u64> = seen_a.iter().map(|m| m.sequence_number).collect();
        assert_eq!(seqs, vec![3, 4, 5, 6]);
        assert_eq!(seq.deltas(2, None), seen_a);
        assert_eq!(seq.sequence_number(), 6);
    }

    #[test]
    fn test_restored_document_nacks_summary_older_than_load_point() {
        let doc_id = Uuid::new_v4();
        let origin = Sequencer::with_defaults(doc_id);
        let a = origin.join(Client::new("a")).unwrap();
        origin
            .submit(
                a.session,
                a.details.client_id,
                vec![DocumentMessage::operation(1, 1, vec![])],
            )
            .unwrap();
        let summary = origin.summarize().unwrap();

        let restored = Sequencer::from_summary(doc_id, SequencerConfig::default(), &summary).unwrap();
        let mut b = restored.join(Client::new("b")).unwrap();
        drain(&mut b.frames);

        let stale = DocumentMessage::summarize(1, -1, &summary_content("stale")).unwrap();
        let fresh = DocumentMessage::summarize(2, 3, &summary_content("fresh")).unwrap();
        restored
            .submit(b.session, b.details.client_id, vec![stale, fresh])
            .unwrap();

        let (ops, _) = drain(&mut b.frames);
        let kinds: Vec<MessageType> = ops.iter().map(|m| m.msg_type).collect();
        assert_eq!(
            kinds,
            vec![
                MessageType::Summarize,
                MessageType::SummaryNack,
                MessageType::Summarize,
                MessageType::SummaryAck
            ]
        );
        assert_eq!(ops[1].summary_proposal().unwrap(), ops[0].sequence_number);
    }

    #[test]
    fn test_restored_proposal_commits_when_msn_passes() {
        let mut quorum = Quorum::new();
        quorum
            .propose("code", serde_json::json!("v1"), 4, None)
            .unwrap();
        let state = ProtocolState {
            attributes: ProtocolAttributes {
                branch: String::new(),
                minimum_sequence_number: 2,
                sequence_number: 5,
            },
            quorum: quorum.snapshot(),
        };
        let summary = SummaryTree::document(SummaryTree::default(), &state).unwrap();
        let seq = Sequencer::from_summary(Uuid::new_v4(), SequencerConfig::default(), &summary)
            .unwrap();
        assert!(seq.quorum().get("code").is_none());

        let _a = seq.join(Client::new("a")).unwrap();
        assert_eq!(seq.minimum_sequence_number(), 6);
        assert_eq!(seq.quorum().get("code"), Some(&serde_json::json!("v1")));
    }

    #[test]
    fn test_virgin_summary_bootstrap() {
        let seq = Sequencer::from_summary(
            Uuid::new_v4(),
            SequencerConfig::default(),
            &SummaryTree::virgin(),
        )
        .unwrap();
        assert_eq!(seq.sequence_number(), 0);
        assert!(seq.quorum().is_empty());
    }

    #[test]
    fn test_stats() {
        let seq = Sequencer::with_defaults(Uuid::new_v4());
        let a = seq.join(Client::new("a")).unwrap();
        seq.submit(
            a.session,
            a.details.client_id,
            vec![
                DocumentMessage::operation(1, -1, vec![]),
                DocumentMessage::new(MessageType::ClientLeave, 2, -1),
            ],
        )
        .unwrap();

        let stats = seq.stats();
        assert_eq!(stats.sequence_number, 2);
        assert_eq!(stats.sequenced, 1);
        assert_eq!(stats.nacked, 1);
        assert_eq!(stats.joins, 1);
        assert_eq!(stats.active_clients, 1);
    }
}
