//! Pending-operation ledger.
//!
//! Wraps delta connections without changing their behavior and counts the
//! acknowledgements each one still expects:
//! ```text
//!            submit ──► +weight ──► inner.submit
//! MonitoredConnection
//!            on_op  ◄── -1 per own echo / summary answer ◄── inner.on_op
//!            on_nack◄── -weight per rejected operation   ◄── inner.on_nack
//! ```
//! A `Summarize` weighs 2: its own echo plus the sequencer's `SummaryAck` or
//! `SummaryNack`. `NoOp` weighs nothing. The [`LedgerManager`] aggregates all
//! ledgers and reports quiescence once every count is zero and every ledger
//! has seen the same latest sequence number.
//!
//! Every hook emits one trace line under `deltastream::ledger`:
//! `ADD/OUT/IN/SEQ/DEL <client> pending=<n> latest=<seq> <kind>`.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::connection::{
    ConnectionError, ConnectionState, DeltaStream, DisconnectReason, Subscription,
};
use crate::protocol::{
    ConnectionDetails, DocumentMessage, MessageType, Nack, SequencedMessage,
};

const TRACE_TARGET: &str = "deltastream::ledger";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Acknowledgements expected for one outbound operation.
fn weight(msg_type: MessageType) -> i64 {
    match msg_type {
        MessageType::NoOp => 0,
        MessageType::Summarize => 2,
        _ => 1,
    }
}

/// Echoes of these kinds never settle pending work.
fn is_uncounted(msg_type: MessageType) -> bool {
    matches!(
        msg_type,
        MessageType::ClientJoin | MessageType::ClientLeave | MessageType::NoOp | MessageType::NoClient
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerPhase {
    /// Transport connect still in progress
    Connecting,
    Connected,
}

#[derive(Debug)]
struct LedgerState {
    phase: LedgerPhase,
    client_id: Option<Uuid>,
    pending_count: i64,
    /// -1 until the first observation or seed
    latest_sequence_number: i64,
    /// Whether this ledger has observed an operation itself
    observed: bool,
    /// Sequence numbers of own `Summarize` echoes awaiting an answer
    summaries_in_flight: Vec<u64>,
    violation: Option<LedgerError>,
}

/// Accounting for one monitored connection.
#[derive(Debug)]
pub struct PendingLedger {
    state: Mutex<LedgerState>,
}

impl PendingLedger {
    fn connecting(seed: i64) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                phase: LedgerPhase::Connecting,
                client_id: None,
                pending_count: 0,
                latest_sequence_number: seed,
                observed: false,
                summaries_in_flight: Vec::new(),
                violation: None,
            }),
        }
    }

    pub fn phase(&self) -> LedgerPhase {
        lock(&self.state).phase
    }

    pub fn client_id(&self) -> Option<Uuid> {
        lock(&self.state).client_id
    }

    pub fn pending_count(&self) -> i64 {
        lock(&self.state).pending_count
    }

    pub fn latest_sequence_number(&self) -> i64 {
        lock(&self.state).latest_sequence_number
    }

    /// The violation that poisoned this ledger, if any.
    pub fn violation(&self) -> Option<LedgerError> {
        lock(&self.state).violation.clone()
    }

    /// True while acknowledgements are outstanding or the connect is still
    /// in progress.
    pub fn has_pending_work(&self) -> Result<bool, LedgerError> {
        let state = lock(&self.state);
        if let Some(violation) = &state.violation {
            return Err(violation.clone());
        }
        Ok(state.phase == LedgerPhase::Connecting || state.pending_count != 0)
    }

    fn attach(&self, client_id: Uuid) {
        let mut state = lock(&self.state);
        state.phase = LedgerPhase::Connected;
        state.client_id = Some(client_id);
        trace(&state, "ADD", "connected");
    }

    /// Count operations about to be submitted. Returns the amount added so a
    /// failed submit can be rolled back.
    fn record_outbound(&self, messages: &[DocumentMessage]) -> i64 {
        let mut state = lock(&self.state);
        let mut added = 0;
        for message in messages {
            let w = weight(message.msg_type);
            state.pending_count += w;
            added += w;
            trace(&state, "OUT", message.msg_type.as_str());
        }
        added
    }

    fn rollback_outbound(&self, added: i64) {
        let mut state = lock(&self.state);
        state.pending_count -= added;
        trace(&state, "OUT", "rollback");
    }

    fn record_inbound(&self, messages: &[SequencedMessage]) {
        let mut state = lock(&self.state);
        if state.violation.is_some() {
            return;
        }
        for message in messages {
            if let Err(violation) = apply_inbound(&mut state, message) {
                log::error!(target: TRACE_TARGET, "Ledger poisoned: {violation}");
                state.violation = Some(violation);
                return;
            }
        }
    }

    /// Record a violation found outside the inbound stream. The first one
    /// sticks.
    fn poison(&self, violation: LedgerError) {
        let mut state = lock(&self.state);
        if state.violation.is_none() {
            log::error!(target: TRACE_TARGET, "Ledger poisoned: {violation}");
            state.violation = Some(violation);
        }
    }

    fn record_nacks(&self, nacks: &[Nack]) {
        let mut state = lock(&self.state);
        if state.violation.is_some() {
            return;
        }
        for nack in nacks {
            state.pending_count -= weight(nack.operation.msg_type);
            trace(&state, "IN", "nack");
            if state.pending_count < 0 {
                let violation = LedgerError::NegativePendingCount {
                    client_id: state.client_id,
                    sequence_number: nack.sequence_number,
                };
                log::error!(target: TRACE_TARGET, "Ledger poisoned: {violation}");
                state.violation = Some(violation);
                return;
            }
        }
    }
}

fn apply_inbound(state: &mut LedgerState, message: &SequencedMessage) -> Result<(), LedgerError> {
    let seq = message.sequence_number as i64;
    if state.observed && seq != state.latest_sequence_number + 1 {
        return Err(LedgerError::SequenceGap {
            client_id: state.client_id,
            expected: state.latest_sequence_number + 1,
            actual: seq,
        });
    }
    state.latest_sequence_number = seq;
    state.observed = true;

    let own = message.client_id.is_some() && message.client_id == state.client_id;
    if own && !is_uncounted(message.msg_type) {
        if message.msg_type == MessageType::Summarize {
            state.summaries_in_flight.push(message.sequence_number);
        }
        state.pending_count -= 1;
        trace(state, "IN", message.msg_type.as_str());
    } else if matches!(
        message.msg_type,
        MessageType::SummaryAck | MessageType::SummaryNack
    ) && message.is_system()
        && settles_own_summary(state, message)
    {
        state.pending_count -= 1;
        trace(state, "IN", message.msg_type.as_str());
    } else {
        trace(state, "SEQ", message.msg_type.as_str());
    }

    if state.pending_count < 0 {
        return Err(LedgerError::NegativePendingCount {
            client_id: state.client_id,
            sequence_number: message.sequence_number,
        });
    }
    Ok(())
}

fn settles_own_summary(state: &mut LedgerState, message: &SequencedMessage) -> bool {
    let Ok(proposal) = message.summary_proposal() else {
        log::warn!(
            target: TRACE_TARGET,
            "Malformed {} at {}",
            message.msg_type,
            message.sequence_number
        );
        return false;
    };
    match state
        .summaries_in_flight
        .iter()
        .position(|seq| *seq == proposal)
    {
        Some(index) => {
            state.summaries_in_flight.swap_remove(index);
            true
        }
        None => false,
    }
}

fn trace(state: &LedgerState, action: &str, kind: &str) {
    let client = state
        .client_id
        .map_or_else(|| "-".to_string(), |id| id.to_string());
    log::debug!(
        target: TRACE_TARGET,
        "{action:<3} {client} pending={} latest={} {kind}",
        state.pending_count,
        state.latest_sequence_number
    );
}

/// Tracks every monitored connection of one client process.
#[derive(Default)]
pub struct LedgerManager {
    ledgers: Mutex<BTreeMap<u64, Arc<PendingLedger>>>,
    next_id: AtomicU64,
}

impl LedgerManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run a transport connect and monitor the resulting connection. The
    /// ledger is registered before the connect starts, so the attempt itself
    /// counts as pending work; a failed connect removes it.
    pub async fn connect<C, Fut>(
        self: &Arc<Self>,
        connect: Fut,
    ) -> Result<MonitoredConnection<C>, ConnectionError>
    where
        C: DeltaStream,
        Fut: Future<Output = Result<C, ConnectionError>>,
    {
        let (id, ledger) = self.register();
        match connect.await {
            Ok(inner) => self.attach(id, ledger, inner),
            Err(e) => {
                log::warn!(target: TRACE_TARGET, "Connect failed: {e}");
                self.remove(id);
                Err(e)
            }
        }
    }

    /// Monitor a connection that is already open.
    pub fn monitor<C: DeltaStream>(
        self: &Arc<Self>,
        inner: C,
    ) -> Result<MonitoredConnection<C>, ConnectionError> {
        let (id, ledger) = self.register();
        self.attach(id, ledger, inner)
    }

    fn register(&self) -> (u64, Arc<PendingLedger>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ledger = Arc::new(PendingLedger::connecting(self.latest_sequence_number()));
        trace(&lock(&ledger.state), "ADD", "connecting");
        lock(&self.ledgers).insert(id, ledger.clone());
        (id, ledger)
    }

    fn attach<C: DeltaStream>(
        self: &Arc<Self>,
        id: u64,
        ledger: Arc<PendingLedger>,
        inner: C,
    ) -> Result<MonitoredConnection<C>, ConnectionError> {
        ledger.attach(inner.client_id());

        // The connection may close on its own. A gap is fatal to the ledger
        // and stays visible; any other close retires the entry.
        let manager = Arc::downgrade(self);
        let closed = ledger.clone();
        inner.on_disconnect(move |reason| match reason {
            DisconnectReason::SequenceGap { expected, actual } => {
                closed.poison(LedgerError::SequenceGap {
                    client_id: closed.client_id(),
                    expected: *expected as i64,
                    actual: *actual as i64,
                });
            }
            _ => {
                if let Some(manager) = manager.upgrade() {
                    manager.remove(id);
                }
            }
        });

        let subscriptions = {
            let on_op = ledger.clone();
            let on_nack = ledger.clone();
            inner
                .on_op(move |ops| on_op.record_inbound(ops))
                .and_then(|ops| {
                    inner
                        .on_nack(move |nacks| on_nack.record_nacks(nacks))
                        .map(|nacks| [ops, nacks])
                })
        };
        match subscriptions {
            Ok(subscriptions) => Ok(MonitoredConnection {
                inner,
                ledger,
                manager: Arc::downgrade(self),
                id,
                subscriptions: Mutex::new(Some(subscriptions)),
            }),
            Err(e) => {
                self.remove(id);
                Err(e)
            }
        }
    }

    fn remove(&self, id: u64) {
        if let Some(ledger) = lock(&self.ledgers).remove(&id) {
            trace(&lock(&ledger.state), "DEL", "removed");
        }
    }

    pub fn ledger_count(&self) -> usize {
        lock(&self.ledgers).len()
    }

    pub fn ledgers(&self) -> Vec<Arc<PendingLedger>> {
        lock(&self.ledgers).values().cloned().collect()
    }

    /// Highest sequence number any ledger has observed, -1 if none.
    pub fn latest_sequence_number(&self) -> i64 {
        lock(&self.ledgers)
            .values()
            .map(|l| l.latest_sequence_number())
            .max()
            .unwrap_or(-1)
    }

    /// True if any ledger has pending work or the ledgers disagree on the
    /// latest sequence number. Errors if any ledger was poisoned.
    pub fn has_pending_work(&self) -> Result<bool, LedgerError> {
        let ledgers = self.ledgers();
        if let Some(violation) = ledgers.iter().find_map(|l| l.violation()) {
            return Err(violation);
        }
        let mut latest = None;
        for ledger in &ledgers {
            if ledger.has_pending_work()? {
                return Ok(true);
            }
            let seq = ledger.latest_sequence_number();
            match latest {
                None => latest = Some(seq),
                Some(prev) if prev != seq => return Ok(true),
                Some(_) => {}
            }
        }
        Ok(false)
    }

    /// Poll until no ledger has pending work.
    pub async fn wait_for_quiescence(
        &self,
        poll: Duration,
        timeout: Duration,
    ) -> Result<(), LedgerError> {
        let wait = async {
            while self.has_pending_work()? {
                tokio::time::sleep(poll).await;
            }
            Ok(())
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::QuiescenceTimeout(timeout)),
        }
    }
}

/// A connection whose traffic is counted by a [`PendingLedger`]. Behaves
/// exactly like the wrapped connection.
pub struct MonitoredConnection<C: DeltaStream> {
    inner: C,
    ledger: Arc<PendingLedger>,
    manager: Weak<LedgerManager>,
    id: u64,
    subscriptions: Mutex<Option<[Subscription; 2]>>,
}

impl<C: DeltaStream> MonitoredConnection<C> {
    pub fn ledger(&self) -> &Arc<PendingLedger> {
        &self.ledger
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    fn detach(&self) {
        if let Some(subscriptions) = lock(&self.subscriptions).take() {
            for subscription in subscriptions {
                subscription.release();
            }
            if let Some(manager) = self.manager.upgrade() {
                manager.remove(self.id);
            }
        }
    }
}

impl<C: DeltaStream> DeltaStream for MonitoredConnection<C> {
    fn client_id(&self) -> Uuid {
        self.inner.client_id()
    }

    fn details(&self) -> ConnectionDetails {
        self.inner.details()
    }

    fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    fn submit(&self, messages: Vec<DocumentMessage>) -> Result<(), ConnectionError> {
        let added = self.ledger.record_outbound(&messages);
        if let Err(e) = self.inner.submit(messages) {
            self.ledger.rollback_outbound(added);
            return Err(e);
        }
        Ok(())
    }

    fn on_op<F>(&self, listener: F) -> Result<Subscription, ConnectionError>
    where
        F: Fn(&[SequencedMessage]) + Send + Sync + 'static,
    {
        self.inner.on_op(listener)
    }

    fn on_nack<F>(&self, listener: F) -> Result<Subscription, ConnectionError>
    where
        F: Fn(&[Nack]) + Send + Sync + 'static,
    {
        self.inner.on_nack(listener)
    }

    fn on_disconnect<F>(&self, listener: F)
    where
        F: FnOnce(&DisconnectReason) + Send + 'static,
    {
        self.inner.on_disconnect(listener)
    }

    fn close(&self) {
        self.inner.close();
        self.detach();
    }
}

impl<C: DeltaStream> Drop for MonitoredConnection<C> {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Ledger invariant violations. Fatal to the ledger that raised them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("pending count of {client_id:?} went negative at sequence number {sequence_number}")]
    NegativePendingCount {
        client_id: Option<Uuid>,
        sequence_number: u64,
    },
    #[error("ledger of {client_id:?} expected sequence number {expected}, got {actual}")]
    SequenceGap {
        client_id: Option<Uuid>,
        expected: i64,
        actual: i64,
    },
    #[error("no quiescence within {0:?}")]
    QuiescenceTimeout(Duration),
}
