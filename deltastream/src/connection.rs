//! Client-side delta connection.
//!
//! A connection owns two channels to its transport:
//! ```text
//!            submit()                      ┌───────────────┐
//! app ──────────────────► outbound ──────► │   transport   │ ──► Sequencer
//!                                          │ (local / ws)  │
//! app ◄── op / nack ◄── pump task ◄─ frames└───────────────┘ ◄── Sequencer
//! ```
//! The pump task delivers frames to listeners strictly in arrival order and
//! checks that sequence numbers are gapless. Frames that arrive before the
//! first listener subscribes are held and replayed to it, so nothing sent
//! between connect and subscribe is lost.
//!
//! State machine: `Connecting → Open → Closed`. Nothing leaves `Closed`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::FrameReceiver;
use crate::protocol::{
    Client, ClientFrame, ConnectionDetails, DocumentMessage, Nack, ProtocolError,
    SequencedMessage, ServerFrame,
};
use crate::sequencer::{Sequencer, SequencerError};

/// Connection lifecycle state.
///
/// A [`DeltaConnection`] is only built once its transport handshake has
/// succeeded, so callers see `Open` and `Closed`. `Connecting` covers the
/// window while `DeltaConnection::open` wires the delivery task; pending
/// connect attempts are tracked by the ledger's
/// [`LedgerPhase`](crate::ledger::LedgerPhase).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Why a connection moved to `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `close()` was called
    Closed,
    Dropped,
    /// The transport stopped delivering frames
    TransportClosed,
    /// A delivered batch skipped sequence numbers
    SequenceGap { expected: u64, actual: u64 },
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Closed => write!(f, "closed by client"),
            DisconnectReason::Dropped => write!(f, "dropped"),
            DisconnectReason::TransportClosed => write!(f, "transport closed"),
            DisconnectReason::SequenceGap { expected, actual } => {
                write!(f, "sequence gap: expected {expected}, got {actual}")
            }
        }
    }
}

/// Capability interface shared by connections and anything wrapping one.
pub trait DeltaStream: Send + Sync {
    fn client_id(&self) -> Uuid;

    fn details(&self) -> ConnectionDetails;

    fn state(&self) -> ConnectionState;

    /// Enqueue operations for the sequencer. Never blocks; delivery order
    /// equals call order.
    fn submit(&self, messages: Vec<DocumentMessage>) -> Result<(), ConnectionError>;

    /// Listen for batches of sequenced operations.
    fn on_op<F>(&self, listener: F) -> Result<Subscription, ConnectionError>
    where
        F: Fn(&[SequencedMessage]) + Send + Sync + 'static;

    /// Listen for rejections of this connection's submissions.
    fn on_nack<F>(&self, listener: F) -> Result<Subscription, ConnectionError>
    where
        F: Fn(&[Nack]) + Send + Sync + 'static;

    /// Register a callback fired once when the connection closes, with the
    /// reason. Fires immediately if it is already closed.
    fn on_disconnect<F>(&self, listener: F)
    where
        F: FnOnce(&DisconnectReason) + Send + 'static;

    /// Terminate the session. Idempotent.
    fn close(&self);
}

/// Handle for a registered listener. Released explicitly with
/// [`Subscription::release`] or when dropped.
#[must_use = "dropping a subscription releases its listener"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap the action that unregisters a listener.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

type Listener<E> = Arc<dyn Fn(&[E]) + Send + Sync>;

struct ListenerSet<E> {
    next_id: u64,
    entries: Vec<(u64, Listener<E>)>,
    backlog: Vec<Vec<E>>,
}

/// Ordered listener registry with a backlog for events that arrive before
/// anyone listens. Listeners must not subscribe from inside a callback.
struct Listeners<E> {
    /// Serializes dispatch and backlog replay
    dispatch: Mutex<()>,
    set: Mutex<ListenerSet<E>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<E: Clone + Send + 'static> Listeners<E> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            dispatch: Mutex::new(()),
            set: Mutex::new(ListenerSet {
                next_id: 0,
                entries: Vec::new(),
                backlog: Vec::new(),
            }),
        })
    }

    fn subscribe(self: &Arc<Self>, listener: Listener<E>) -> Subscription {
        let _turn = lock(&self.dispatch);
        let (id, backlog) = {
            let mut set = lock(&self.set);
            let id = set.next_id;
            set.next_id += 1;
            set.entries.push((id, listener.clone()));
            (id, std::mem::take(&mut set.backlog))
        };
        for batch in backlog {
            listener(&batch);
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(listeners) = weak.upgrade() {
                lock(&listeners.set).entries.retain(|(entry, _)| *entry != id);
            }
        })
    }

    fn emit(&self, batch: &[E]) {
        let _turn = lock(&self.dispatch);
        let listeners: Vec<Listener<E>> = {
            let mut set = lock(&self.set);
            if set.entries.is_empty() {
                set.backlog.push(batch.to_vec());
                return;
            }
            set.entries.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in listeners {
            listener(batch);
        }
    }

    fn clear(&self) {
        let mut set = lock(&self.set);
        set.entries.clear();
        set.backlog.clear();
    }
}

struct ConnectionInner {
    details: RwLock<ConnectionDetails>,
    state: Mutex<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    op_listeners: Arc<Listeners<SequencedMessage>>,
    nack_listeners: Arc<Listeners<Nack>>,
    disconnect_listeners: Mutex<Vec<Box<dyn FnOnce(&DisconnectReason) + Send>>>,
    close_reason: Mutex<Option<DisconnectReason>>,
    /// Last delivered sequence number (0 = nothing yet)
    last_delivered: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionInner {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn client_id(&self) -> Uuid {
        self.details
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .client_id
    }

    /// Verify a batch continues the stream without gaps.
    fn check_order(&self, messages: &[SequencedMessage]) -> Result<(), DisconnectReason> {
        for message in messages {
            let last = self.last_delivered.load(Ordering::Acquire);
            if last != 0 && message.sequence_number != last + 1 {
                return Err(DisconnectReason::SequenceGap {
                    expected: last + 1,
                    actual: message.sequence_number,
                });
            }
            self.last_delivered
                .store(message.sequence_number, Ordering::Release);
        }
        Ok(())
    }

    /// Move to `Closed` and release everything. Returns false if already closed.
    fn shutdown(&self, reason: DisconnectReason) -> bool {
        {
            let mut state = lock(&self.state);
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Closed;
        }
        log::info!("Connection {} closed: {reason}", self.client_id());

        // Dropping the sender ends the transport writer, which detaches the
        // session from the sequencer.
        lock(&self.outbound).take();
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        self.op_listeners.clear();
        self.nack_listeners.clear();

        *lock(&self.close_reason) = Some(reason.clone());
        let listeners = std::mem::take(&mut *lock(&self.disconnect_listeners));
        for listener in listeners {
            listener(&reason);
        }
        true
    }
}

/// A client session on the ordered delta stream.
pub struct DeltaConnection {
    inner: Arc<ConnectionInner>,
}

impl DeltaConnection {
    /// Wire a connection to its transport channels and start delivering
    /// frames.
    pub(crate) fn open(
        details: ConnectionDetails,
        outbound: mpsc::UnboundedSender<ClientFrame>,
        frames: FrameReceiver,
    ) -> Self {
        let inner = Arc::new(ConnectionInner {
            details: RwLock::new(details),
            state: Mutex::new(ConnectionState::Connecting),
            outbound: Mutex::new(Some(outbound)),
            op_listeners: Listeners::new(),
            nack_listeners: Listeners::new(),
            disconnect_listeners: Mutex::new(Vec::new()),
            close_reason: Mutex::new(None),
            last_delivered: AtomicU64::new(0),
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(Self::pump(inner.clone(), frames));
        *lock(&inner.pump) = Some(pump);
        *lock(&inner.state) = ConnectionState::Open;
        log::info!("Connection {} open", inner.client_id());
        Self { inner }
    }

    async fn pump(inner: Arc<ConnectionInner>, mut frames: FrameReceiver) {
        while let Some(frame) = frames.recv().await {
            if inner.state() == ConnectionState::Closed {
                return;
            }
            match frame {
                ServerFrame::Op(messages) => {
                    if let Err(gap) = inner.check_order(&messages) {
                        log::error!("Connection {}: {gap}", inner.client_id());
                        inner.shutdown(gap);
                        return;
                    }
                    log::trace!(
                        "Connection {} received {} ops",
                        inner.client_id(),
                        messages.len()
                    );
                    inner.op_listeners.emit(&messages);
                }
                ServerFrame::Nack(nacks) => {
                    log::debug!(
                        "Connection {} received {} nacks",
                        inner.client_id(),
                        nacks.len()
                    );
                    inner.nack_listeners.emit(&nacks);
                }
                ServerFrame::Connected(_) | ServerFrame::ConnectFailed(_) => {
                    log::warn!(
                        "Connection {}: unexpected handshake frame",
                        inner.client_id()
                    );
                }
            }
        }
        inner.shutdown(DisconnectReason::TransportClosed);
    }

    /// Attach to an in-process sequencer.
    pub async fn connect_local(
        sequencer: Arc<Sequencer>,
        client: Client,
    ) -> Result<Self, ConnectionError> {
        let handle = sequencer.join(client)?;
        let session = handle.session;
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    ClientFrame::Submit {
                        client_id,
                        messages,
                    } => {
                        if let Err(e) = sequencer.submit(session, client_id, messages) {
                            log::error!("Submit on session {session} failed: {e}");
                            break;
                        }
                    }
                    ClientFrame::Connect { .. } => {
                        log::warn!("Ignoring Connect on open session {session}");
                    }
                }
            }
            if let Err(e) = sequencer.leave(session) {
                log::debug!("Leave for session {session}: {e}");
            }
        });

        Ok(Self::open(handle.details, outbound_tx, handle.frames))
    }

    /// Replace the client id this connection presents on submissions.
    ///
    /// The sequencer validates every submission against the identity bound
    /// at connect time, so submissions made after an override are nacked.
    pub fn override_client_id(&self, client_id: Uuid) {
        self.inner
            .details
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .client_id = client_id;
    }

    /// Highest sequence number delivered so far (0 if none).
    pub fn last_sequence_number(&self) -> u64 {
        self.inner.last_delivered.load(Ordering::Acquire)
    }
}

impl DeltaStream for DeltaConnection {
    fn client_id(&self) -> Uuid {
        self.inner.client_id()
    }

    fn details(&self) -> ConnectionDetails {
        self.inner
            .details
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    fn submit(&self, messages: Vec<DocumentMessage>) -> Result<(), ConnectionError> {
        if self.inner.state() != ConnectionState::Open {
            return Err(ConnectionError::ConnectionClosed);
        }
        let frame = ClientFrame::Submit {
            client_id: self.inner.client_id(),
            messages,
        };
        lock(&self.inner.outbound)
            .as_ref()
            .ok_or(ConnectionError::ConnectionClosed)?
            .send(frame)
            .map_err(|_| ConnectionError::ConnectionClosed)
    }

    fn on_op<F>(&self, listener: F) -> Result<Subscription, ConnectionError>
    where
        F: Fn(&[SequencedMessage]) + Send + Sync + 'static,
    {
        if self.inner.state() != ConnectionState::Open {
            return Err(ConnectionError::ConnectionClosed);
        }
        Ok(self.inner.op_listeners.subscribe(Arc::new(listener)))
    }

    fn on_nack<F>(&self, listener: F) -> Result<Subscription, ConnectionError>
    where
        F: Fn(&[Nack]) + Send + Sync + 'static,
    {
        if self.inner.state() != ConnectionState::Open {
            return Err(ConnectionError::ConnectionClosed);
        }
        Ok(self.inner.nack_listeners.subscribe(Arc::new(listener)))
    }

    fn on_disconnect<F>(&self, listener: F)
    where
        F: FnOnce(&DisconnectReason) + Send + 'static,
    {
        let mut listeners = lock(&self.inner.disconnect_listeners);
        let closed = lock(&self.inner.close_reason).clone();
        match closed {
            Some(reason) => {
                drop(listeners);
                listener(&reason);
            }
            None => listeners.push(Box::new(listener)),
        }
    }

    fn close(&self) {
        self.inner.shutdown(DisconnectReason::Closed);
    }
}

impl Drop for DeltaConnection {
    fn drop(&mut self) {
        self.inner.shutdown(DisconnectReason::Dropped);
    }
}

/// Connection and transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection rejected: {0}")]
    Rejected(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Connection timeout")]
    Timeout,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<SequencerError> for ConnectionError {
    fn from(e: SequencerError) -> Self {
        ConnectionError::Rejected(e.to_string())
    }
}
