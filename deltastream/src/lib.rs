//! # deltastream — Ordered operation delivery for collaborative documents
//!
//! A per-document sequencer assigns every client operation a gapless,
//! monotonically increasing sequence number and broadcasts the result to
//! every connected client in one total order.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐  submit  ┌─────────────┐  Op / Nack  ┌─────────────────┐
//! │ MonitoredConnection │  ──────► │  Sequencer  │ ──────────► │ DeltaConnection │
//! │   (PendingLedger)   │  ◄────── │   + Quorum  │             │  (every client) │
//! └──────────┬──────────┘    op    └──────┬──────┘             └─────────────────┘
//!            │                            │
//!            ▼                            ▼
//!      LedgerManager               BroadcastGroup
//!      (quiescence)                   (fan-out)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Message types, nacks and bincode transport frames
//! - [`quorum`] — Replicated membership with proposals and committed values
//! - [`summary`] — Summary trees carrying the protocol state
//! - [`broadcast`] — Per-document ordered fan-out
//! - [`sequencer`] — Validation, ordering and the summary handshake
//! - [`connection`] — Client sessions and listener registration
//! - [`ledger`] — Pending-operation accounting and quiescence
//! - [`server`] — WebSocket server hosting one sequencer per document
//! - [`client`] — WebSocket transport for connections

pub mod protocol;
pub mod quorum;
pub mod summary;
pub mod broadcast;
pub mod sequencer;
pub mod connection;
pub mod ledger;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    Client, ClientFrame, ConnectionDetails, ConnectionMode, DocumentMessage, MessageType, Nack,
    NackReason, ProtocolError, SequencedMessage, ServerFrame, SummaryContent,
};
pub use quorum::{Quorum, QuorumChange, QuorumError};
pub use summary::{ProtocolState, SummaryError, SummaryTree};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use sequencer::{Sequencer, SequencerConfig, SequencerError, SequencerStats};
pub use connection::{
    ConnectionError, ConnectionState, DeltaConnection, DeltaStream, DisconnectReason, Subscription,
};
pub use ledger::{LedgerError, LedgerManager, MonitoredConnection, PendingLedger};
pub use server::{DeltaServer, ServerConfig, ServerStats};
pub use client::{connect_ws, connect_ws_with_timeout};
