//! Wire protocol for the ordered delta stream.
//!
//! Frames exchanged between a delta connection and the sequencing service
//! (bincode-encoded):
//! ```text
//! client ──► service   ClientFrame::Connect { doc_id, client }
//! service ──► client   ServerFrame::Connected(details) | ConnectFailed(reason)
//! client ──► service   ClientFrame::Submit { client_id, messages }
//! service ──► client   ServerFrame::Op([SequencedMessage; n])
//! service ──► client   ServerFrame::Nack([Nack; n])
//! ```
//!
//! System message `data` and summary handshake `contents` are JSON so that
//! they match the document bootstrap format.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Message kinds carried on the delta stream.
///
/// Serialized names are the interoperable wire names and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Application operation
    Operation,
    /// A client joined the document (sequencer only)
    ClientJoin,
    /// A client left the document (sequencer only)
    ClientLeave,
    /// Keep-alive / reference sequence number update
    NoOp,
    /// The last client left the document (sequencer only)
    NoClient,
    /// Client proposes a summary
    Summarize,
    /// Summary accepted (sequencer only)
    SummaryAck,
    /// Summary rejected (sequencer only)
    SummaryNack,
}

impl MessageType {
    pub const ALL: [MessageType; 8] = [
        MessageType::Operation,
        MessageType::ClientJoin,
        MessageType::ClientLeave,
        MessageType::NoOp,
        MessageType::NoClient,
        MessageType::Summarize,
        MessageType::SummaryAck,
        MessageType::SummaryNack,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Operation => "Operation",
            MessageType::ClientJoin => "ClientJoin",
            MessageType::ClientLeave => "ClientLeave",
            MessageType::NoOp => "NoOp",
            MessageType::NoClient => "NoClient",
            MessageType::Summarize => "Summarize",
            MessageType::SummaryAck => "SummaryAck",
            MessageType::SummaryNack => "SummaryNack",
        }
    }

    /// Kinds that only the sequencer may originate. A client submission of
    /// any of these is nacked.
    pub fn is_sequencer_only(self) -> bool {
        matches!(
            self,
            MessageType::ClientJoin
                | MessageType::ClientLeave
                | MessageType::NoClient
                | MessageType::SummaryAck
                | MessageType::SummaryNack
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownMessageType(s.to_string()))
    }
}

/// An operation as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMessage {
    /// Per-session counter, starting at 1 on every fresh connection
    pub client_sequence_number: u64,
    /// Last sequence number observed by the client, -1 if none
    pub reference_sequence_number: i64,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Opaque application payload
    pub contents: Option<Vec<u8>>,
    /// Out-of-band data (JSON) used by system messages
    pub data: Option<String>,
}

impl DocumentMessage {
    pub fn new(
        msg_type: MessageType,
        client_sequence_number: u64,
        reference_sequence_number: i64,
    ) -> Self {
        Self {
            client_sequence_number,
            reference_sequence_number,
            msg_type,
            contents: None,
            data: None,
        }
    }

    /// Create an application operation.
    pub fn operation(
        client_sequence_number: u64,
        reference_sequence_number: i64,
        contents: Vec<u8>,
    ) -> Self {
        Self::new(MessageType::Operation, client_sequence_number, reference_sequence_number)
            .with_contents(contents)
    }

    /// Create a summarize proposal.
    pub fn summarize(
        client_sequence_number: u64,
        reference_sequence_number: i64,
        content: &SummaryContent,
    ) -> Result<Self, ProtocolError> {
        Ok(
            Self::new(MessageType::Summarize, client_sequence_number, reference_sequence_number)
                .with_contents(to_json(content)?),
        )
    }

    pub fn with_contents(mut self, contents: Vec<u8>) -> Self {
        self.contents = Some(contents);
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn contents_len(&self) -> usize {
        self.contents.as_ref().map_or(0, Vec::len)
    }
}

/// An operation after the sequencer has placed it in the total order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedMessage {
    pub sequence_number: u64,
    pub minimum_sequence_number: u64,
    /// Originating session; `None` for sequencer-originated messages
    pub client_id: Option<Uuid>,
    pub client_sequence_number: u64,
    pub reference_sequence_number: i64,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub contents: Option<Vec<u8>>,
    pub data: Option<String>,
    /// Milliseconds since the Unix epoch at sequencing time
    pub timestamp: u64,
}

impl SequencedMessage {
    /// Stamp a client message with its place in the order.
    pub fn from_client(
        message: DocumentMessage,
        client_id: Uuid,
        sequence_number: u64,
        minimum_sequence_number: u64,
    ) -> Self {
        Self {
            sequence_number,
            minimum_sequence_number,
            client_id: Some(client_id),
            client_sequence_number: message.client_sequence_number,
            reference_sequence_number: message.reference_sequence_number,
            msg_type: message.msg_type,
            contents: message.contents,
            data: message.data,
            timestamp: now_millis(),
        }
    }

    /// Create a sequencer-originated message.
    pub fn system(
        msg_type: MessageType,
        sequence_number: u64,
        minimum_sequence_number: u64,
    ) -> Self {
        Self {
            sequence_number,
            minimum_sequence_number,
            client_id: None,
            client_sequence_number: 0,
            reference_sequence_number: -1,
            msg_type,
            contents: None,
            data: None,
            timestamp: now_millis(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.client_id.is_none()
    }

    /// Parse the `data` of a `ClientJoin`.
    pub fn client_join(&self) -> Result<ClientJoin, ProtocolError> {
        self.expect_type(MessageType::ClientJoin)?;
        from_json_str(self.data.as_deref())
    }

    /// Parse the `data` of a `ClientLeave` (the departing client id).
    pub fn client_leave(&self) -> Result<Uuid, ProtocolError> {
        self.expect_type(MessageType::ClientLeave)?;
        from_json_str(self.data.as_deref())
    }

    /// Parse the contents of a `Summarize`.
    pub fn summary_content(&self) -> Result<SummaryContent, ProtocolError> {
        self.expect_type(MessageType::Summarize)?;
        from_json(self.contents.as_deref())
    }

    /// Parse the contents of a `SummaryAck`.
    pub fn summary_ack(&self) -> Result<SummaryAckContent, ProtocolError> {
        self.expect_type(MessageType::SummaryAck)?;
        from_json(self.contents.as_deref())
    }

    /// Parse the contents of a `SummaryNack`.
    pub fn summary_nack(&self) -> Result<SummaryNackContent, ProtocolError> {
        self.expect_type(MessageType::SummaryNack)?;
        from_json(self.contents.as_deref())
    }

    /// Sequence number of the summarize operation a `SummaryAck` or
    /// `SummaryNack` answers.
    pub fn summary_proposal(&self) -> Result<u64, ProtocolError> {
        match self.msg_type {
            MessageType::SummaryAck => {
                Ok(self.summary_ack()?.summary_proposal.summary_sequence_number)
            }
            MessageType::SummaryNack => {
                Ok(self.summary_nack()?.summary_proposal.summary_sequence_number)
            }
            actual => Err(ProtocolError::InvalidMessageType {
                expected: MessageType::SummaryAck,
                actual,
            }),
        }
    }

    fn expect_type(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                actual: self.msg_type,
            });
        }
        Ok(())
    }
}

/// Connection mode negotiated at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub interactive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
}

/// Identity and capability claims a client presents when connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub mode: ConnectionMode,
    pub details: Capabilities,
    pub permission: Vec<String>,
    pub scopes: Vec<String>,
    pub user: User,
}

impl Client {
    /// Interactive write-mode client.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            mode: ConnectionMode::Write,
            details: Capabilities { interactive: true },
            permission: Vec::new(),
            scopes: Vec::new(),
            user: User { id: user_id.into() },
        }
    }

    /// Interactive read-mode client.
    pub fn read_only(user_id: impl Into<String>) -> Self {
        Self {
            mode: ConnectionMode::Read,
            ..Self::new(user_id)
        }
    }
}

/// Quorum member value: claims plus the sequence number of the join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedClient {
    pub client: Client,
    pub sequence_number: u64,
}

/// A joined client as recorded by the quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    pub client_id: Uuid,
    pub client: Client,
    pub sequence_number: u64,
}

impl ClientRecord {
    pub fn mode(&self) -> ConnectionMode {
        self.client.mode
    }

    pub fn sequenced(&self) -> SequencedClient {
        SequencedClient {
            client: self.client.clone(),
            sequence_number: self.sequence_number,
        }
    }
}

/// `data` of a `ClientJoin` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientJoin {
    pub client_id: Uuid,
    pub detail: Client,
}

/// What the service tells a client once its connection is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    pub client_id: Uuid,
    pub doc_id: Uuid,
    pub mode: ConnectionMode,
    pub claims: Client,
    /// Sequence number of this client's own `ClientJoin`
    pub join_sequence_number: u64,
    pub max_message_size: usize,
}

/// Why a submission was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NackReason {
    /// Kind may only be originated by the sequencer
    SystemMessage,
    /// Submission identity differs from the identity bound at connect
    IdentityMismatch,
    /// Read-mode connections may only send `NoOp`
    ReadOnlyClient,
    /// Client sequence numbers must increase on every accepted submission
    InvalidClientSequenceNumber,
    /// Reference sequence number outside `[msn, current]`
    InvalidReferenceSequenceNumber,
    /// Contents exceed the negotiated maximum
    MessageTooLarge,
}

impl NackReason {
    pub fn code(self) -> u16 {
        match self {
            NackReason::IdentityMismatch | NackReason::ReadOnlyClient => 403,
            NackReason::MessageTooLarge => 413,
            _ => 400,
        }
    }
}

/// Rejection notice returned to the submitter only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nack {
    /// The rejected operation, as submitted
    pub operation: DocumentMessage,
    /// Current sequence number at rejection time
    pub sequence_number: u64,
    pub code: u16,
    pub reason: NackReason,
    pub message: String,
}

impl Nack {
    pub fn new(
        operation: DocumentMessage,
        sequence_number: u64,
        reason: NackReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            sequence_number,
            code: reason.code(),
            reason,
            message: message.into(),
        }
    }
}

/// Contents of a `Summarize` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryContent {
    pub handle: String,
    pub head: String,
    pub message: String,
    pub parents: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryProposal {
    pub summary_sequence_number: u64,
}

/// Contents of a `SummaryAck`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryAckContent {
    pub handle: String,
    pub summary_proposal: SummaryProposal,
}

/// Contents of a `SummaryNack`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryNackContent {
    pub message: String,
    pub summary_proposal: SummaryProposal,
}

/// Frames sent from a connection to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// First frame on a transport: ask to join a document
    Connect { doc_id: Uuid, client: Client },
    /// Submit operations under the identity the connection currently holds
    Submit {
        client_id: Uuid,
        messages: Vec<DocumentMessage>,
    },
}

/// Frames sent from the service to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Connected(ConnectionDetails),
    ConnectFailed(String),
    Op(Vec<SequencedMessage>),
    Nack(Vec<Nack>),
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(frame, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(frame)
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

pub(crate) fn to_json_string<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(value).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn from_json<T: DeserializeOwned>(bytes: Option<&[u8]>) -> Result<T, ProtocolError> {
    let bytes = bytes.ok_or(ProtocolError::MissingPayload)?;
    serde_json::from_slice(bytes).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
}

fn from_json_str<T: DeserializeOwned>(data: Option<&str>) -> Result<T, ProtocolError> {
    from_json(data.map(str::as_bytes))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type: expected {expected}, got {actual}")]
    InvalidMessageType {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("Message has no payload")]
    MissingPayload,
}
