//! WebSocket delta server with per-document sequencers.
//!
//! ```text
//! Client A ──┐  Connect{doc_id}           ┌── Sequencer(doc 1) ── BroadcastGroup
//!            ├──────────────────► server ─┤
//! Client B ──┘  Submit{client_id, ops}    └── Sequencer(doc 2) ── BroadcastGroup
//! ```
//!
//! The first frame on every socket must be `ClientFrame::Connect`; it is
//! answered with `Connected(details)` or `ConnectFailed(reason)`. After that
//! the socket carries `Submit` frames in and `Op`/`Nack` frames out.
//! Documents stay resident after their last client leaves so the sequence
//! and catch-up history survive reconnects.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{ClientFrame, ServerFrame};
use crate::sequencer::{Sequencer, SequencerConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Configuration for every document sequencer
    pub sequencer: SequencerConfig,
    /// Time allowed for the `Connect` frame after the socket opens
    pub connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7070".to_string(),
            sequencer: SequencerConfig::default(),
            connect_timeout_secs: 5,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub active_documents: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    active_documents: AtomicUsize,
}

impl AtomicServerStats {
    fn record_in(&self, bytes: usize) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_out(&self, bytes: usize) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

type Documents = Arc<RwLock<HashMap<Uuid, Arc<Sequencer>>>>;

/// The delta server.
pub struct DeltaServer {
    config: ServerConfig,
    documents: Documents,
    stats: Arc<AtomicServerStats>,
}

impl DeltaServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            documents: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Delta server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let documents = self.documents.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, documents, stats, config).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        documents: Documents,
        stats: Arc<AtomicServerStats>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        stats.total_connections.fetch_add(1, Ordering::Relaxed);

        // Handshake: the first binary frame must be Connect.
        let handshake = tokio::time::timeout(
            Duration::from_secs(config.connect_timeout_secs),
            async {
                while let Some(msg) = ws_receiver.next().await {
                    match msg? {
                        Message::Binary(data) => {
                            stats.record_in(data.len());
                            return Ok(Some(ClientFrame::decode(&data)?));
                        }
                        Message::Close(_) => return Ok(None),
                        _ => {}
                    }
                }
                Ok::<Option<ClientFrame>, BoxError>(None)
            },
        )
        .await;

        let (doc_id, client) = match handshake {
            Ok(Ok(Some(ClientFrame::Connect { doc_id, client }))) => (doc_id, client),
            Ok(Ok(Some(ClientFrame::Submit { .. }))) => {
                return Self::reject(&mut ws_sender, &stats, addr, "expected Connect frame").await;
            }
            Ok(Ok(None)) => {
                log::info!("Connection closed from {addr} before handshake");
                return Ok(());
            }
            Ok(Err(e)) => {
                return Self::reject(&mut ws_sender, &stats, addr, &e.to_string()).await;
            }
            Err(_) => {
                return Self::reject(&mut ws_sender, &stats, addr, "handshake timed out").await;
            }
        };

        let sequencer = Self::document(&documents, &stats, &config, doc_id).await;
        let mut handle = match sequencer.join(client) {
            Ok(handle) => handle,
            Err(e) => return Self::reject(&mut ws_sender, &stats, addr, &e.to_string()).await,
        };
        let session = handle.session;
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Client {} joined doc {doc_id} from {addr}",
            handle.details.client_id
        );

        let result: Result<(), BoxError> = async {
            let connected = ServerFrame::Connected(handle.details.clone()).encode()?;
            stats.record_out(connected.len());
            ws_sender.send(Message::Binary(connected.into())).await?;

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                stats.record_in(data.len());
                                match ClientFrame::decode(&data) {
                                    Ok(ClientFrame::Submit { client_id, messages }) => {
                                        log::trace!("Submit of {} ops from {addr}", messages.len());
                                        sequencer.submit(session, client_id, messages)?;
                                    }
                                    Ok(ClientFrame::Connect { .. }) => {
                                        log::warn!("Ignoring repeated Connect from {addr}");
                                    }
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }

                    frame = handle.frames.recv() => {
                        let Some(frame) = frame else { break };
                        let encoded = frame.encode()?;
                        stats.record_out(encoded.len());
                        ws_sender.send(Message::Binary(encoded.into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = sequencer.leave(session) {
            log::debug!("Leave for session {session}: {e}");
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn reject(
        ws_sender: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
        stats: &AtomicServerStats,
        addr: SocketAddr,
        reason: &str,
    ) -> Result<(), BoxError> {
        log::warn!("Rejecting connection from {addr}: {reason}");
        stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
        let frame = ServerFrame::ConnectFailed(reason.to_string()).encode()?;
        stats.record_out(frame.len());
        ws_sender.send(Message::Binary(frame.into())).await?;
        ws_sender.send(Message::Close(None)).await?;
        Ok(())
    }

    /// Get or create the sequencer for a document.
    async fn document(
        documents: &Documents,
        stats: &AtomicServerStats,
        config: &ServerConfig,
        doc_id: Uuid,
    ) -> Arc<Sequencer> {
        if let Some(sequencer) = documents.read().await.get(&doc_id) {
            return sequencer.clone();
        }
        let mut documents = documents.write().await;
        let sequencer = documents
            .entry(doc_id)
            .or_insert_with(|| {
                log::info!("Opening document {doc_id}");
                Arc::new(Sequencer::new(doc_id, config.sequencer.clone()))
            })
            .clone();
        stats.active_documents.store(documents.len(), Ordering::Relaxed);
        sequencer
    }

    /// Host a document restored elsewhere, e.g. from a summary.
    pub async fn insert_document(&self, sequencer: Sequencer) -> Arc<Sequencer> {
        let sequencer = Arc::new(sequencer);
        let mut documents = self.documents.write().await;
        documents.insert(sequencer.doc_id(), sequencer.clone());
        self.stats
            .active_documents
            .store(documents.len(), Ordering::Relaxed);
        sequencer
    }

    /// The sequencer hosting `doc_id`, if the document is open.
    pub async fn sequencer(&self, doc_id: Uuid) -> Option<Arc<Sequencer>> {
        self.documents.read().await.get(&doc_id).cloned()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
            frames_in: self.stats.frames_in.load(Ordering::Relaxed),
            frames_out: self.stats.frames_out.load(Ordering::Relaxed),
            bytes_in: self.stats.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.stats.bytes_out.load(Ordering::Relaxed),
            active_documents: self.stats.active_documents.load(Ordering::Relaxed),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
