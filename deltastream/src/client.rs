//! WebSocket transport for [`DeltaConnection`].
//!
//! Opens a socket, performs the `Connect` handshake and then bridges the
//! socket to the connection's channels with one writer and one reader task.
//! The resulting connection behaves exactly like an in-process one.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::connection::{ConnectionError, DeltaConnection};
use crate::protocol::{Client, ClientFrame, ServerFrame};

/// Default time allowed for socket open plus handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to a delta server with the default timeout.
pub async fn connect_ws(
    url: &str,
    doc_id: Uuid,
    client: Client,
) -> Result<DeltaConnection, ConnectionError> {
    connect_ws_with_timeout(url, doc_id, client, DEFAULT_CONNECT_TIMEOUT).await
}

pub async fn connect_ws_with_timeout(
    url: &str,
    doc_id: Uuid,
    client: Client,
    timeout: Duration,
) -> Result<DeltaConnection, ConnectionError> {
    tokio::time::timeout(timeout, connect(url, doc_id, client))
        .await
        .map_err(|_| ConnectionError::Timeout)?
}

async fn connect(
    url: &str,
    doc_id: Uuid,
    client: Client,
) -> Result<DeltaConnection, ConnectionError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| ConnectionError::Transport(e.to_string()))?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let hello = ClientFrame::Connect { doc_id, client }.encode()?;
    ws_writer
        .send(Message::Binary(hello.into()))
        .await
        .map_err(|e| ConnectionError::Transport(e.to_string()))?;

    let details = loop {
        match ws_reader.next().await {
            Some(Ok(Message::Binary(data))) => match ServerFrame::decode(&data)? {
                ServerFrame::Connected(details) => break details,
                ServerFrame::ConnectFailed(reason) => {
                    return Err(ConnectionError::Rejected(reason));
                }
                other => {
                    return Err(ConnectionError::Transport(format!(
                        "unexpected frame during handshake: {other:?}"
                    )));
                }
            },
            Some(Ok(Message::Close(_))) | None => return Err(ConnectionError::ConnectionClosed),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(ConnectionError::Transport(e.to_string())),
        }
    };
    log::info!(
        "Connected to {url} as {} (doc {doc_id}, join seq {})",
        details.client_id,
        details.join_sequence_number
    );

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientFrame>();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<ServerFrame>();

    // Writer task: forward outbound frames; a closed channel means the
    // connection was closed locally.
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let encoded = match frame.encode() {
                Ok(encoded) => encoded,
                Err(e) => {
                    log::error!("Failed to encode frame: {e}");
                    continue;
                }
            };
            if let Err(e) = ws_writer.send(Message::Binary(encoded.into())).await {
                log::error!("WebSocket send failed: {e}");
                return;
            }
        }
        let _ = ws_writer.send(Message::Close(None)).await;
    });

    // Reader task: decode inbound frames for the connection pump.
    tokio::spawn(async move {
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(Message::Binary(data)) => match ServerFrame::decode(&data) {
                    Ok(frame) => {
                        if frame_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Failed to decode server frame: {e}"),
                },
                Ok(Message::Close(_)) => {
                    log::info!("Server closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("WebSocket error: {e}");
                    break;
                }
            }
        }
    });

    Ok(DeltaConnection::open(details, out_tx, frame_rx))
}
