//! WebSocket bus client for joining a relay server.
//!
//! Provides:
//! - Hello/Welcome handshake (the server assigns the full id)
//! - A [`MessageBus`] whose sends become `Frame::Send` on the socket
//! - An [`Inbox`] fed by `Frame::Deliver`, closed when the socket drops

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::bus::{BusError, Inbox, MessageBus};
use crate::protocol::{Envelope, Frame, ParticipantId, ProtocolError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// A participant's connection to a relay server.
pub struct RemoteBus {
    /// Full id assigned by the server
    id: ParticipantId,

    /// Channel to the WebSocket writer task
    outgoing_tx: mpsc::UnboundedSender<Vec<u8>>,

    /// Connection state, updated by the reader task
    state: Arc<RwLock<ConnectionState>>,

    /// Asks the writer task to close the socket
    shutdown: Arc<Notify>,
}

impl RemoteBus {
    /// Connect to `url` as `name`.
    ///
    /// Returns the bus and the inbox envelopes for this participant arrive
    /// in. Spawns background tasks for reading and writing the socket.
    pub async fn connect(url: &str, name: &str) -> Result<(Arc<Self>, Inbox), ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            log::error!("Failed to connect to {url}: {e}");
            ProtocolError::ConnectionClosed
        })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let hello = Frame::Hello {
            name: name.to_string(),
        };
        let hello = hello.encode()?;
        ws_writer
            .send(Message::Binary(hello.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let id = loop {
            match ws_reader.next().await {
                Some(Ok(Message::Binary(data))) => match Frame::decode(&data)? {
                    Frame::Welcome { id } => break id,
                    Frame::Rejected { reason } => return Err(ProtocolError::Rejected(reason)),
                    _ => return Err(ProtocolError::UnexpectedFrame("handshake")),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    return Err(ProtocolError::ConnectionClosed);
                }
                _ => {}
            }
        };
        log::info!("Connected to {url} as {id}");

        let inbox = Inbox::new();
        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let shutdown = Arc::new(Notify::new());
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        // Writer task: forward outgoing frames until shutdown or drop
        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    data = out_rx.recv() => match data {
                        Some(data) => {
                            if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_shutdown.notified() => break,
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: push deliveries into the inbox
        let reader_inbox = inbox.clone();
        let reader_state = state.clone();
        let reader_shutdown = shutdown.clone();
        let reader_id = id.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match Frame::decode(&data) {
                        Ok(Frame::Deliver { envelope }) => {
                            reader_inbox.push(envelope);
                        }
                        Ok(other) => log::debug!("Ignoring unexpected frame {other:?}"),
                        Err(e) => log::warn!("Failed to decode frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *reader_state.write().await = ConnectionState::Disconnected;
            reader_inbox.close();
            reader_shutdown.notify_one();
            log::info!("{reader_id} disconnected from relay");
        });

        let bus = Arc::new(Self {
            id,
            outgoing_tx: out_tx,
            state,
            shutdown,
        });
        Ok((bus, inbox))
    }

    /// Full id assigned by the server.
    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    /// Id of the registry on the server's platform.
    pub fn registry_id(&self) -> ParticipantId {
        ParticipantId::registry(self.id.address.clone())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Close the socket. The server treats this as the participant leaving.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }
}

impl MessageBus for RemoteBus {
    fn send(&self, envelope: Envelope, recipients: &[ParticipantId]) -> Result<usize, BusError> {
        let frame = Frame::Send {
            envelope,
            recipients: recipients.to_vec(),
        };
        let encoded = frame.encode().map_err(|e| BusError::Encode(e.to_string()))?;
        self.outgoing_tx
            .send(encoded)
            .map_err(|_| BusError::Closed)?;
        Ok(recipients.len())
    }

    fn detach(&self, id: &ParticipantId) {
        if *id == self.id {
            self.close();
        }
    }
}
