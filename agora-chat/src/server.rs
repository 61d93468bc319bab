//! WebSocket relay server hosting the presence registry.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── Inbox(A) ──► Deliver ──► Client A
//!            ├── Send ──► LocalBus ─┼── Inbox(B) ──► Deliver ──► Client B
//! Client B ──┘              │       └── Inbox(manager)
//!                           │              │
//!                     disconnect()    RegistryAgent
//!                           │              ▲
//!                           └── liveness ──┘
//! ```
//!
//! Every connection becomes a participant on the hub bus. A closed socket
//! disconnects the participant, which the registry treats as a leave.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::bus::{BusError, Inbox, LocalBus, MessageBus, MessageFilter};
use crate::protocol::{Frame, ParticipantId, ProtocolError};
use crate::registry::RegistryAgent;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Platform name; the address part of every participant id
    pub platform: String,
    /// Maximum participants in the room
    pub max_participants: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            platform: "agora".to_string(),
            max_participants: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub frames_routed: u64,
}

/// A participant's place on the hub, released when dropped.
///
/// Dropping it disconnects the participant, which is how the registry
/// learns they are gone.
struct Admission {
    hub: Arc<LocalBus>,
    id: ParticipantId,
}

impl Admission {
    fn id(&self) -> &ParticipantId {
        &self.id
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if self.hub.disconnect(&self.id) {
            log::info!("{} disconnected", self.id);
        }
    }
}

/// Validate `id` and connect it to `hub`, refusing duplicates and a full
/// room. The error is the reason sent back to the client.
fn admit(
    hub: &Arc<LocalBus>,
    id: &ParticipantId,
    max_participants: usize,
) -> Result<(Admission, Inbox), String> {
    id.validate().map_err(|e| e.to_string())?;
    let inbox = hub
        .connect_bounded(id.clone(), max_participants)
        .map_err(|e| match e {
            BusError::Full(_) => "room is full".to_string(),
            other => other.to_string(),
        })?;
    let admission = Admission {
        hub: hub.clone(),
        id: id.clone(),
    };
    Ok((admission, inbox))
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    /// Bus every connection and the registry are attached to
    hub: Arc<LocalBus>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(LocalBus::new(config.platform.clone()));
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Start the registry and accept connections on `listener`.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let registry = RegistryAgent::attach(&self.hub)?;
        log::info!(
            "Relay listening on {} (registry {})",
            listener.local_addr()?,
            registry.id()
        );
        registry.spawn();

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<LocalBus>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = async {
            let Some((admission, inbox)) =
                Self::handshake(&mut ws_sender, &mut ws_receiver, &hub, &stats, &config).await?
            else {
                return Ok(());
            };
            log::debug!("{} connected from {addr}", admission.id());

            Self::route(
                &mut ws_sender,
                &mut ws_receiver,
                admission.id(),
                &inbox,
                &hub,
                &stats,
            )
            .await
        }
        .await;

        stats.write().await.active_connections -= 1;
        result
    }

    /// Read `Hello`, admit the participant and answer `Welcome`.
    ///
    /// Returns `None` if the handshake was refused. The participant stays
    /// on the hub only as long as the returned [`Admission`] lives.
    async fn handshake(
        ws_sender: &mut WsSender,
        ws_receiver: &mut WsReceiver,
        hub: &Arc<LocalBus>,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
    ) -> Result<Option<(Admission, Inbox)>, BoxError> {
        let name = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => match Frame::decode(&data)? {
                    Frame::Hello { name } => break name,
                    _ => return Err(ProtocolError::UnexpectedFrame("handshake").into()),
                },
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                _ => {}
            }
        };

        let id = ParticipantId::new(name, config.platform.clone());
        match admit(hub, &id, config.max_participants) {
            Ok((admission, inbox)) => {
                // A failed Welcome drops the admission and frees the name.
                let welcome = Frame::Welcome { id: id.clone() }.encode()?;
                ws_sender.send(Message::Binary(welcome.into())).await?;
                log::info!("{id} joined the relay");
                Ok(Some((admission, inbox)))
            }
            Err(reason) => {
                log::warn!("Rejected {id}: {reason}");
                stats.write().await.rejected_handshakes += 1;
                let rejected = Frame::Rejected { reason }.encode()?;
                ws_sender.send(Message::Binary(rejected.into())).await?;
                let _ = ws_sender.send(Message::Close(None)).await;
                Ok(None)
            }
        }
    }

    /// Shuttle frames between the socket and the participant's inbox until
    /// either side closes.
    async fn route(
        ws_sender: &mut WsSender,
        ws_receiver: &mut WsReceiver,
        id: &ParticipantId,
        inbox: &Inbox,
        hub: &LocalBus,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), BoxError> {
        let filter = MessageFilter::any();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => match Frame::decode(&data) {
                        Ok(Frame::Send {
                            mut envelope,
                            recipients,
                        }) => {
                            if envelope.sender != *id {
                                log::warn!("{id} sent as {}; rewriting sender", envelope.sender);
                                envelope.sender = id.clone();
                            }
                            hub.send(envelope, &recipients)?;
                            stats.write().await.frames_routed += 1;
                        }
                        Ok(other) => log::warn!("Unexpected frame from {id}: {other:?}"),
                        Err(e) => log::warn!("Failed to decode frame from {id}: {e}"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {id}: {e}");
                        break;
                    }
                    _ => {}
                },

                // Envelope addressed to this participant
                envelope = inbox.recv(&filter) => match envelope {
                    Some(envelope) => {
                        let encoded = Frame::Deliver { envelope }.encode()?;
                        ws_sender.send(Message::Binary(encoded.into())).await?;
                    }
                    None => break,
                },
            }
        }

        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The bus connections are attached to.
    pub fn hub(&self) -> &Arc<LocalBus> {
        &self.hub
    }
}
