//! WebSocket connection handler
//!
//! Drives a single connection through CONNECTING → OPEN → CLOSED: handshake
//! and identity extraction, registration, the message loop, and cleanup.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use super::protocol::{identity_from_query, ServerMessage};
use crate::config::RelayConfig;
use crate::registry::{ConnectionHandle, ConnectionRegistry, Outbound};
use crate::relay::{LivenessState, ProbeAction, Router};

/// Upper bound on writing a Close frame to a peer that may not be reading
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Why a connection left the OPEN state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent a Close frame or hung up
    PeerClosed,
    /// Read or write on the socket failed
    TransportError,
    /// Liveness probe went unanswered
    Evicted,
    /// Peer stopped reading and a write did not complete in time
    Stalled,
    /// Server is shutting down
    Shutdown,
}

/// Handles the lifecycle of WebSocket connections
pub struct ConnectionHandler {
    registry: Arc<ConnectionRegistry>,
    router: Arc<Router>,
    miss_tolerance: u32,
    /// Upper bound on a single socket write; one probe interval
    write_timeout: Duration,
    outbound_capacity: usize,
}

impl ConnectionHandler {
    /// Create a new connection handler
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        router: Arc<Router>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            registry,
            router,
            miss_tolerance: config.miss_tolerance,
            write_timeout: config.probe_interval(),
            outbound_capacity: config.outbound_capacity,
        }
    }

    /// Run one connection to completion.
    ///
    /// Registry entries for the connection are released on every exit path
    /// after the handshake.
    pub async fn handle(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<CloseReason> {
        debug!("Handshake from {}", peer_addr);

        let identity_slot: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&identity_slot);
        let ws_stream = accept_hdr_async(
            stream,
            move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
                if let Ok(mut guard) = slot.lock() {
                    *guard = identity_from_query(req.uri().query());
                }
                Ok(response)
            },
        )
        .await?;
        let identity = identity_slot.lock().ok().and_then(|mut guard| guard.take());

        let (handle, outbound_rx) = ConnectionHandle::new(identity.clone(), self.outbound_capacity);
        self.registry.attach(handle.clone()).await;
        if let Some(identity) = identity {
            self.registry.register(identity, handle.clone()).await;
        }

        info!(
            "Connection {} from {} open (identity: {})",
            handle.id(),
            peer_addr,
            handle.identity().unwrap_or("<none>")
        );

        let result = self.run_open(ws_stream, &handle, outbound_rx, shutdown_rx).await;

        self.registry.release(&handle).await;
        let online = self.registry.size().await;
        match &result {
            Ok(reason) => info!(
                "Connection {} from {} closed ({:?}), {} identities online",
                handle.id(),
                peer_addr,
                reason,
                online
            ),
            Err(e) => warn!("Connection {} from {} failed: {}", handle.id(), peer_addr, e),
        }

        result
    }

    async fn run_open(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
        handle: &ConnectionHandle,
        mut outbound_rx: mpsc::Receiver<Outbound>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<CloseReason> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Welcome goes to the new connection only
        let welcome_json = ServerMessage::welcome().to_json()?;
        if let Err(reason) = self.write(&mut ws_sender, handle, Message::Text(welcome_json)).await {
            return Ok(reason);
        }
        debug!("Sent welcome message to {}", handle.id());

        let mut liveness = LivenessState::default();

        loop {
            tokio::select! {
                // Inbound frames, handled in arrival order
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            debug!("Received message from {}: {}", handle.id(), text);
                            match self.router.route(handle, &text).await {
                                Ok(outcome) => {
                                    debug!("Routed message from {}: {:?}", handle.id(), outcome)
                                }
                                Err(e) => warn!("Could not answer {}: {}", handle.id(), e),
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            debug!("Received {} binary bytes from {}", data.len(), handle.id());
                            match self.router.route_binary(handle, &data).await {
                                Ok(outcome) => {
                                    debug!("Routed message from {}: {:?}", handle.id(), outcome)
                                }
                                Err(e) => warn!("Could not answer {}: {}", handle.id(), e),
                            }
                        }
                        Some(Ok(Message::Ping(_))) => {
                            // tungstenite queues the pong itself
                        }
                        Some(Ok(Message::Pong(_))) => {
                            if !liveness.is_alive() {
                                debug!("Probe answered by {}", handle.id());
                            }
                            liveness.on_pong();
                        }
                        Some(Ok(Message::Close(_))) => {
                            debug!("Client {} requested close", handle.id());
                            return Ok(CloseReason::PeerClosed);
                        }
                        Some(Ok(Message::Frame(_))) => {
                            // Raw frame, ignore
                        }
                        Some(Err(e)) => {
                            warn!("WebSocket error from {}: {}", handle.id(), e);
                            return Ok(CloseReason::TransportError);
                        }
                        None => {
                            return Ok(CloseReason::PeerClosed);
                        }
                    }
                }
                // Frames and probe ticks queued through the handle
                command = outbound_rx.recv() => {
                    match command {
                        Some(Outbound::Text(text)) => {
                            let frame = Message::Text(text);
                            if let Err(reason) = self.write(&mut ws_sender, handle, frame).await {
                                return Ok(reason);
                            }
                        }
                        Some(Outbound::Probe) => match liveness.on_tick(self.miss_tolerance) {
                            ProbeAction::Ping => {
                                let frame = Message::Ping(Vec::new());
                                let written = self.write(&mut ws_sender, handle, frame).await;
                                if let Err(reason) = written {
                                    return Ok(reason);
                                }
                            }
                            ProbeAction::Evict => {
                                warn!("Connection {} missed liveness probe, evicting", handle.id());
                                close(&mut ws_sender, CloseCode::Away, "liveness probe timeout")
                                    .await;
                                return Ok(CloseReason::Evicted);
                            }
                        },
                        // Unreachable while `handle` holds a sender
                        None => return Ok(CloseReason::Shutdown),
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Shutdown signal received, closing connection {}", handle.id());
                    close(&mut ws_sender, CloseCode::Away, "server shutting down").await;
                    return Ok(CloseReason::Shutdown);
                }
            }
        }
    }

    /// Write one frame, giving up after the write timeout.
    ///
    /// A peer that stops reading eventually fills the socket buffers and the
    /// write never completes; it is dropped without a Close frame since
    /// nothing more can be written to it.
    async fn write(
        &self,
        ws_sender: &mut WsSink,
        handle: &ConnectionHandle,
        frame: Message,
    ) -> Result<(), CloseReason> {
        match tokio::time::timeout(self.write_timeout, ws_sender.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!("Write to {} failed: {}", handle.id(), e);
                Err(CloseReason::TransportError)
            }
            Err(_) => {
                warn!(
                    "Connection {} not reading, write blocked for {:?}, evicting",
                    handle.id(),
                    self.write_timeout
                );
                Err(CloseReason::Stalled)
            }
        }
    }
}

/// Best-effort Close frame; the socket is dropped right after either way
async fn close(ws_sender: &mut WsSink, code: CloseCode, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let result = tokio::time::timeout(CLOSE_TIMEOUT, ws_sender.send(Message::Close(Some(frame))));
    match result.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Close frame not delivered: {}", e),
        Err(_) => debug!("Close frame timed out"),
    }
}
