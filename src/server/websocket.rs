//! WebSocket server implementation
//!
//! Accepts connections, hands each one to a [`ConnectionHandler`] task and
//! runs the liveness monitor alongside them.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::handler::ConnectionHandler;
use crate::config::RelayConfig;
use crate::registry::ConnectionRegistry;
use crate::relay::{DirectPolicy, LivenessMonitor, Router};

/// How long shutdown waits for open connections to finish closing
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// WebSocket relay server
pub struct WebSocketServer {
    config: RelayConfig,
    registry: Arc<ConnectionRegistry>,
    handler: Arc<ConnectionHandler>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: RelayConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = Arc::new(ConnectionRegistry::new());

        let policy = if config.private_direct {
            DirectPolicy::Private
        } else {
            DirectPolicy::Fanout
        };
        let router = Arc::new(Router::new(Arc::clone(&registry), policy));
        let handler = Arc::new(ConnectionHandler::new(Arc::clone(&registry), router, &config));

        Self {
            config,
            registry,
            handler,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and run the server
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket relay listening on ws://{}/?user=<identity>", addr);

        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener
    ///
    /// Returns after a shutdown signal, once open connections have closed or
    /// the grace period has elapsed.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let monitor =
            LivenessMonitor::new(Arc::clone(&self.registry), self.config.probe_interval());
        tokio::spawn(monitor.run(self.shutdown_tx.subscribe()));

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let handler = Arc::clone(&self.handler);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                let result = handler.handle(stream, peer_addr, shutdown_rx).await;
                                if let Err(e) = result {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        // Wait for active connections to finish
        let open = self.registry.connection_count().await;
        if open > 0 {
            info!("Waiting for {} open connections to close...", open);
        }
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        let mut remaining = open;
        while remaining > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
            remaining = self.registry.connection_count().await;
        }
        debug!("{} connections still open at shutdown", remaining);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{RelayPayload, ServerMessage};
    use futures_util::{SinkExt, StreamExt};
    use std::future::Future;
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start(config: RelayConfig) -> (Arc<WebSocketServer>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(WebSocketServer::new(config));
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener).await });
        (server, addr)
    }

    async fn connect_url(url: String) -> Client {
        let (mut ws, _) = connect_async(url).await.unwrap();
        assert_eq!(next_message(&mut ws).await, Some(ServerMessage::welcome()));
        ws
    }

    async fn connect(addr: SocketAddr, user: &str) -> Client {
        connect_url(format!("ws://{}/?user={}", addr, user)).await
    }

    async fn send(ws: &mut Client, json: &str) {
        ws.send(Message::Text(json.to_string())).await.unwrap();
    }

    /// Next application message, skipping control frames; None on close
    async fn next_message(ws: &mut Client) -> Option<ServerMessage> {
        tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(msg) = ws.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        return Some(serde_json::from_str::<ServerMessage>(&text).unwrap())
                    }
                    Ok(Message::Close(_)) | Err(_) => return None,
                    Ok(_) => continue,
                }
            }
            None
        })
        .await
        .expect("timed out waiting for a message")
    }

    async fn assert_silent(ws: &mut Client) {
        let received = tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return text,
                    Some(Ok(_)) => continue,
                    _ => std::future::pending::<()>().await,
                }
            }
        })
        .await;
        assert!(received.is_err(), "unexpected message: {:?}", received);
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..150 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_server_config() {
        let server = WebSocketServer::new(RelayConfig::default());
        assert_eq!(server.config.socket_addr(), "127.0.0.1:3000");
    }

    #[tokio::test]
    async fn test_broadcast_between_clients() {
        let (_server, addr) = start(RelayConfig::default()).await;
        let mut alex = connect(addr, "alex").await;
        let mut sam = connect(addr, "sam").await;

        send(&mut alex, r#"{"type": "send", "message": "hi", "user": "alex"}"#).await;

        assert_eq!(
            next_message(&mut sam).await,
            Some(ServerMessage::from(RelayPayload::sent("hi")))
        );
        assert_silent(&mut alex).await;
    }

    #[tokio::test]
    async fn test_direct_message_end_to_end() {
        let (_server, addr) = start(RelayConfig::default()).await;
        let mut alex = connect(addr, "alex").await;
        let mut sam = connect(addr, "sam").await;
        let mut kim = connect(addr, "kim").await;

        send(&mut alex, r#"{"type": "private", "user": "sam", "message": "psst"}"#).await;

        assert_eq!(
            next_message(&mut sam).await,
            Some(ServerMessage::from(RelayPayload::received("psst")))
        );
        assert_eq!(
            next_message(&mut kim).await,
            Some(ServerMessage::from(RelayPayload::sent("psst")))
        );
        assert_silent(&mut alex).await;
    }

    #[tokio::test]
    async fn test_private_direct_config() {
        let config = RelayConfig {
            private_direct: true,
            ..RelayConfig::default()
        };
        let (_server, addr) = start(config).await;
        let mut alex = connect(addr, "alex").await;
        let mut sam = connect(addr, "sam").await;
        let mut kim = connect(addr, "kim").await;

        send(&mut alex, r#"{"type": "private", "user": "sam", "message": "psst"}"#).await;

        assert_eq!(
            next_message(&mut sam).await,
            Some(ServerMessage::from(RelayPayload::received("psst")))
        );
        assert_silent(&mut kim).await;
    }

    #[tokio::test]
    async fn test_malformed_input_acknowledged() {
        let (server, addr) = start(RelayConfig::default()).await;
        let mut alex = connect(addr, "alex").await;
        let mut sam = connect(addr, "sam").await;

        send(&mut alex, "this is not json").await;
        assert_eq!(next_message(&mut alex).await, Some(ServerMessage::invalid_format()));
        assert_eq!(server.registry.size().await, 2);

        // Connection stays usable
        send(&mut alex, r#"{"type": "send", "message": "after"}"#).await;
        assert_eq!(
            next_message(&mut sam).await,
            Some(ServerMessage::from(RelayPayload::sent("after")))
        );
    }

    #[tokio::test]
    async fn test_disconnect_unregisters_identity() {
        let (server, addr) = start(RelayConfig::default()).await;
        let mut alex = connect(addr, "alex").await;
        assert!(server.registry.lookup("alex").await.is_some());

        alex.close(None).await.unwrap();

        eventually(|| {
            let server = Arc::clone(&server);
            async move { server.registry.lookup("alex").await.is_none() }
        })
        .await;
        assert_eq!(server.registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_connection_without_identity_gets_broadcasts() {
        let (server, addr) = start(RelayConfig::default()).await;
        let mut anon = connect_url(format!("ws://{}/", addr)).await;
        let mut alex = connect(addr, "alex").await;

        assert_eq!(server.registry.size().await, 1);
        assert_eq!(server.registry.connection_count().await, 2);

        send(&mut alex, r#"{"type": "send", "message": "hello all"}"#).await;
        assert_eq!(
            next_message(&mut anon).await,
            Some(ServerMessage::from(RelayPayload::sent("hello all")))
        );
    }

    #[tokio::test]
    async fn test_unresponsive_client_evicted() {
        let config = RelayConfig {
            probe_interval_ms: 100,
            ..RelayConfig::default()
        };
        let (server, addr) = start(config).await;

        // Never read again after the welcome, so pings go unanswered
        let _alex = connect(addr, "alex").await;

        // Keeps reading, so tungstenite answers every ping
        let mut sam = connect(addr, "sam").await;
        let reader = tokio::spawn(async move { while sam.next().await.is_some() {} });

        eventually(|| {
            let server = Arc::clone(&server);
            async move { server.registry.lookup("alex").await.is_none() }
        })
        .await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(server.registry.lookup("sam").await.is_some());
        reader.abort();
    }

    #[tokio::test]
    async fn test_binary_frames_routed() {
        let (_server, addr) = start(RelayConfig::default()).await;
        let mut alex = connect(addr, "alex").await;
        let mut sam = connect(addr, "sam").await;

        let json = br#"{"type": "send", "message": "raw"}"#.to_vec();
        alex.send(Message::Binary(json)).await.unwrap();
        assert_eq!(
            next_message(&mut sam).await,
            Some(ServerMessage::from(RelayPayload::sent("raw")))
        );

        alex.send(Message::Binary(vec![0xff, 0x00, 0xfe])).await.unwrap();
        assert_eq!(next_message(&mut alex).await, Some(ServerMessage::invalid_format()));
        assert_silent(&mut sam).await;
    }

    #[tokio::test]
    async fn test_stalled_reader_evicted_during_broadcast() {
        let config = RelayConfig {
            probe_interval_ms: 200,
            ..RelayConfig::default()
        };
        let (server, addr) = start(config).await;

        // Never reads after the welcome, so its socket buffers fill up
        let _kim = connect(addr, "kim").await;

        let mut sam = connect(addr, "sam").await;
        let sam_reader = tokio::spawn(async move { while sam.next().await.is_some() {} });

        let alex = connect(addr, "alex").await;
        let (mut alex_tx, mut alex_rx) = alex.split();
        let alex_reader = tokio::spawn(async move { while alex_rx.next().await.is_some() {} });

        // Far more than the loopback socket buffers hold
        let json = serde_json::json!({
            "type": "send",
            "message": "x".repeat(512 * 1024),
        })
        .to_string();
        for _ in 0..40 {
            alex_tx.send(Message::Text(json.clone())).await.unwrap();
        }

        eventually(|| {
            let server = Arc::clone(&server);
            async move { server.registry.lookup("kim").await.is_none() }
        })
        .await;

        assert!(server.registry.lookup("alex").await.is_some());
        assert!(server.registry.lookup("sam").await.is_some());

        sam_reader.abort();
        alex_reader.abort();
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (server, addr) = start(RelayConfig::default()).await;
        let mut alex = connect(addr, "alex").await;

        server.shutdown();

        assert_eq!(next_message(&mut alex).await, None);
        eventually(|| {
            let server = Arc::clone(&server);
            async move { server.registry.connection_count().await == 0 }
        })
        .await;
    }
}
