use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};

use crate::error::WebSocketError;
use crate::websocket::{RegistryHandle, Session, SessionConfig};

/// Upgrade-time settings for the signaling listener.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Only requests for this path are upgraded.
    pub path: String,
    /// Largest message or frame accepted from a peer, in bytes.
    pub max_message_size: usize,
    pub session: SessionConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            max_message_size: 64 * 1024,
            session: SessionConfig::default(),
        }
    }
}

pub struct WebSocketServer {
    registry: RegistryHandle,
    options: ServerOptions,
}

impl WebSocketServer {
    pub fn new(registry: RegistryHandle, options: ServerOptions) -> Self {
        Self { registry, options }
    }

    /// Accept connections forever, one task per connection.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("Signaling server listening on ws://{}{}", addr, self.options.path),
            Err(e) => warn!("Signaling server listening on unknown address: {}", e),
        }

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, addr).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    pub async fn handle_connection(
        self: Arc<Self>,
        raw_stream: TcpStream,
        addr: SocketAddr,
    ) {
        info!("New WebSocket connection from: {}", addr);

        let ws_stream = match self.upgrade(raw_stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(peer = %addr, "Error during WebSocket handshake: {}", e);
                return;
            }
        };

        // Identity is the transport origin; collisions are settled by the registry.
        let session = Session::new(addr.to_string(), self.options.session.clone());
        let session_id = session.session_ref().id;
        let (ws_sink, ws_stream) = ws_stream.split();

        if let Err(e) = session.run(ws_sink, ws_stream, self.registry.clone()).await {
            match e {
                WebSocketError::RegistryClosed => {
                    error!(peer = %addr, session_id = %session_id, "Registry unavailable, dropping connection");
                }
                e if e.is_fatal() => {
                    debug!(peer = %addr, session_id = %session_id, "Connection ended: {}", e);
                }
                e => {
                    warn!(peer = %addr, session_id = %session_id, "Connection ended on recoverable error: {}", e);
                }
            }
        }
    }

    async fn upgrade(
        &self,
        raw_stream: TcpStream,
    ) -> Result<tokio_tungstenite::WebSocketStream<TcpStream>, WebSocketError> {
        let path = self.options.path.clone();
        let check_path = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if request.uri().path() == path {
                Ok(response)
            } else {
                let mut rejection = ErrorResponse::new(Some(format!("No signaling endpoint at {}", request.uri().path())));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        };

        let config = WebSocketConfig {
            max_message_size: Some(self.options.max_message_size),
            max_frame_size: Some(self.options.max_message_size),
            ..Default::default()
        };

        tokio_tungstenite::accept_hdr_async_with_config(raw_stream, check_path, Some(config))
            .await
            .map_err(|e| WebSocketError::HandshakeError(e.to_string()))
    }
}
