//! Transport abstraction and the WebSocket implementation.
//!
//! The runtime only sees split sink/stream halves of typed messages, so
//! the writer and reader sides can live on separate tasks. Test
//! transports implement the same traits over in-process channels.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use sd_protocol::{ClientMessage, ServerMessage};

use crate::error::ClientError;

pub type BoxSink = Box<dyn TransportSink>;
pub type BoxStream = Box<dyn TransportStream>;

/// Outbound half of a connected transport.
pub trait TransportSink: Send {
    fn send(&mut self, msg: ClientMessage) -> BoxFuture<'_, Result<(), ClientError>>;
    fn close(&mut self) -> BoxFuture<'_, Result<(), ClientError>>;
}

/// Inbound half of a connected transport. `Ok(None)` means the peer
/// closed cleanly.
pub trait TransportStream: Send {
    fn next_message(&mut self) -> BoxFuture<'_, Result<Option<ServerMessage>, ClientError>>;
}

/// Factory for transport connections; owned by the connection manager,
/// which is the sole owner of sockets.
pub trait TransportConnector: Send + Sync {
    fn connect(&self) -> BoxFuture<'static, Result<(BoxSink, BoxStream), ClientError>>;
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connects to the game server over WebSocket, optionally attaching a
/// bearer token as the `Authorization` header.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    bearer_token: Option<String>,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> WsConnector {
        WsConnector {
            url: url.into(),
            bearer_token: None,
            connect_timeout,
        }
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> WsConnector {
        self.bearer_token = Some(token.into());
        self
    }

    fn build_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, ClientError> {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let mut request = self.url.as_str().into_client_request().map_err(|e| {
            ClientError::ServerUnavailable(format!("invalid URL '{}': {}", self.url, e))
        })?;
        if let Some(token) = &self.bearer_token {
            let value = format!("Bearer {}", token).parse().map_err(|_| {
                ClientError::ServerUnavailable("invalid bearer token for auth header".to_owned())
            })?;
            request.headers_mut().insert("Authorization", value);
        }
        Ok(request)
    }
}

impl TransportConnector for WsConnector {
    fn connect(&self) -> BoxFuture<'static, Result<(BoxSink, BoxStream), ClientError>> {
        let request = self.build_request();
        let url = self.url.clone();
        let connect_timeout = self.connect_timeout;
        Box::pin(async move {
            let request = request?;
            let connected = tokio::time::timeout(
                connect_timeout,
                tokio_tungstenite::connect_async(request),
            )
            .await
            .map_err(|_| ClientError::Timeout(connect_timeout))?;
            let (ws, _response) = connected
                .map_err(|e| ClientError::ServerUnavailable(format!("{}: {}", url, e)))?;
            debug!(url = %url, "websocket connected");
            let (write, read) = ws.split();
            Ok((
                Box::new(WsSinkHalf(write)) as BoxSink,
                Box::new(WsStreamHalf(read)) as BoxStream,
            ))
        })
    }
}

struct WsSinkHalf(SplitSink<WsStream, Message>);

impl TransportSink for WsSinkHalf {
    fn send(&mut self, msg: ClientMessage) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(async move {
            let json = serde_json::to_string(&msg)?;
            self.0
                .send(Message::Text(json.into()))
                .await
                .map_err(|e| ClientError::ConnectionLost(e.to_string()))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(async move {
            self.0
                .close()
                .await
                .map_err(|e| ClientError::ConnectionLost(e.to_string()))
        })
    }
}

struct WsStreamHalf(SplitStream<WsStream>);

impl TransportStream for WsStreamHalf {
    fn next_message(&mut self) -> BoxFuture<'_, Result<Option<ServerMessage>, ClientError>> {
        Box::pin(async move {
            loop {
                match self.0.next().await {
                    None => return Ok(None),
                    Some(Err(e)) => return Err(ClientError::ConnectionLost(e.to_string())),
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(msg) => return Ok(Some(msg)),
                            Err(e) => {
                                warn!(error = %e, "undecodable frame, skipping");
                                continue;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => return Ok(None),
                    // Pings are answered at the protocol layer; everything
                    // else on the stream is ignorable for this client.
                    Some(Ok(_)) => continue,
                }
            }
        })
    }
}
