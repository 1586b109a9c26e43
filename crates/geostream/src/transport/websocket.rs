//! WebSocket links (tokio-tungstenite, rustls)

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::link::{Connector, Inbound, Link, Outbound};
use crate::config::Endpoint;
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects over `ws://` or `wss://`
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    type Link = WsLink;

    async fn connect(&self, endpoint: &Endpoint) -> Result<WsLink, TransportError> {
        let (ws, response) = tokio_tungstenite::connect_async(endpoint.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(status = %response.status(), "WebSocket handshake complete");
        Ok(WsLink { ws })
    }
}

pub struct WsLink {
    ws: WsStream,
}

#[async_trait]
impl Link for WsLink {
    async fn send(&mut self, payload: Outbound) -> Result<(), TransportError> {
        let msg = match payload {
            Outbound::Text(text) => Message::Text(text.into()),
            Outbound::Binary(data) => Message::Binary(data.into()),
        };
        self.ws
            .send(msg)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn ping(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.ws
            .send(Message::Ping(payload.into()))
            .await
            .map_err(|e| TransportError::Probe(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        loop {
            let msg = match self.ws.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            };
            return match msg {
                Message::Text(text) => Some(Ok(Inbound::Text(text.to_string()))),
                Message::Binary(data) => Some(Ok(Inbound::Binary(Bytes::from(data)))),
                Message::Pong(_) => Some(Ok(Inbound::Pong)),
                Message::Close(frame) => {
                    let reason = frame
                        .map(|f| format!("{} {}", f.code, f.reason))
                        .unwrap_or_else(|| "no close frame".to_string());
                    Some(Err(TransportError::Receive(format!(
                        "server closed connection ({})",
                        reason.trim()
                    ))))
                }
                // Pings are answered by tungstenite on the next write
                Message::Ping(_) | Message::Frame(_) => continue,
            };
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!(error = %e, "WebSocket close handshake failed");
        }
    }
}
