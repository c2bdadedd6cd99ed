use super::stomp::{self, StompFrame};
use super::{Connection, InboundFrame, OutboundFrame, Transport};
use crate::config::Endpoint;
use crate::error::ConnectionError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// STOMP over websocket, the transport NIS nodes expose on port 7778.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, ConnectionError> {
        let url = endpoint.url();
        tracing::debug!("Connecting to {}", url);

        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ConnectionError::Unreachable {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        let mut connection = WebSocketConnection {
            endpoint: endpoint.to_string(),
            stream,
        };
        connection.handshake(&endpoint.domain).await?;
        Ok(Box::new(connection))
    }
}

struct WebSocketConnection {
    endpoint: String,
    stream: WsStream,
}

impl WebSocketConnection {
    async fn handshake(&mut self, host: &str) -> Result<(), ConnectionError> {
        let handshake_error = |reason: String| ConnectionError::Handshake {
            endpoint: self.endpoint.clone(),
            reason,
        };

        self.stream
            .send(Message::Text(stomp::connect_frame(host).encode().into()))
            .await
            .map_err(|e| handshake_error(e.to_string()))?;

        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(handshake_error(e.to_string())),
                None => return Err(handshake_error("closed during handshake".to_string())),
            };
            let Message::Text(text) = message else {
                continue;
            };
            let Some(frame) = StompFrame::decode(text.as_str())? else {
                continue;
            };
            return match frame.command.as_str() {
                "CONNECTED" => {
                    tracing::debug!(
                        "STOMP session established with {} (version {})",
                        self.endpoint,
                        frame.header("version").unwrap_or("1.0")
                    );
                    Ok(())
                }
                "ERROR" => Err(handshake_error(
                    frame
                        .header("message")
                        .map(str::to_string)
                        .unwrap_or(frame.body),
                )),
                other => Err(handshake_error(format!("unexpected {} frame", other))),
            };
        }
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), ConnectionError> {
        let text = stomp::encode_outbound(&frame).encode();
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<InboundFrame, ConnectionError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!("Websocket error on {}: {}", self.endpoint, e);
                    return None;
                }
            };
            let text = match message {
                Message::Text(text) => text.as_str().to_string(),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        return Some(Err(ConnectionError::Protocol(
                            "binary frame is not UTF-8".to_string(),
                        )))
                    }
                },
                Message::Close(_) => return None,
                _ => continue,
            };
            let frame = match StompFrame::decode(&text) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            };
            match stomp::decode_inbound(frame) {
                Ok(Some(inbound)) => return Some(Ok(inbound)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self
            .stream
            .send(Message::Text(stomp::disconnect_frame().encode().into()))
            .await;
        let _ = self.stream.close(None).await;
    }
}
