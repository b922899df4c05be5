use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{AgentError, DispatcherClient, WorkSession};
use crate::models::{DispatcherRequest, DispatcherResponse};

/// Opens one WebSocket per `DoWork` exchange against `/v1/work`.
pub struct WsDispatcherClient {
    url: String,
}

impl WsDispatcherClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl DispatcherClient for WsDispatcherClient {
    async fn do_work(&self) -> Result<Box<dyn WorkSession>, AgentError> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| AgentError::Connect(e.to_string()))?;
        Ok(Box::new(WsWorkSession { socket }))
    }
}

struct WsWorkSession {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl WorkSession for WsWorkSession {
    async fn send(&mut self, message: DispatcherResponse) -> Result<(), AgentError> {
        let json = serde_json::to_string(&message)
            .map_err(|e| AgentError::Protocol(e.to_string()))?;
        self.socket
            .send(Message::text(json))
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<DispatcherRequest>, AgentError> {
        while let Some(msg) = self.socket.next().await {
            let msg = msg.map_err(|e| AgentError::Transport(e.to_string()))?;
            let request = match msg {
                Message::Text(text) => serde_json::from_str(text.as_str()),
                Message::Binary(bytes) => serde_json::from_slice(&bytes),
                Message::Close(frame) => {
                    // 1011 carries the dispatcher's error text
                    if let Some(frame) = frame {
                        if u16::from(frame.code) != 1000 {
                            return Err(AgentError::Transport(frame.reason.as_str().to_string()));
                        }
                    }
                    return Ok(None);
                }
                _ => continue,
            };
            return request
                .map(Some)
                .map_err(|e| AgentError::Protocol(e.to_string()));
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<(), AgentError> {
        match self.socket.close(None).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => {}
            Err(e) => return Err(AgentError::Transport(e.to_string())),
        }
        // wait for the dispatcher's close reply so the exchange ends cleanly
        while let Some(msg) = self.socket.next().await {
            if msg.is_err() {
                break;
            }
        }
        Ok(())
    }
}
