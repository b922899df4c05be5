use async_trait::async_trait;
use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade, close_code},
    },
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Code, DispatchError};
use crate::models::{DispatcherRequest, DispatcherResponse};
use crate::state::AppState;
use crate::worker::WorkStream;

// close reasons must fit in a control frame
const MAX_CLOSE_REASON: usize = 120;

pub async fn work_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_agent(socket, state))
}

async fn serve_agent(socket: WebSocket, state: Arc<AppState>) {
    let mut stream = SocketWorkStream { socket };
    let result = state
        .work_handler
        .do_work(&mut stream, &state.shutdown, &state.abort)
        .await;

    let frame = match &result {
        Ok(()) => CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        },
        Err(e) => {
            if e.code() == Code::Canceled {
                debug!(error = %e, "agent exchange canceled");
            } else {
                warn!(error = %e, "agent exchange failed");
            }
            CloseFrame {
                code: close_code::ERROR,
                reason: close_reason(e).into(),
            }
        }
    };
    // the agent may be gone already
    let _ = stream.socket.send(WsMessage::Close(Some(frame))).await;
}

fn close_reason(err: &DispatchError) -> String {
    let mut reason = err.to_string();
    if reason.len() > MAX_CLOSE_REASON {
        let mut cut = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason.truncate(cut);
    }
    reason
}

struct SocketWorkStream {
    socket: WebSocket,
}

#[async_trait]
impl WorkStream for SocketWorkStream {
    async fn recv(&mut self) -> Result<Option<DispatcherResponse>, DispatchError> {
        while let Some(msg) = self.socket.recv().await {
            let msg = msg.map_err(|e| DispatchError::AgentStream(e.to_string()))?;
            let decoded = match msg {
                WsMessage::Text(text) => serde_json::from_str(text.as_str()),
                WsMessage::Binary(bytes) => serde_json::from_slice(&bytes),
                WsMessage::Close(_) => return Ok(None),
                // pings are answered by the socket itself
                _ => continue,
            };
            return decoded
                .map(Some)
                .map_err(|e| DispatchError::AgentStream(format!("malformed agent message: {e}")));
        }
        Ok(None)
    }

    async fn send(&mut self, request: DispatcherRequest) -> Result<(), DispatchError> {
        let json = serde_json::to_string(&request)
            .map_err(|e| DispatchError::Internal(e.to_string()))?;
        self.socket
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|e| DispatchError::AgentStream(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_close_reasons_are_cut_on_char_boundary() {
        let err = DispatchError::Internal("é".repeat(100));
        let reason = close_reason(&err);
        assert!(reason.len() <= MAX_CLOSE_REASON);
        assert!(reason.starts_with("internal error: "));
    }
}
