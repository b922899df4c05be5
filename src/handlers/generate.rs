use axum::{
    Json,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, header},
    response::Response,
};
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::dispatcher::CallContext;
use crate::error::{Code, DispatchError};
use crate::models::{DispatcherRequest, DispatcherResponse};
use crate::state::AppState;

/// Caller deadline, in milliseconds from now.
pub const TIMEOUT_HEADER: &str = "x-request-timeout-ms";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

// Deadline from the header, cancellation from the server's abort switch.
// A caller hanging up drops the handler future, which cancels as well.
fn call_context(state: &AppState, headers: &HeaderMap) -> Result<CallContext, DispatchError> {
    if state.shutdown.is_cancelled() {
        return Err(DispatchError::ShuttingDown);
    }
    let ctx = CallContext::new(state.abort.child_token());
    let Some(value) = headers.get(TIMEOUT_HEADER) else {
        return Ok(ctx);
    };
    let millis: u64 = value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| {
            DispatchError::InvalidArgument(format!("{TIMEOUT_HEADER} must be a whole number of milliseconds"))
        })?;
    Ok(ctx.with_timeout(Duration::from_millis(millis)))
}

pub async fn generate_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<DispatcherRequest>,
) -> Result<Json<DispatcherResponse>, DispatchError> {
    let ctx = call_context(&state, &headers)?;
    state.dispatcher.generate(request, ctx).await.map(Json)
}

/// Streams chunks as NDJSON. The status line is held back until the first
/// chunk arrives so failures before any output keep a proper HTTP code; a
/// later failure is written as a final line carrying its `status`.
pub async fn generate_stream_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<DispatcherRequest>,
) -> Result<Response, DispatchError> {
    let ctx = call_context(&state, &headers)?;
    let model = request.model.clone();
    let mut stream = state.dispatcher.generate_stream(request, ctx).await?;

    let first = match stream.next().await {
        Some(Ok(chunk)) => Some(chunk),
        Some(Err(e)) => return Err(e),
        None => None,
    };
    let request_id = stream.request_id().to_string();

    let trailer_id = request_id.clone();
    let lines = futures::stream::iter(first.map(Ok))
        .chain(stream.into_stream())
        .map(move |item| {
            let chunk = item.unwrap_or_else(|e| {
                DispatcherResponse::failure(&model, &trailer_id, e.to_status())
            });
            Ok::<_, Infallible>(ndjson_line(&chunk))
        });

    let mut response = Response::new(Body::from_stream(lines));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    Ok(response)
}

fn ndjson_line(chunk: &DispatcherResponse) -> Bytes {
    let mut line = match serde_json::to_vec(chunk) {
        Ok(line) => line,
        Err(e) => {
            warn!(request_id = %chunk.request_id, error = %e, "could not encode response chunk");
            encode_failure_line(&chunk.model, &chunk.request_id, &e.to_string())
        }
    };
    line.push(b'\n');
    Bytes::from(line)
}

// Built from a json! value, whose rendering cannot fail.
fn encode_failure_line(model: &str, request_id: &str, reason: &str) -> Vec<u8> {
    serde_json::json!({
        "model": model,
        "request_id": request_id,
        "result": {
            "status": {
                "code": Code::Internal.as_str(),
                "message": format!("could not encode response chunk: {reason}"),
            }
        }
    })
    .to_string()
    .into_bytes()
}
