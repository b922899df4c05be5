mod generate;
mod health;
mod metrics;
mod reflection;
mod work;

pub use generate::{generate_handler, generate_stream_handler};
pub use health::{alive_handler, health_handler, ready_handler, startup_handler};
pub use metrics::metrics_handler;
pub use reflection::reflection_handler;
pub use work::work_handler;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::error::{Code, DispatchError};

pub(crate) fn http_status(code: Code) -> StatusCode {
    match code {
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        // nginx's "client closed request"
        Code::Canceled => StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT),
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        (http_status(self.code()), Json(self.to_status())).into_response()
    }
}
