//! Worker agent: pulls requests from the dispatcher and relays a local
//! backend's output back chunk by chunk.

mod backend;
mod client;
mod local;

pub use backend::OllamaBackend;
pub use client::WsDispatcherClient;
pub use local::LocalDispatcherClient;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Code, Status};
use crate::models::{DispatcherRequest, DispatcherResponse, GenerateRequest, GenerateResponse};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Request(String),

    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("{0}")]
    Inference(String),

    #[error("could not decode backend output: {0}")]
    Decode(String),

    #[error("backend did not finish before the deadline")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("could not reach dispatcher: {0}")]
    Connect(String),

    #[error("dispatcher stream failed: {0}")]
    Transport(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

pub type BackendStream = BoxStream<'static, Result<GenerateResponse, BackendError>>;

/// Local inference engine the agent fronts.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn generate_stream(
        &self,
        request: GenerateRequest,
        timeout: Option<Duration>,
    ) -> Result<BackendStream, BackendError>;
}

/// Opens `DoWork` exchanges with the dispatcher.
#[async_trait]
pub trait DispatcherClient: Send + Sync {
    async fn do_work(&self) -> Result<Box<dyn WorkSession>, AgentError>;
}

/// Agent's end of one `DoWork` exchange.
#[async_trait]
pub trait WorkSession: Send {
    async fn send(&mut self, message: DispatcherResponse) -> Result<(), AgentError>;
    /// `Ok(None)` once the dispatcher has closed its side.
    async fn recv(&mut self) -> Result<Option<DispatcherRequest>, AgentError>;
    async fn close(&mut self) -> Result<(), AgentError>;
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub capacity: usize,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
}

impl AgentConfig {
    pub fn new(model: impl Into<String>, capacity: usize) -> Self {
        Self {
            model: model.into(),
            capacity,
            retry_backoff: Duration::from_millis(500),
            max_retry_backoff: Duration::from_secs(10),
        }
    }
}

enum Served {
    Request,
    Shutdown,
}

pub struct Agent {
    config: AgentConfig,
    client: Arc<dyn DispatcherClient>,
    backend: Arc<dyn InferenceBackend>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        client: Arc<dyn DispatcherClient>,
        backend: Arc<dyn InferenceBackend>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            client,
            backend,
        })
    }

    /// Runs `capacity` workers until `shutdown` fires and every in-flight
    /// request has drained.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(model = %self.config.model, capacity = self.config.capacity, "agent started");

        let mut workers = JoinSet::new();
        for worker in 0..self.config.capacity.max(1) {
            let agent = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { agent.worker_loop(worker, shutdown).await });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "agent worker panicked");
            }
        }

        info!(model = %self.config.model, "agent stopped");
    }

    async fn worker_loop(&self, worker: usize, shutdown: CancellationToken) {
        let mut backoff = self.config.retry_backoff;

        while !shutdown.is_cancelled() {
            match self.serve_once(&shutdown).await {
                Ok(Served::Request) => backoff = self.config.retry_backoff,
                Ok(Served::Shutdown) => break,
                Err(e) => {
                    warn!(worker, error = %e, retry_in = ?backoff, "work exchange failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.config.max_retry_backoff);
                }
            }
        }
        debug!(worker, "worker exited");
    }

    async fn serve_once(&self, shutdown: &CancellationToken) -> Result<Served, AgentError> {
        let mut session = tokio::select! {
            _ = shutdown.cancelled() => return Ok(Served::Shutdown),
            session = self.client.do_work() => session?,
        };
        session
            .send(DispatcherResponse::announce(&self.config.model))
            .await?;

        let request = tokio::select! {
            _ = shutdown.cancelled() => {
                // a request that already arrived is in flight and gets served
                match session.recv().now_or_never() {
                    Some(Ok(Some(request))) => {
                        debug!(request_id = %request.request_id, "serving request dispatched during shutdown");
                        self.relay(session.as_mut(), request).await?;
                        return Ok(Served::Request);
                    }
                    _ => {
                        let _ = session.close().await;
                        return Ok(Served::Shutdown);
                    }
                }
            }
            request = session.recv() => request?,
        };
        let Some(request) = request else {
            return Err(AgentError::Protocol(
                "dispatcher closed the stream without sending work".to_string(),
            ));
        };

        self.relay(session.as_mut(), request).await?;
        Ok(Served::Request)
    }

    /// Streams one request through the backend, forwarding every chunk as
    /// it arrives, then closes the session.
    async fn relay(
        &self,
        session: &mut dyn WorkSession,
        request: DispatcherRequest,
    ) -> Result<(), AgentError> {
        let model = self.config.model.as_str();
        let request_id = request.request_id.clone();
        let timeout = request.timeout();
        let deadline = timeout.map(|t| Instant::now() + t);

        let Some(payload) = request.request else {
            let status = Status::new(Code::InvalidArgument, "request payload is required");
            session
                .send(DispatcherResponse::failure(model, &request_id, status))
                .await?;
            return session.close().await;
        };
        debug!(request_id = %request_id, ?timeout, "running request");

        let mut chunks = 0u64;
        let outcome = match self.backend.generate_stream(payload, timeout).await {
            Ok(mut stream) => loop {
                let next = match deadline {
                    Some(deadline) => tokio::select! {
                        _ = time::sleep_until(deadline) => Some(Err(BackendError::Timeout)),
                        next = stream.next() => next,
                    },
                    None => stream.next().await,
                };
                match next {
                    Some(Ok(response)) => {
                        session
                            .send(DispatcherResponse::chunk(model, &request_id, response))
                            .await?;
                        chunks += 1;
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                }
            },
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            warn!(request_id = %request_id, chunks, error = %e, "backend failed");
            let code = if matches!(e, BackendError::Timeout) {
                Code::DeadlineExceeded
            } else {
                Code::Internal
            };
            session
                .send(DispatcherResponse::failure(model, &request_id, Status::new(code, e.to_string())))
                .await?;
        } else {
            info!(request_id = %request_id, chunks, "request served");
        }
        session.close().await
    }
}
