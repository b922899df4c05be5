//! Agent-facing half of the dispatch protocol (`DoWork`).

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::metrics::{CallGuard, Operation, RELAYED_CHUNKS, UNKNOWN_MODEL};
use crate::models::{DispatcherRequest, DispatcherResponse};
use crate::queue::ModelQueueRegistry;

/// Dispatcher's end of one agent stream.
///
/// `recv` returns `Ok(None)` once the agent has closed its side.
#[async_trait]
pub trait WorkStream: Send {
    async fn recv(&mut self) -> Result<Option<DispatcherResponse>, DispatchError>;
    async fn send(&mut self, request: DispatcherRequest) -> Result<(), DispatchError>;
}

/// Work stream over in-process channels. The agent closes it by dropping
/// its sender.
pub struct ChannelWorkStream {
    inbound: mpsc::Receiver<DispatcherResponse>,
    outbound: mpsc::Sender<DispatcherRequest>,
}

impl ChannelWorkStream {
    pub fn new(
        inbound: mpsc::Receiver<DispatcherResponse>,
        outbound: mpsc::Sender<DispatcherRequest>,
    ) -> Self {
        Self { inbound, outbound }
    }
}

#[async_trait]
impl WorkStream for ChannelWorkStream {
    async fn recv(&mut self) -> Result<Option<DispatcherResponse>, DispatchError> {
        Ok(self.inbound.recv().await)
    }

    async fn send(&mut self, request: DispatcherRequest) -> Result<(), DispatchError> {
        self.outbound
            .send(request)
            .await
            .map_err(|_| DispatchError::AgentStream("agent is no longer receiving".to_string()))
    }
}

// diagnostics for one DoWork call
struct AgentSession<'a> {
    model: &'a str,
    request_id: String,
    chunks: u64,
}

pub struct WorkHandler {
    registry: Arc<ModelQueueRegistry>,
}

impl WorkHandler {
    pub fn new(registry: Arc<ModelQueueRegistry>) -> Self {
        Self { registry }
    }

    /// Serves exactly one pending request over `stream`.
    ///
    /// `shutdown` releases an agent that is still waiting for work; `abort`
    /// also tears down an exchange that is already relaying.
    pub async fn do_work<S>(
        &self,
        stream: &mut S,
        shutdown: &CancellationToken,
        abort: &CancellationToken,
    ) -> Result<(), DispatchError>
    where
        S: WorkStream + ?Sized,
    {
        let announce = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(DispatchError::Canceled),
            msg = stream.recv() => msg?,
        };
        let Some(announce) = announce else {
            return Err(DispatchError::AgentStream(
                "agent closed the stream before announcing a model".to_string(),
            ));
        };

        let model = announce.model;
        let label = if self.registry.get(&model).is_ok() {
            model.as_str()
        } else {
            UNKNOWN_MODEL
        };
        let mut guard = CallGuard::new(Operation::DoWork, label);
        match self.serve(stream, &model, shutdown, abort).await {
            Ok(()) => {
                guard.succeed();
                Ok(())
            }
            Err(e) => Err(guard.fail(e)),
        }
    }

    async fn serve<S>(
        &self,
        stream: &mut S,
        model: &str,
        shutdown: &CancellationToken,
        abort: &CancellationToken,
    ) -> Result<(), DispatchError>
    where
        S: WorkStream + ?Sized,
    {
        let queue = self.registry.get(model)?;
        debug!(model, "agent waiting for work");

        let mut pending = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(DispatchError::Canceled),
            msg = stream.recv() => {
                // nothing is expected from an idle agent except closing
                return Err(match msg {
                    Ok(None) => DispatchError::Canceled,
                    Ok(Some(_)) => DispatchError::AgentStream(
                        "unexpected message while waiting for work".to_string(),
                    ),
                    Err(e) => e,
                });
            }
            pending = queue.dequeue(shutdown) => pending?,
        };
        let mut session = AgentSession {
            model,
            request_id: pending.request_id().to_string(),
            chunks: 0,
        };

        // truncating to whole milliseconds keeps the budget at or below what is left
        let timeout_ms = pending.remaining().as_millis() as u64;
        if pending.is_expired() || timeout_ms == 0 {
            let err = DispatchError::DeadlineExceeded(
                "request expired before it could be dispatched".to_string(),
            );
            warn!(request_id = %session.request_id, model, "dropping stale request");
            pending.fail(err.to_status());
            return Err(err);
        }

        let mut outbound = pending.request().clone();
        outbound.timeout_ms = Some(timeout_ms);
        tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(DispatchError::Canceled),
            sent = stream.send(outbound) => sent?,
        }
        debug!(request_id = %session.request_id, model, timeout_ms, "request dispatched");

        loop {
            let received = tokio::select! {
                biased;
                _ = abort.cancelled() => Err(DispatchError::Canceled),
                _ = time::sleep_until(pending.deadline()) => Err(DispatchError::DeadlineExceeded(
                    "agent did not finish before the deadline".to_string(),
                )),
                msg = stream.recv() => msg,
            };
            let Some(mut chunk) = received? else {
                break;
            };
            if chunk.result.is_none() {
                debug!(request_id = %session.request_id, "ignoring empty agent message");
                continue;
            }
            chunk.model = session.model.to_string();
            chunk.request_id = session.request_id.clone();

            pending.deliver(chunk).await?;
            session.chunks += 1;
            RELAYED_CHUNKS.with_label_values(&[session.model]).inc();
        }

        if session.chunks == 0 {
            // dropping `pending` unsettled reports the request as unavailable
            warn!(request_id = %session.request_id, model, "agent closed without responding");
            return Err(DispatchError::AgentStream(
                "agent closed the stream without responding".to_string(),
            ));
        }
        pending.finish();
        info!(
            request_id = %session.request_id,
            model = session.model,
            chunks = session.chunks,
            "agent completed request"
        );
        Ok(())
    }
}
