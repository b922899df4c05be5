//! Caller-facing half of the dispatch protocol.

use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::metrics::{CallGuard, Operation, UNKNOWN_MODEL};
use crate::models::{ChunkResult, DispatcherRequest, DispatcherResponse, GenerateResponse, generate_request_id};
use crate::queue::{ModelQueueRegistry, PendingRequest};

/// Deadline and cancellation signal of one inbound call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            deadline: None,
            cancel,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

pub struct Dispatcher {
    registry: Arc<ModelQueueRegistry>,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<ModelQueueRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ModelQueueRegistry> {
        &self.registry
    }

    /// Admits the request and returns the stream of chunks produced for it.
    pub async fn generate_stream(
        &self,
        request: DispatcherRequest,
        ctx: CallContext,
    ) -> Result<ResponseStream, DispatchError> {
        self.admit(Operation::GenerateStream, request, ctx).await
    }

    /// Unary form: drains the stream and folds the chunks into one response.
    pub async fn generate(
        &self,
        request: DispatcherRequest,
        ctx: CallContext,
    ) -> Result<DispatcherResponse, DispatchError> {
        let mut stream = self.admit(Operation::Generate, request, ctx).await?;
        let mut head: Option<DispatcherResponse> = None;
        let mut folded = GenerateResponse::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let Some(part) = chunk.response().cloned() else {
                continue;
            };
            merge(&mut folded, part);
            head.get_or_insert(chunk);
        }

        match head {
            Some(mut response) => {
                response.result = Some(ChunkResult::Response(folded));
                Ok(response)
            }
            None => Err(stream.fail(DispatchError::Internal(
                "agent completed without producing a response".to_string(),
            ))),
        }
    }

    async fn admit(
        &self,
        operation: Operation,
        mut request: DispatcherRequest,
        ctx: CallContext,
    ) -> Result<ResponseStream, DispatchError> {
        let queue = self.registry.get(&request.model);
        let label = if queue.is_ok() {
            request.model.as_str()
        } else {
            UNKNOWN_MODEL
        };
        let mut guard = CallGuard::new(operation, label);

        if request.request.is_none() {
            return Err(guard.fail(DispatchError::MissingPayload));
        }
        let queue = queue.map_err(|e| guard.fail(e))?;

        if request.request_id.is_empty() {
            request.request_id = generate_request_id();
        }
        // only the dispatcher sets the budget, right before dispatch
        request.timeout_ms = None;

        let deadline = ctx
            .deadline
            .unwrap_or_else(|| Instant::now() + self.default_timeout);
        let request_id = request.request_id.clone();
        let (pending, response_rx) = PendingRequest::new(request, deadline);

        if let Err(e) = queue.enqueue(pending, &ctx.cancel).await {
            warn!(request_id = %request_id, model = queue.model(), error = %e, "request not admitted");
            return Err(guard.fail(e));
        }
        debug!(request_id = %request_id, model = queue.model(), depth = queue.len(), "request queued");

        Ok(ResponseStream {
            request_id,
            response_rx,
            deadline,
            cancel: ctx.cancel,
            guard,
            chunks: 0,
            finished: false,
        })
    }
}

fn merge(acc: &mut GenerateResponse, part: GenerateResponse) {
    acc.text.push_str(&part.text);
    if part.generated_text.is_some() {
        acc.generated_text = part.generated_text;
    }
    if part.finish_reason.is_some() {
        acc.finish_reason = part.finish_reason;
    }
    if part.generated_tokens.is_some() {
        acc.generated_tokens = part.generated_tokens;
    }
}

/// Chunks of one admitted request, in agent order.
///
/// Yields `Ok` chunks until the agent side completes, then `None`. An
/// embedded agent status, the deadline or cancellation end it with one `Err`.
pub struct ResponseStream {
    request_id: String,
    response_rx: mpsc::Receiver<DispatcherResponse>,
    deadline: Instant,
    cancel: CancellationToken,
    guard: CallGuard,
    chunks: usize,
    finished: bool,
}

impl ResponseStream {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub async fn next(&mut self) -> Option<Result<DispatcherResponse, DispatchError>> {
        if self.finished {
            return None;
        }

        let received = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DispatchError::Canceled),
            _ = time::sleep_until(self.deadline) => Err(DispatchError::DeadlineExceeded(
                "no response from an agent before the deadline".to_string(),
            )),
            chunk = self.response_rx.recv() => Ok(chunk),
        };

        match received {
            Ok(Some(chunk)) => match chunk.result {
                Some(ChunkResult::Status(status)) => {
                    Some(Err(self.fail(DispatchError::Remote(status))))
                }
                _ => {
                    self.chunks += 1;
                    Some(Ok(chunk))
                }
            },
            Ok(None) => {
                self.finished = true;
                self.guard.succeed();
                info!(request_id = %self.request_id, chunks = self.chunks, "request completed");
                None
            }
            Err(e) => Some(Err(self.fail(e))),
        }
    }

    /// Adapts the stream for body writers that want a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<DispatcherResponse, DispatchError>> {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|item| (item, stream))
        })
    }

    fn fail(&mut self, err: DispatchError) -> DispatchError {
        self.finished = true;
        warn!(request_id = %self.request_id, chunks = self.chunks, error = %err, "request failed");
        self.guard.fail(err)
    }
}
