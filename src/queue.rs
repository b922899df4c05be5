//! Per-model bounded queues and the pending requests that travel through them.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{Code, ConfigError, DispatchError, Status};
use crate::models::{DispatcherRequest, DispatcherResponse};

/// One admitted request waiting for (or being served by) an agent.
///
/// Dropping it closes the caller's response channel. If it goes away before
/// delivering anything and without being finished, the caller is told the
/// request was abandoned instead of seeing an empty stream.
///
/// The response channel holds one chunk, so the handoff is not fully
/// unbuffered: `deliver` returns once a chunk is buffered, and the agent side
/// may finish while the caller has yet to read the last one.
#[derive(Debug)]
pub struct PendingRequest {
    request: DispatcherRequest,
    deadline: Instant,
    response_tx: mpsc::Sender<DispatcherResponse>,
    delivered: usize,
    settled: bool,
}

impl PendingRequest {
    pub fn new(
        request: DispatcherRequest,
        deadline: Instant,
    ) -> (Self, mpsc::Receiver<DispatcherResponse>) {
        // capacity 1: the closest tokio gets to an unbuffered handoff
        let (response_tx, response_rx) = mpsc::channel(1);
        let pending = Self {
            request,
            deadline,
            response_tx,
            delivered: 0,
            settled: false,
        };
        (pending, response_rx)
    }

    pub fn request(&self) -> &DispatcherRequest {
        &self.request
    }

    pub fn request_id(&self) -> &str {
        &self.request.request_id
    }

    pub fn model(&self) -> &str {
        &self.request.model
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Hands one chunk to the waiting caller, giving up at the deadline.
    pub async fn deliver(&mut self, chunk: DispatcherResponse) -> Result<(), DispatchError> {
        tokio::select! {
            sent = self.response_tx.send(chunk) => {
                sent.map_err(|_| DispatchError::Canceled)?;
                self.delivered += 1;
                Ok(())
            }
            _ = time::sleep_until(self.deadline) => Err(DispatchError::DeadlineExceeded(
                "caller did not read the response in time".to_string(),
            )),
        }
    }

    /// Ends the exchange with an error status for the caller.
    pub fn fail(mut self, status: Status) {
        self.settled = true;
        self.push_status(status);
    }

    /// Ends the exchange normally; the caller sees the stream complete.
    pub fn finish(mut self) {
        self.settled = true;
    }

    fn push_status(&self, status: Status) {
        let chunk = DispatcherResponse::failure(&self.request.model, &self.request.request_id, status);
        // the caller may already be gone
        let _ = self.response_tx.try_send(chunk);
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.settled && self.delivered == 0 {
            self.push_status(Status::new(
                Code::Unavailable,
                "request was abandoned before any response was produced",
            ));
        }
    }
}

/// Bounded FIFO of pending requests for a single model.
#[derive(Debug)]
pub struct ModelQueue {
    model: String,
    tx: mpsc::Sender<PendingRequest>,
    rx: Mutex<mpsc::Receiver<PendingRequest>>,
}

impl ModelQueue {
    fn new(model: String, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            model,
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for a free slot. Cancellation and the request's own deadline
    /// are checked first, so an already-dead caller never occupies a slot.
    pub async fn enqueue(
        &self,
        pending: PendingRequest,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let deadline = pending.deadline;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DispatchError::Canceled),
            _ = time::sleep_until(deadline) => Err(DispatchError::DeadlineExceeded(format!(
                "no queue slot for model {} before the deadline",
                self.model
            ))),
            sent = self.tx.send(pending) => {
                sent.map_err(|_| DispatchError::Internal(format!("queue for {} is closed", self.model)))
            }
        }
    }

    /// Takes the oldest pending request. Waiting consumers are served in
    /// arrival order because the receiver sits behind a fair mutex.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<PendingRequest, DispatchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DispatchError::Canceled),
            pending = async { self.rx.lock().await.recv().await } => {
                pending.ok_or_else(|| DispatchError::Internal(format!("queue for {} is closed", self.model)))
            }
        }
    }
}

/// Fixed mapping from model id to its queue, built once at startup.
#[derive(Debug)]
pub struct ModelQueueRegistry {
    queues: HashMap<String, ModelQueue>,
    models: Vec<String>,
}

impl ModelQueueRegistry {
    pub fn new(supported_models: &[String], backlog_size: usize) -> Result<Self, ConfigError> {
        if supported_models.is_empty() {
            return Err(ConfigError::NoModels);
        }
        if backlog_size == 0 {
            return Err(ConfigError::ZeroBacklog);
        }

        let mut queues = HashMap::with_capacity(supported_models.len());
        for model in supported_models {
            if queues.contains_key(model) {
                return Err(ConfigError::DuplicateModel(model.clone()));
            }
            queues.insert(model.clone(), ModelQueue::new(model.clone(), backlog_size));
        }

        Ok(Self {
            queues,
            models: supported_models.to_vec(),
        })
    }

    pub fn get(&self, model: &str) -> Result<&ModelQueue, DispatchError> {
        self.queues
            .get(model)
            .ok_or_else(|| DispatchError::UnsupportedModel(model.to_string()))
    }

    /// Models in configuration order.
    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelQueue> {
        self.models.iter().filter_map(|m| self.queues.get(m))
    }

    pub fn total_len(&self) -> usize {
        self.queues.values().map(ModelQueue::len).sum()
    }

    pub fn total_capacity(&self) -> usize {
        self.queues.values().map(ModelQueue::capacity).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GenerateRequest;
    use std::sync::Arc;

    fn registry(models: &[&str], backlog: usize) -> ModelQueueRegistry {
        let models: Vec<String> = models.iter().map(|m| m.to_string()).collect();
        ModelQueueRegistry::new(&models, backlog).unwrap()
    }

    fn pending(id: &str, ttl: Duration) -> (PendingRequest, mpsc::Receiver<DispatcherResponse>) {
        let req = DispatcherRequest::new("m1", GenerateRequest::new("hi")).with_request_id(id);
        PendingRequest::new(req, Instant::now() + ttl)
    }

    #[test]
    fn rejects_bad_configuration() {
        assert_eq!(
            ModelQueueRegistry::new(&[], 4).unwrap_err(),
            ConfigError::NoModels
        );
        assert_eq!(
            ModelQueueRegistry::new(&["a".to_string()], 0).unwrap_err(),
            ConfigError::ZeroBacklog
        );
        assert_eq!(
            ModelQueueRegistry::new(&["a".to_string(), "a".to_string()], 1).unwrap_err(),
            ConfigError::DuplicateModel("a".to_string())
        );
    }

    #[test]
    fn unknown_model_is_not_found() {
        let reg = registry(&["m1"], 2);
        let err = reg.get("no-such-model").unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(reg.models(), ["m1".to_string()]);
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let reg = registry(&["m1"], 4);
        let q = reg.get("m1").unwrap();
        let cancel = CancellationToken::new();
        let mut receivers = Vec::new();
        for id in ["a", "b", "c"] {
            let (p, rx) = pending(id, Duration::from_secs(5));
            receivers.push(rx);
            q.enqueue(p, &cancel).await.unwrap();
        }
        assert_eq!(q.len(), 3);
        for id in ["a", "b", "c"] {
            let p = q.dequeue(&cancel).await.unwrap();
            assert_eq!(p.request_id(), id);
            p.finish();
        }
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn full_queue_times_out_and_never_exceeds_capacity() {
        let reg = Arc::new(registry(&["m1"], 2));
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        for i in 0..6 {
            let reg = reg.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let (p, rx) = pending(&format!("r{i}"), Duration::from_millis(100));
                let result = reg.get("m1").unwrap().enqueue(p, &cancel).await;
                (result, rx)
            }));
        }
        let mut accepted = 0;
        let mut keep = Vec::new();
        for h in handles {
            let (result, rx) = h.await.unwrap();
            match result {
                Ok(()) => accepted += 1,
                Err(e) => assert_eq!(e.code(), Code::DeadlineExceeded),
            }
            keep.push(rx);
        }
        assert_eq!(accepted, 2);
        assert_eq!(reg.get("m1").unwrap().len(), 2);
        assert_eq!(reg.total_len(), 2);
        assert_eq!(reg.total_capacity(), 2);
    }

    #[tokio::test]
    async fn canceled_caller_never_occupies_a_slot() {
        let reg = registry(&["m1"], 2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (p, _rx) = pending("r1", Duration::from_secs(5));
        let err = reg.get("m1").unwrap().enqueue(p, &cancel).await.unwrap_err();
        assert_eq!(err.code(), Code::Canceled);
        assert_eq!(reg.get("m1").unwrap().len(), 0);
    }

    #[tokio::test]
    async fn dequeue_observes_cancellation() {
        let reg = registry(&["m1"], 1);
        let cancel = CancellationToken::new();
        let waiter = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(20)).await;
            waiter.cancel();
        });
        let err = reg.get("m1").unwrap().dequeue(&cancel).await.unwrap_err();
        assert_eq!(err.code(), Code::Canceled);
    }

    #[tokio::test]
    async fn abandoned_request_reports_unavailable() {
        let (p, mut rx) = pending("r1", Duration::from_secs(5));
        drop(p);
        let chunk = rx.recv().await.unwrap();
        assert_eq!(chunk.status().unwrap().code, Code::Unavailable);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn finished_request_just_closes() {
        let (mut p, mut rx) = pending("r1", Duration::from_secs(5));
        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(chunk) = rx.recv().await {
                seen.push(chunk);
            }
            seen
        });
        p.deliver(DispatcherResponse::chunk("m1", "r1", Default::default()))
            .await
            .unwrap();
        assert_eq!(p.delivered(), 1);
        p.finish();
        let seen = reader.await.unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].response().is_some());
    }

    #[tokio::test]
    async fn handoff_buffers_at_most_one_chunk() {
        let (mut p, mut rx) = pending("r1", Duration::from_secs(5));
        // nobody is reading yet, the single slot takes it
        p.deliver(DispatcherResponse::chunk("m1", "r1", Default::default()))
            .await
            .unwrap();
        let blocked = time::timeout(
            Duration::from_millis(50),
            p.deliver(DispatcherResponse::chunk("m1", "r1", Default::default())),
        )
        .await;
        assert!(blocked.is_err());
        assert_eq!(p.delivered(), 1);

        rx.recv().await.unwrap();
        p.deliver(DispatcherResponse::chunk("m1", "r1", Default::default()))
            .await
            .unwrap();
        assert_eq!(p.delivered(), 2);
        p.finish();
    }

    #[tokio::test]
    async fn deliver_gives_up_at_deadline() {
        let (mut p, _rx) = pending("r1", Duration::from_millis(50));
        // fill the single slot so the second send has to wait
        p.deliver(DispatcherResponse::chunk("m1", "r1", Default::default()))
            .await
            .unwrap();
        let err = p
            .deliver(DispatcherResponse::chunk("m1", "r1", Default::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }
}
