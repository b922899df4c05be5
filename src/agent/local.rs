use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{AgentError, DispatcherClient, WorkSession};
use crate::models::{DispatcherRequest, DispatcherResponse};
use crate::worker::{ChannelWorkStream, WorkHandler};

/// Runs `DoWork` exchanges against a work handler in the same process.
pub struct LocalDispatcherClient {
    handler: Arc<WorkHandler>,
    shutdown: CancellationToken,
    abort: CancellationToken,
}

impl LocalDispatcherClient {
    pub fn new(handler: Arc<WorkHandler>, shutdown: CancellationToken, abort: CancellationToken) -> Self {
        Self {
            handler,
            shutdown,
            abort,
        }
    }
}

#[async_trait]
impl DispatcherClient for LocalDispatcherClient {
    async fn do_work(&self) -> Result<Box<dyn WorkSession>, AgentError> {
        if self.shutdown.is_cancelled() {
            return Err(AgentError::Connect("dispatcher is shutting down".to_string()));
        }

        let (to_dispatcher, inbound) = mpsc::channel(16);
        let (outbound, from_dispatcher) = mpsc::channel(1);
        let mut stream = ChannelWorkStream::new(inbound, outbound);

        let handler = self.handler.clone();
        let shutdown = self.shutdown.clone();
        let abort = self.abort.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.do_work(&mut stream, &shutdown, &abort).await {
                debug!(error = %e, "local work exchange ended with error");
            }
        });

        Ok(Box::new(ChannelWorkSession {
            to_dispatcher: Some(to_dispatcher),
            from_dispatcher,
        }))
    }
}

struct ChannelWorkSession {
    to_dispatcher: Option<mpsc::Sender<DispatcherResponse>>,
    from_dispatcher: mpsc::Receiver<DispatcherRequest>,
}

#[async_trait]
impl WorkSession for ChannelWorkSession {
    async fn send(&mut self, message: DispatcherResponse) -> Result<(), AgentError> {
        let tx = self
            .to_dispatcher
            .as_ref()
            .ok_or_else(|| AgentError::Transport("session already closed".to_string()))?;
        tx.send(message)
            .await
            .map_err(|_| AgentError::Transport("dispatcher stopped reading".to_string()))
    }

    async fn recv(&mut self) -> Result<Option<DispatcherRequest>, AgentError> {
        Ok(self.from_dispatcher.recv().await)
    }

    async fn close(&mut self) -> Result<(), AgentError> {
        self.to_dispatcher.take();
        Ok(())
    }
}
