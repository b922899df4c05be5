use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::health::HealthState;
use crate::queue::ModelQueueRegistry;
use crate::worker::WorkHandler;

// app's shared state
pub struct AppState {
    pub registry: Arc<ModelQueueRegistry>,
    pub dispatcher: Dispatcher,
    pub work_handler: Arc<WorkHandler>,
    pub health: Arc<HealthState>,
    pub shutdown: CancellationToken, // stop taking new work
    pub abort: CancellationToken,    // cancel everything in flight
}
