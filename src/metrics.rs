use lazy_static::lazy_static;
use prometheus::{
    HistogramVec, IntCounterVec, IntGaugeVec, register_histogram_vec, register_int_counter_vec,
    register_int_gauge_vec,
};
use std::time::Instant;

use crate::error::DispatchError;

lazy_static! {
    pub static ref OUTSTANDING_REQUESTS: IntGaugeVec = register_int_gauge_vec!(
        "dispatcher_outstanding_requests",
        "Calls currently in flight",
        &["operation", "model"]
    )
    .unwrap();
    pub static ref FAILED_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "dispatcher_failed_requests_total",
        "Calls that ended with an error",
        &["operation", "model", "error"]
    )
    .unwrap();
    pub static ref REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "dispatcher_request_duration_seconds",
        "Call duration in seconds",
        &["operation", "model", "error"]
    )
    .unwrap();
    pub static ref QUEUE_DEPTH: IntGaugeVec = register_int_gauge_vec!(
        "dispatcher_queue_depth",
        "Pending requests waiting in a model queue",
        &["model"]
    )
    .unwrap();
    pub static ref RELAYED_CHUNKS: IntCounterVec = register_int_counter_vec!(
        "dispatcher_relayed_chunks_total",
        "Response chunks relayed from agents to callers",
        &["model"]
    )
    .unwrap();
}

/// Model label for calls naming a model that is not configured.
pub const UNKNOWN_MODEL: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Generate,
    GenerateStream,
    DoWork,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Generate => "Generate",
            Operation::GenerateStream => "GenerateStream",
            Operation::DoWork => "DoWork",
        }
    }
}

/// Tracks one call from entry to exit.
///
/// Entry bumps the outstanding gauge; drop lowers it and records duration and
/// failures. A guard dropped before `succeed`/`fail` counts as canceled.
#[derive(Debug)]
pub struct CallGuard {
    operation: Operation,
    model: String,
    started: Instant,
    outcome: Option<&'static str>,
}

impl CallGuard {
    pub fn new(operation: Operation, model: &str) -> Self {
        OUTSTANDING_REQUESTS
            .with_label_values(&[operation.as_str(), model])
            .inc();
        Self {
            operation,
            model: model.to_string(),
            started: Instant::now(),
            outcome: None,
        }
    }

    pub fn succeed(&mut self) {
        self.outcome.get_or_insert("");
    }

    /// Records the failure and hands the error back for propagation.
    pub fn fail(&mut self, err: DispatchError) -> DispatchError {
        self.outcome.get_or_insert(err.label());
        err
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        let op = self.operation.as_str();
        OUTSTANDING_REQUESTS
            .with_label_values(&[op, self.model.as_str()])
            .dec();

        let label = self.outcome.unwrap_or("canceled");
        if !label.is_empty() {
            FAILED_REQUESTS
                .with_label_values(&[op, self.model.as_str(), label])
                .inc();
        }
        REQUEST_DURATION
            .with_label_values(&[op, self.model.as_str(), label])
            .observe(self.started.elapsed().as_secs_f64());
    }
}
