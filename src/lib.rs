//! Inference dispatcher: admits generation requests per model, queues them,
//! and hands each one to the next worker agent that asks for work for that
//! model, streaming the agent's output back to the caller.

pub mod agent;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod server;
pub mod state;
pub mod worker;

pub use dispatcher::{CallContext, Dispatcher, ResponseStream};
pub use error::{Code, ConfigError, DispatchError, Status};
pub use server::DispatcherServer;
