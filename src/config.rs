use clap::{Parser, Subcommand};
use std::time::Duration;

use crate::agent::AgentConfig;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "inference-dispatcher")]
#[command(about = "Queues generation requests per model and hands them to worker agents")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    // Log filter, RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the dispatcher service
    Dispatcher(DispatcherArgs),
    /// Run a worker agent in front of a local inference backend
    Agent(AgentArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct DispatcherArgs {
    // Port to run the server on
    #[arg(short = 'p', long, default_value_t = 8080, env = "DISPATCHER_LISTEN_PORT")]
    pub listen_port: u16,

    // Supported models (comma-separated), e.g. "llama-3-8b,mistral-7b"
    #[arg(short = 'm', long, value_delimiter = ',', required = true, env = "DISPATCHER_SUPPORTED_MODELS")]
    pub supported_models: Vec<String>,

    // Per-model queue capacity
    #[arg(short = 'b', long, default_value_t = 100)]
    pub backlog_size: usize,

    // Timeout in seconds for callers that send no deadline
    #[arg(long, default_value_t = 60)]
    pub default_generate_stream_timeout: u64,

    // Health check interval in seconds
    #[arg(long, default_value_t = 5)]
    pub health_interval: u64,

    // Seconds in-flight calls get to finish on shutdown
    #[arg(long, default_value_t = 30)]
    pub shutdown_grace_period: u64,
}

#[derive(clap::Args, Debug, Clone)]
pub struct AgentArgs {
    // Dispatcher work endpoint
    #[arg(short, long, default_value = "ws://localhost:8080/v1/work", env = "AGENT_DISPATCHER_URL")]
    pub dispatcher_url: String,

    // Model this agent serves
    #[arg(short, long, env = "AGENT_MODEL")]
    pub model: String,

    // Ollama-compatible backend
    #[arg(long, default_value = "http://localhost:11434", env = "AGENT_BACKEND_URL")]
    pub backend_url: String,

    // Concurrent requests this agent takes
    #[arg(short, long, default_value_t = 1)]
    pub capacity: usize,

    // First retry delay after a dispatcher failure, in milliseconds
    #[arg(long, default_value_t = 500)]
    pub retry_backoff_ms: u64,

    // Upper bound for the retry delay, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    pub max_retry_backoff_ms: u64,
}

/// Settings the dispatcher core is built from.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub listen_port: u16,
    pub supported_models: Vec<String>,
    pub backlog_size: usize,
    pub default_generate_stream_timeout: Duration,
    pub health_check_interval: Duration,
    pub shutdown_grace_period: Duration,
}

impl DispatcherConfig {
    pub fn new(supported_models: Vec<String>, backlog_size: usize) -> Self {
        Self {
            listen_port: 8080,
            supported_models,
            backlog_size,
            default_generate_stream_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(5),
            shutdown_grace_period: Duration::from_secs(30),
        }
    }
}

impl From<&DispatcherArgs> for DispatcherConfig {
    fn from(args: &DispatcherArgs) -> Self {
        Self {
            listen_port: args.listen_port,
            supported_models: args
                .supported_models
                .iter()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect(),
            backlog_size: args.backlog_size,
            default_generate_stream_timeout: Duration::from_secs(args.default_generate_stream_timeout),
            health_check_interval: Duration::from_secs(args.health_interval),
            shutdown_grace_period: Duration::from_secs(args.shutdown_grace_period),
        }
    }
}

impl From<&AgentArgs> for AgentConfig {
    fn from(args: &AgentArgs) -> Self {
        Self {
            model: args.model.clone(),
            capacity: args.capacity.max(1),
            retry_backoff: Duration::from_millis(args.retry_backoff_ms),
            max_retry_backoff: Duration::from_millis(args.max_retry_backoff_ms.max(args.retry_backoff_ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dispatcher_flags() {
        let args = Args::try_parse_from([
            "inference-dispatcher",
            "dispatcher",
            "--supported-models",
            "m1, m2",
            "--backlog-size",
            "10",
        ])
        .unwrap();
        let Command::Dispatcher(dispatcher) = args.command else {
            panic!("expected dispatcher subcommand");
        };
        let config = DispatcherConfig::from(&dispatcher);
        assert_eq!(config.supported_models, ["m1", "m2"]);
        assert_eq!(config.backlog_size, 10);
        assert_eq!(config.default_generate_stream_timeout, Duration::from_secs(60));
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn agent_capacity_is_at_least_one() {
        let args = Args::try_parse_from([
            "inference-dispatcher",
            "agent",
            "--model",
            "m1",
            "--capacity",
            "0",
        ])
        .unwrap();
        let Command::Agent(agent) = args.command else {
            panic!("expected agent subcommand");
        };
        let config = AgentConfig::from(&agent);
        assert_eq!(config.capacity, 1);
        assert_eq!(config.retry_backoff, Duration::from_millis(500));
    }
}
