use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use inference_dispatcher::DispatcherServer;
use inference_dispatcher::agent::{Agent, AgentConfig, OllamaBackend, WsDispatcherClient};
use inference_dispatcher::config::{AgentArgs, Args, Command, DispatcherArgs, DispatcherConfig};

// this is main async function with tokio
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // parse cli arguments
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    match &args.command {
        Command::Dispatcher(dispatcher) => run_dispatcher(dispatcher).await,
        Command::Agent(agent) => run_agent(agent).await,
    }
}

async fn run_dispatcher(args: &DispatcherArgs) -> anyhow::Result<()> {
    let config = DispatcherConfig::from(args);
    let server = Arc::new(DispatcherServer::new(&config).context("invalid dispatcher configuration")?);

    let addr = format!("0.0.0.0:{}", config.listen_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("could not bind {addr}"))?;

    info!(
        models = ?config.supported_models,
        backlog = config.backlog_size,
        default_timeout = ?config.default_generate_stream_timeout,
        "dispatcher configured"
    );

    let stopper = server.clone();
    let grace = config.shutdown_grace_period;
    tokio::spawn(async move {
        shutdown_signal().await;
        stopper.stop(true);
        tokio::time::sleep(grace).await;
        stopper.stop(false);
    });

    server.run(listener).await.context("dispatcher server failed")
}

async fn run_agent(args: &AgentArgs) -> anyhow::Result<()> {
    let config = AgentConfig::from(args);
    let backend = Arc::new(OllamaBackend::new(&args.backend_url, config.model.clone()));
    let client = Arc::new(WsDispatcherClient::new(args.dispatcher_url.clone()));

    info!(
        dispatcher = %args.dispatcher_url,
        backend = %args.backend_url,
        "agent configured"
    );

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    Agent::new(config, client, backend).run(shutdown).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
