use async_trait::async_trait;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use inference_dispatcher::{CallContext, Code, DispatcherServer};
use inference_dispatcher::agent::{
    Agent, AgentConfig, BackendError, BackendStream, InferenceBackend, WsDispatcherClient,
};
use inference_dispatcher::config::DispatcherConfig;
use inference_dispatcher::health::ServingStatus;
use inference_dispatcher::models::{DispatcherRequest, DispatcherResponse, GenerateRequest, GenerateResponse};

struct CountingBackend {
    chunks: usize,
}

#[async_trait]
impl InferenceBackend for CountingBackend {
    async fn generate_stream(
        &self,
        request: GenerateRequest,
        _timeout: Option<Duration>,
    ) -> Result<BackendStream, BackendError> {
        let items: Vec<_> = (0..self.chunks)
            .map(|i| Ok(GenerateResponse::text(format!("{} {i}", request.prompt))))
            .collect();
        Ok(futures::stream::iter(items).boxed())
    }
}

// Pauses before every chunk so a test can act mid-relay.
struct SlowBackend {
    chunks: usize,
    pause: Duration,
}

#[async_trait]
impl InferenceBackend for SlowBackend {
    async fn generate_stream(
        &self,
        _request: GenerateRequest,
        _timeout: Option<Duration>,
    ) -> Result<BackendStream, BackendError> {
        let pause = self.pause;
        let stream = futures::stream::iter(0..self.chunks).then(move |i| async move {
            tokio::time::sleep(pause).await;
            Ok::<_, BackendError>(GenerateResponse::text(format!("slow {i}")))
        });
        Ok(stream.boxed())
    }
}

struct TestServer {
    server: Arc<DispatcherServer>,
    addr: SocketAddr,
    handle: JoinHandle<std::io::Result<()>>,
    agents: CancellationToken,
}

impl TestServer {
    async fn start(models: &[&str], backlog: usize) -> Self {
        let models = models.iter().map(|m| m.to_string()).collect();
        let mut config = DispatcherConfig::new(models, backlog);
        config.health_check_interval = Duration::from_millis(50);
        let server = Arc::new(DispatcherServer::new(&config).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let runner = server.clone();
        let handle = tokio::spawn(async move { runner.run(listener).await });

        Self {
            server,
            addr,
            handle,
            agents: CancellationToken::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn spawn_agent(&self, model: &str, chunks: usize) {
        let client = WsDispatcherClient::new(format!("ws://{}/v1/work", self.addr));
        let mut config = AgentConfig::new(model, 2);
        config.retry_backoff = Duration::from_millis(10);
        config.max_retry_backoff = Duration::from_millis(50);
        let agent = Agent::new(config, Arc::new(client), Arc::new(CountingBackend { chunks }));
        tokio::spawn(agent.run(self.agents.clone()));
    }

    fn spawn_local_agent(&self, model: &str, backend: Arc<dyn InferenceBackend>) {
        let client = self.server.local_client();
        let agent = Agent::new(AgentConfig::new(model, 1), Arc::new(client), backend);
        tokio::spawn(agent.run(self.agents.clone()));
    }

    async fn stop(self) {
        self.agents.cancel();
        self.server.stop(false);
        let result = tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not stop");
        result.unwrap().unwrap();
    }
}

fn request(model: &str, id: &str, prompt: &str) -> DispatcherRequest {
    DispatcherRequest::new(model, GenerateRequest::new(prompt)).with_request_id(id)
}

#[tokio::test]
async fn generate_stream_over_http() {
    let server = TestServer::start(&["m1"], 10).await;
    server.spawn_agent("m1", 3);

    let response = reqwest::Client::new()
        .post(server.url("/v1/generate_stream"))
        .json(&request("m1", "r1", "mock text"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-request-id"], "r1");
    assert_eq!(response.headers()["content-type"], "application/x-ndjson");

    let body = response.text().await.unwrap();
    let chunks: Vec<DispatcherResponse> = body
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let texts: Vec<&str> = chunks
        .iter()
        .map(|c| c.response().unwrap().text.as_str())
        .collect();
    assert_eq!(texts, vec!["mock text 0", "mock text 1", "mock text 2"]);
    assert!(chunks.iter().all(|c| c.request_id == "r1" && c.model == "m1"));

    server.stop().await;
}

#[tokio::test]
async fn unary_generate_over_http() {
    let server = TestServer::start(&["m1"], 10).await;
    server.spawn_agent("m1", 2);

    let response: DispatcherResponse = reqwest::Client::new()
        .post(server.url("/v1/generate"))
        .json(&request("m1", "r7", "x"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response.request_id, "r7");
    assert_eq!(response.response().unwrap().text, "x 0x 1");

    server.stop().await;
}

#[tokio::test]
async fn admission_errors_map_to_http_codes() {
    let server = TestServer::start(&["m1"], 10).await;
    let client = reqwest::Client::new();

    let unknown = client
        .post(server.url("/v1/generate_stream"))
        .json(&request("no-such-model", "r1", "hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 404);
    let status: serde_json::Value = unknown.json().await.unwrap();
    assert_eq!(status["code"], "not_found");

    let bad_header = client
        .post(server.url("/v1/generate"))
        .header("x-request-timeout-ms", "soon")
        .json(&request("m1", "r1", "hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_header.status(), 400);

    // no agent is connected, so the caller's own deadline ends the call
    let expired = client
        .post(server.url("/v1/generate_stream"))
        .header("x-request-timeout-ms", "100")
        .json(&request("m1", "r2", "hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(expired.status(), 504);

    server.stop().await;
}

#[tokio::test]
async fn health_and_introspection_endpoints() {
    let server = TestServer::start(&["m1", "m2"], 10).await;
    let client = reqwest::Client::new();

    for path in ["/health", "/health/ready", "/health/live", "/health/startup", "/metrics"] {
        let response = client.get(server.url(path)).send().await.unwrap();
        assert_eq!(response.status(), 200, "{path}");
    }

    let live: serde_json::Value = client
        .get(server.url("/health/live"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(live["status"], "SERVING");

    let reflection: serde_json::Value = client
        .get(server.url("/reflection"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reflection["models"], serde_json::json!(["m1", "m2"]));

    server.stop().await;
}

#[tokio::test]
async fn graceful_stop_clears_readiness() {
    let server = TestServer::start(&["m1"], 10).await;
    assert_eq!(server.server.state().health.ready(), ServingStatus::Serving);

    server.server.stop(true);
    assert_eq!(server.server.state().health.ready(), ServingStatus::NotServing);
    assert!(server.server.state().shutdown.is_cancelled());
    assert!(!server.server.state().abort.is_cancelled());

    server.stop().await;
}

#[tokio::test]
async fn graceful_stop_lets_relaying_exchange_finish() {
    let server = TestServer::start(&["m1"], 10).await;
    let backend = SlowBackend {
        chunks: 3,
        pause: Duration::from_millis(50),
    };
    server.spawn_local_agent("m1", Arc::new(backend));

    let state = server.server.state().clone();
    let ctx = CallContext::new(state.abort.child_token());
    let mut stream = state
        .dispatcher
        .generate_stream(request("m1", "r1", "hi"), ctx)
        .await
        .unwrap();

    let first = stream.next().await.unwrap().unwrap();
    server.server.stop(true);

    let mut texts = vec![first.response().unwrap().text.clone()];
    while let Some(chunk) = stream.next().await {
        texts.push(chunk.unwrap().response().unwrap().text.clone());
    }
    assert_eq!(texts, ["slow 0", "slow 1", "slow 2"]);

    server.stop().await;
}

#[tokio::test]
async fn forced_stop_cancels_waiting_callers() {
    let server = TestServer::start(&["m1"], 10).await;

    let state = server.server.state().clone();
    let ctx = CallContext::new(state.abort.child_token());
    let mut stream = state
        .dispatcher
        .generate_stream(request("m1", "r1", "hi"), ctx)
        .await
        .unwrap();
    let waiter = tokio::spawn(async move { stream.next().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    server.server.stop(false);

    let outcome = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("caller was not released by the forced stop")
        .unwrap();
    assert_eq!(outcome.unwrap().unwrap_err().code(), Code::Canceled);

    server.stop().await;
}
