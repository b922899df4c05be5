use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{BackendError, BackendStream, InferenceBackend};
use crate::models::{GenerateRequest, GenerateResponse};

// Ollama /api/generate request body
#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions<'a>,
}

#[derive(Serialize)]
struct OllamaOptions<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repeat_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
}

// One NDJSON line of the streamed reply
#[derive(Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

/// Streams generations from an Ollama-compatible server.
pub struct OllamaBackend {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(base_url: &str, model: impl Into<String>) -> Self {
        // add http:// if not present
        let base = if base_url.starts_with("http") {
            base_url.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", base_url.trim_end_matches('/'))
        };
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/api/generate", base),
            model: model.into(),
        }
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    async fn generate_stream(
        &self,
        request: GenerateRequest,
        timeout: Option<Duration>,
    ) -> Result<BackendStream, BackendError> {
        let params = &request.params;
        let body = OllamaRequest {
            model: &self.model,
            prompt: &request.prompt,
            stream: true,
            options: OllamaOptions {
                num_predict: params.max_new_tokens,
                temperature: params.temperature,
                top_p: params.top_p,
                top_k: params.top_k,
                repeat_penalty: params.repetition_penalty,
                seed: params.seed,
                stop: &params.stop_sequences,
            },
        };

        let mut call = self.client.post(&self.url).json(&body);
        if let Some(timeout) = timeout {
            call = call.timeout(timeout);
        }
        let res = call
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status().as_u16();
            let message = res.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, message });
        }

        Ok(split_lines(res.bytes_stream(), parse_line).boxed())
    }
}

fn parse_line(line: &[u8]) -> Result<GenerateResponse, BackendError> {
    let chunk: OllamaChunk =
        serde_json::from_slice(line).map_err(|e| BackendError::Decode(e.to_string()))?;
    if let Some(error) = chunk.error {
        return Err(BackendError::Inference(error));
    }
    Ok(GenerateResponse {
        text: chunk.response,
        generated_text: None,
        finish_reason: if chunk.done { chunk.done_reason } else { None },
        generated_tokens: chunk.eval_count,
    })
}

/// Turns a byte stream into one item per newline-terminated line.
/// A trailing line without a newline is still emitted.
fn split_lines<S, B, E, T, F>(
    bytes: S,
    parse: F,
) -> impl Stream<Item = Result<T, BackendError>> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    T: Send + 'static,
    F: Fn(&[u8]) -> Result<T, BackendError> + Send + 'static,
{
    let state = (Box::pin(bytes), Vec::<u8>::new(), false, parse);
    futures::stream::unfold(state, |(mut bytes, mut buf, mut done, parse)| async move {
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = line.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                let item = parse(line);
                return Some((item, (bytes, buf, done, parse)));
            }
            if done {
                let rest = std::mem::take(&mut buf);
                let rest = rest.trim_ascii();
                if rest.is_empty() {
                    return None;
                }
                let item = parse(rest);
                return Some((item, (bytes, buf, done, parse)));
            }
            match bytes.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    buf.clear();
                    done = true;
                    let err = BackendError::Request(e.to_string());
                    return Some((Err(err), (bytes, buf, done, parse)));
                }
                None => done = true,
            }
        }
    })
}
