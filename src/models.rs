use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::Status;

// Sampling parameters forwarded untouched to the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default)]
    pub do_sample: bool,
}

// Generation payload: prompt + parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub params: GenerateParams,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            params: GenerateParams::default(),
        }
    }
}

// One generated chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_tokens: Option<u32>,
}

impl GenerateResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Caller-facing request; also the message the dispatcher sends to an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatcherRequest {
    #[serde(default)]
    pub request_id: String,
    pub model: String,
    #[serde(default)]
    pub request: Option<GenerateRequest>,
    /// Remaining budget, set by the dispatcher right before dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl DispatcherRequest {
    pub fn new(model: impl Into<String>, request: GenerateRequest) -> Self {
        Self {
            model: model.into(),
            request: Some(request),
            ..Default::default()
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Either a generated chunk or an error status that ends the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkResult {
    Response(GenerateResponse),
    Status(Status),
}

/// Chunk streamed back to the caller. Agents also use it, without a
/// `result`, to announce the model they serve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatcherResponse {
    pub model: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ChunkResult>,
}

impl DispatcherResponse {
    pub fn announce(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn chunk(
        model: impl Into<String>,
        request_id: impl Into<String>,
        response: GenerateResponse,
    ) -> Self {
        Self {
            model: model.into(),
            request_id: request_id.into(),
            result: Some(ChunkResult::Response(response)),
        }
    }

    pub fn failure(model: impl Into<String>, request_id: impl Into<String>, status: Status) -> Self {
        Self {
            model: model.into(),
            request_id: request_id.into(),
            result: Some(ChunkResult::Status(status)),
        }
    }

    pub fn response(&self) -> Option<&GenerateResponse> {
        match &self.result {
            Some(ChunkResult::Response(response)) => Some(response),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<&Status> {
        match &self.result {
            Some(ChunkResult::Status(status)) => Some(status),
            _ => None,
        }
    }
}

// Request id = hash of a random seed. Only needs to be unique enough for logs.
pub fn generate_request_id() -> String {
    let seed: u64 = rand::random();
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;

    #[test]
    fn announcement_has_no_result() {
        let json = serde_json::to_value(DispatcherResponse::announce("m1")).unwrap();
        assert_eq!(json, serde_json::json!({"model": "m1", "request_id": ""}));
    }

    #[test]
    fn status_chunk_is_tagged() {
        let chunk = DispatcherResponse::failure("m1", "r1", Status::new(Code::Internal, "boom"));
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["result"]["status"]["code"], "internal");
        assert!(chunk.response().is_none());
        assert_eq!(chunk.status().map(|s| s.message.as_str()), Some("boom"));
    }

    #[test]
    fn request_without_payload_parses() {
        let req: DispatcherRequest = serde_json::from_str(r#"{"model":"m1"}"#).unwrap();
        assert!(req.request.is_none());
        assert!(req.request_id.is_empty());
        assert_eq!(req.timeout(), None);
    }

    #[test]
    fn generated_ids_are_hex_and_distinct() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
