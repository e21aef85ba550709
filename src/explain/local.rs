use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use super::{ExplanationProvider, ExplanationRequest};
use crate::config::ExplainConfig;
use crate::error::PipelineError;

const PROVIDER: &str = "ollama";

/// Local vision-language fallback served by an Ollama daemon. Images are
/// attached as plain base64 strings on the chat message.
pub struct LocalProvider {
    http: Client,
    base_url: String,
    model: String,
}

impl LocalProvider {
    pub fn new(config: &ExplainConfig) -> Result<Self, PipelineError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| PipelineError::Provider {
                provider: PROVIDER,
                detail: err.to_string(),
            })?;
        Ok(Self {
            http,
            base_url: config.local_base.trim_end_matches('/').to_string(),
            model: config.local_model.clone(),
        })
    }
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct OllamaMessage<'a> {
    role: &'a str,
    content: &'a str,
    images: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

impl ExplanationProvider for LocalProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn explain(&self, request: &ExplanationRequest) -> Result<String, PipelineError> {
        let mut images = vec![BASE64.encode(&request.original)];
        if let Some(overlay) = &request.overlay_png {
            images.push(BASE64.encode(overlay));
        }
        let payload = OllamaRequest {
            model: &self.model,
            messages: vec![OllamaMessage {
                role: "user",
                content: &request.prompt,
                images,
            }],
            stream: false,
        };

        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&payload)
            .send()
            .map_err(|err| PipelineError::Provider {
                provider: PROVIDER,
                detail: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(PipelineError::Provider {
                provider: PROVIDER,
                detail: format!("unexpected status {status}: {body}"),
            });
        }

        let parsed: OllamaResponse = response.json().map_err(|err| PipelineError::Provider {
            provider: PROVIDER,
            detail: format!("unreadable response: {err}"),
        })?;
        Ok(parsed.message.content)
    }
}
