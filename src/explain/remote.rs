use std::env;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::blocking::Client;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};

use super::{ExplanationProvider, ExplanationRequest};
use crate::config::ExplainConfig;
use crate::error::PipelineError;

pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";
const PROVIDER: &str = "openrouter";

/// Vision-language provider speaking the OpenRouter chat-completions wire
/// format. Images travel as base64 data URIs inside the user message.
pub struct RemoteProvider {
    http: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl RemoteProvider {
    /// The API key is read from the environment; a missing key surfaces as
    /// a configuration error on the first `explain` call so the fallback
    /// chain can move on.
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
            base_url: config.remote_base.trim_end_matches('/').to_string(),
            model: config.remote_model.clone(),
            api_key: env::var(API_KEY_ENV).ok().filter(|key| !key.is_empty()),
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

impl ExplanationProvider for RemoteProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn explain(&self, request: &ExplanationRequest) -> Result<String, PipelineError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| PipelineError::Config(format!("{API_KEY_ENV} is not set")))?;

        let mut content = vec![
            ContentPart::Text {
                text: &request.prompt,
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: data_uri(request.original_mime, &request.original),
                },
            },
        ];
        if let Some(overlay) = &request.overlay_png {
            content.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: data_uri("image/png", overlay),
                },
            });
        }
        let payload = ChatRequest {
            model: &self.model,
            messages: vec![Message {
                role: "user",
                content,
            }],
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header(AUTHORIZATION, format!("Bearer {api_key}"))
            .header("HTTP-Referer", "http://localhost")
            .header("X-Title", "truthlens")
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
                detail: format!("unexpected status {status}: {}", snippet(&body)),
            });
        }

        let parsed: ChatResponse = response.json().map_err(|err| PipelineError::Provider {
            provider: PROVIDER,
            detail: format!("unreadable response: {err}"),
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| PipelineError::Provider {
                provider: PROVIDER,
                detail: "response contained no choices".into(),
            })
    }
}

fn data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

fn snippet(body: &str) -> String {
    body.chars().take(300).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serializes_to_the_openrouter_shape() {
        let payload = ChatRequest {
            model: "test-model",
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentPart::Text { text: "hello" },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: data_uri("image/png", &[1, 2, 3]),
                        },
                    },
                ],
            }],
        };
        let json = serde_json::to_string(&payload).expect("serialize");
        assert!(json.contains(r#""type":"text""#));
        assert!(json.contains(r#""type":"image_url""#));
        assert!(json.contains(r#""url":"data:image/png;base64,AQID""#));
        assert!(json.contains(r#""role":"user""#));
    }

    #[test]
    fn response_content_deserializes() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"analysis text"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).expect("parse");
        assert_eq!(parsed.choices[0].message.content, "analysis text");
    }

    #[test]
    fn missing_api_key_fails_before_any_request() {
        let provider = RemoteProvider {
            http: Client::new(),
            base_url: "https://example.invalid/api/v1".into(),
            model: "m".into(),
            api_key: None,
        };
        let request = ExplanationRequest {
            prompt: "p".into(),
            original: vec![0],
            original_mime: "image/png",
            overlay_png: None,
        };
        let err = provider.explain(&request).expect_err("should fail");
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(err.to_string().contains(API_KEY_ENV));
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(1000);
        assert_eq!(snippet(&body).len(), 300);
    }
}
