//! Client for the external AI vision endpoint.
//!
//! The endpoint fetches the image itself, so the URL passed in must be
//! reachable and unexpired at call time.

use crate::{config::VisionConfig, models::uploaded_file::ImageAnalysis};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::{collections::HashSet, time::Duration};
use thiserror::Error;
use tracing::debug;

const PROMPT: &str = "Describe this image for a photo library. Reply with JSON only, \
shaped as {\"caption\": string, \"tags\": [string]}. The caption is one sentence; \
give at most ten short lowercase tags.";
const MAX_TOKENS: u32 = 300;

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("vision request failed: {0}")]
    Request(String),
    #[error("vision service rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("vision service returned an unusable reply: {0}")]
    BadReply(String),
}

#[async_trait]
pub trait VisionClient: Send + Sync {
    /// Produce a caption and tags for the image behind `image_url`.
    async fn describe(&self, image_url: &str) -> Result<ImageAnalysis, VisionError>;
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiVision {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct CaptionReply {
    caption: String,
    #[serde(default)]
    tags: Vec<String>,
}

impl OpenAiVision {
    pub fn new(config: &VisionConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client for vision API")?;

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.api_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl VisionClient for OpenAiVision {
    async fn describe(&self, image_url: &str) -> Result<ImageAnalysis, VisionError> {
        let request_body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": PROMPT },
                    { "type": "image_url", "image_url": { "url": image_url } }
                ]
            }]
        });

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|err| VisionError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(VisionError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|err| VisionError::BadReply(err.to_string()))?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| VisionError::BadReply("no message content".into()))?;

        debug!("vision reply: {}", content);
        parse_reply(&content, &self.model)
    }
}

/// Accept strict JSON, JSON wrapped in a markdown fence, or plain prose.
fn parse_reply(content: &str, model: &str) -> Result<ImageAnalysis, VisionError> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    if unfenced.is_empty() {
        return Err(VisionError::BadReply("empty caption".into()));
    }

    let (caption, tags) = match serde_json::from_str::<CaptionReply>(unfenced) {
        Ok(reply) => (reply.caption, reply.tags),
        Err(_) => (unfenced.to_string(), Vec::new()),
    };

    let mut seen = HashSet::new();
    let tags: Vec<String> = tags
        .into_iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty() && seen.insert(tag.clone()))
        .collect();

    Ok(ImageAnalysis {
        caption: caption.trim().to_string(),
        tags,
        model: model.to_string(),
    })
}
