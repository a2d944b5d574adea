//! LLM responders that turn a customer message plus retrieved context into
//! a [`BotReply`].
//!
//! The reply is typed: whether the customer asked for a human travels in
//! [`BotReply::wants_human`], never as a marker inside the text.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ResponderConfig;

/// What the bot says, and whether the customer should be handed off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotReply {
    pub text: String,
    pub wants_human: bool,
}

impl BotReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            wants_human: false,
        }
    }
}

#[async_trait]
pub trait Responder: Send + Sync {
    fn name(&self) -> &str;
    /// Answer `message` using `context` (possibly empty).
    async fn reply(&self, message: &str, context: &str) -> Result<BotReply>;
}

pub fn create_responder(config: &ResponderConfig) -> Result<Arc<dyn Responder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledResponder)),
        "openai" => Ok(Arc::new(OpenAIResponder::new(config)?)),
        other => bail!("Unknown responder provider: {}", other),
    }
}

/// Always fails, so the conversation flow sends its fallback reply.
pub struct DisabledResponder;

#[async_trait]
impl Responder for DisabledResponder {
    fn name(&self) -> &str {
        "disabled"
    }
    async fn reply(&self, _message: &str, _context: &str) -> Result<BotReply> {
        bail!("Responder is disabled")
    }
}

const SYSTEM_PROMPT: &str = "You are a customer support assistant for a business page. \
Answer using only the provided knowledge. If the knowledge does not cover the question, \
say so briefly. Respond with a JSON object: {\"reply\": string, \"wants_human\": boolean}. \
Set wants_human to true only when the customer asks to talk to a person.";

/// Chat-completions responder in JSON mode.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIResponder {
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIResponder {
    pub fn new(config: &ResponderConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model: config.model.clone(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl Responder for OpenAIResponder {
    fn name(&self) -> &str {
        &self.model
    }

    async fn reply(&self, message: &str, context: &str) -> Result<BotReply> {
        let knowledge = if context.is_empty() {
            "(no relevant knowledge found)"
        } else {
            context
        };
        let body = serde_json::json!({
            "model": self.model,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "system", "content": format!("Knowledge:\n{}", knowledge) },
                { "role": "user", "content": message },
            ],
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        parse_completion(&json)
    }
}

#[derive(Deserialize)]
struct ReplyPayload {
    reply: String,
    #[serde(default)]
    wants_human: bool,
}

fn parse_completion(json: &serde_json::Value) -> Result<BotReply> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing message content"))?;
    let payload: ReplyPayload =
        serde_json::from_str(content).context("responder did not return the expected JSON")?;
    if payload.reply.trim().is_empty() {
        bail!("responder returned an empty reply");
    }
    Ok(BotReply {
        text: payload.reply,
        wants_human: payload.wants_human,
    })
}
