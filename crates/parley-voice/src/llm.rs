//! Reasoning backend: OpenAI-compatible chat completions (DeepSeek by default).

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const SUMMARY_INSTRUCTION: &str = "Summarize the key facts of the following conversation in \
    at most three sentences. Keep names, numbers and open questions. Reply with the summary only.";

/// Message role on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Conversational language model. Calls are blocking.
pub trait ReasoningBackend: Send + Sync {
    /// Produce the assistant reply to `messages`.
    fn complete(&self, messages: &[ChatMessage]) -> VoiceResult<String>;

    /// Compress `messages` into a short summary used in place of older turns.
    fn summarize(&self, messages: &[ChatMessage]) -> VoiceResult<String> {
        let prompt = summary_prompt(messages);
        self.complete(&[ChatMessage::user(prompt)])
    }
}

/// Flatten a conversation into a single summarization request.
pub fn summary_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::from(SUMMARY_INSTRUCTION);
    prompt.push_str("\n\n");
    for message in messages {
        let speaker = match message.role {
            ChatRole::System => "Context",
            ChatRole::User => "User",
            ChatRole::Assistant => "Assistant",
        };
        prompt.push_str(speaker);
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt.push_str("\nSummary:");
    prompt
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL without trailing slash
    pub api_url: String,
    /// Bearer API key; resolved from the environment when unset
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.deepseek.com".to_string(),
            api_key: None,
            model: "deepseek-chat".to_string(),
            temperature: Some(0.7),
            max_tokens: Some(512),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// `/chat/completions` client for DeepSeek, OpenAI, OpenRouter or any compatible server.
#[derive(Debug, Clone)]
pub struct ChatCompletionsBackend {
    base_url: String,
    api_key: String,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    client: reqwest::blocking::Client,
}

impl ChatCompletionsBackend {
    pub fn new(config: &LlmConfig, timeout: Duration) -> VoiceResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| VoiceError::Config("LLM requires llm.api_key, LLM_API_KEY or DEEPSEEK_API_KEY".to_string()))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::Backend(e.to_string()))?;
        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl ReasoningBackend for ChatCompletionsBackend {
    fn complete(&self, messages: &[ChatMessage]) -> VoiceResult<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| VoiceError::Backend(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Backend(format!("LLM API error {}: {}", status, body)));
        }
        let data: ChatResponse = res.json().map_err(|e| VoiceError::Backend(e.to_string()))?;
        let content = data
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(VoiceError::Backend("Empty response from model".to_string()));
        }
        Ok(content)
    }
}
