//! **Text-to-Speech** - the synthesizer boundary.
//!
//! [`OpenAiSynthesizer`] targets an OpenAI-compatible `/audio/speech` endpoint
//! (OpenAI, OpenRouter, local servers).

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Voice parameters that, together with the text, identify a synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceParams {
    /// alloy, echo, fable, onyx, nova, shimmer, ...
    pub voice: String,
    /// tts-1 (fast) or tts-1-hd (higher quality)
    pub model: String,
    /// Playback speed, 0.25..=4.0
    pub speed: f32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            voice: "alloy".to_string(),
            model: "tts-1".to_string(),
            speed: 1.0,
        }
    }
}

/// Backend that turns text into encoded audio bytes (WAV or MP3).
pub trait Synthesizer: Send + Sync {
    fn synthesize(&self, text: &str, params: &VoiceParams) -> VoiceResult<Vec<u8>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// When false, replies are text-only and nothing is synthesized
    pub enabled: bool,
    pub api_url: String,
    /// Bearer API key; resolved from the environment when unset
    pub api_key: Option<String>,
    /// Requested container: "wav" or "mp3"
    pub format: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            format: "wav".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiSynthesizer {
    base_url: String,
    api_key: String,
    format: String,
    client: reqwest::blocking::Client,
}

impl OpenAiSynthesizer {
    pub fn new(config: &TtsConfig, timeout: Duration) -> VoiceResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| VoiceError::Config("TTS requires tts.api_key, TTS_API_KEY or OPENAI_API_KEY".to_string()))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
            format: config.format.clone(),
            client,
        })
    }
}

impl Synthesizer for OpenAiSynthesizer {
    fn synthesize(&self, text: &str, params: &VoiceParams) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url);
        let body = serde_json::json!({
            "model": params.model,
            "input": text,
            "voice": params.voice,
            "speed": params.speed,
            "response_format": self.format,
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Synthesis(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
