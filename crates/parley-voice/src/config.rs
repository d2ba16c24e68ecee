//! Configuration: one immutable value resolved at startup.
//!
//! Sources, later overriding earlier: built-in defaults, an optional TOML file
//! (`PARLEY_CONFIG`, default `config/parley`), then `PARLEY__<SECTION>__<KEY>`
//! environment variables. API keys fall back to the conventional variables.

use crate::audio::AudioConfig;
use crate::cache::CacheConfig;
use crate::conversation::ConversationConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::llm::LlmConfig;
use crate::orchestrator::TurnTakingConfig;
use crate::playback::PlaybackConfig;
use crate::recognition::RecognitionConfig;
use crate::segmenter::SegmenterConfig;
use crate::stt::SttConfig;
use crate::tts::TtsConfig;
use crate::vad::VadConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

const DEFAULT_CONFIG_PATH: &str = "config/parley";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Verbose logging
    pub debug: bool,
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub segmenter: SegmenterConfig,
    pub recognition: RecognitionConfig,
    pub conversation: ConversationConfig,
    pub playback: PlaybackConfig,
    pub cache: CacheConfig,
    pub turn_taking: TurnTakingConfig,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
}

/// Upper bound on consecutive input read retries before capture degrades.
const MAX_READ_RETRIES: u32 = 10;

fn first_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

impl VoiceConfig {
    /// Load from `PARLEY_CONFIG` (default `config/parley`) and the environment.
    pub fn load() -> VoiceResult<Self> {
        let path = std::env::var("PARLEY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load from a specific file (missing is fine) and the environment.
    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let built = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: VoiceConfig = built.try_deserialize()?;
        config.resolve_credentials();
        config.validate()?;
        Ok(config)
    }

    /// Fill unset API keys from `STT_API_KEY`/`OPENAI_API_KEY`,
    /// `LLM_API_KEY`/`DEEPSEEK_API_KEY` and `TTS_API_KEY`/`OPENAI_API_KEY`.
    pub fn resolve_credentials(&mut self) {
        if self.stt.api_key.is_none() {
            self.stt.api_key = first_env(&["STT_API_KEY", "OPENAI_API_KEY"]);
        }
        if self.llm.api_key.is_none() {
            self.llm.api_key = first_env(&["LLM_API_KEY", "DEEPSEEK_API_KEY"]);
        }
        if self.tts.api_key.is_none() {
            self.tts.api_key = first_env(&["TTS_API_KEY", "OPENAI_API_KEY"]);
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> VoiceResult<()> {
        if ![8000, 16000, 32000, 48000].contains(&self.audio.sample_rate) {
            return Err(VoiceError::Config(format!(
                "audio.sample_rate must be 8000, 16000, 32000 or 48000, got {}",
                self.audio.sample_rate
            )));
        }
        if ![10, 20, 30].contains(&self.audio.frame_ms) {
            return Err(VoiceError::Config(format!(
                "audio.frame_ms must be 10, 20 or 30, got {}",
                self.audio.frame_ms
            )));
        }
        if self.vad.mode > 3 {
            return Err(VoiceError::Config(format!("vad.mode must be 0-3, got {}", self.vad.mode)));
        }
        if self.segmenter.silence_timeout_ms == 0 {
            return Err(VoiceError::Config("segmenter.silence_timeout_ms must be positive".into()));
        }
        let conv = &self.conversation;
        if conv.keep_recent == 0 || conv.keep_recent + 2 > conv.max_history {
            return Err(VoiceError::Config(format!(
                "conversation.keep_recent ({}) must be at least 1 and leave room for a summary and a new turn within max_history ({})",
                conv.keep_recent, conv.max_history
            )));
        }
        if self.audio.read_retries > MAX_READ_RETRIES {
            return Err(VoiceError::Config(format!(
                "audio.read_retries must be at most {}, got {}",
                MAX_READ_RETRIES, self.audio.read_retries
            )));
        }
        if self.recognition.backlog == 0 {
            return Err(VoiceError::Config("recognition.backlog must be at least 1".into()));
        }
        if self.turn_taking.barge_in_frames == 0 {
            return Err(VoiceError::Config("turn_taking.barge_in_frames must be at least 1".into()));
        }
        Ok(())
    }
}
