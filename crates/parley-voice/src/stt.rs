//! **Speech-to-Text** - the recognizer boundary.
//!
//! Implement [`Recognizer`] for any engine; [`OpenAiRecognizer`] talks to an
//! OpenAI-compatible `/audio/transcriptions` endpoint. Calls are blocking; the
//! dispatcher runs them on the blocking pool under a timeout.

use crate::error::{VoiceError, VoiceResult};
use crate::vad::to_i16;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;

/// Text returned by a recognizer. Empty text means "no speech".
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// Engine confidence in 0.0..=1.0 when the engine reports one
    pub confidence: Option<f32>,
}

impl Transcript {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: None,
        }
    }
}

/// Converts PCM (mono f32) into text.
pub trait Recognizer: Send + Sync {
    fn recognize(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<Transcript>;
}

/// Encode f32 PCM (mono) as 16-bit WAV bytes.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for sample in to_i16(samples) {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1)
    pub api_url: String,
    /// Bearer API key; resolved from the environment when unset
    pub api_key: Option<String>,
    /// whisper-1, gpt-4o-transcribe, ...
    pub model: String,
    /// ISO-639-1 hint passed to the engine
    pub language: Option<String>,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "whisper-1".to_string(),
            language: None,
        }
    }
}

/// OpenAI-compatible transcription API (OpenAI Whisper, OpenRouter, local servers).
#[derive(Debug, Clone)]
pub struct OpenAiRecognizer {
    base_url: String,
    api_key: String,
    model: String,
    language: Option<String>,
    client: reqwest::blocking::Client,
}

impl OpenAiRecognizer {
    pub fn new(config: &SttConfig, timeout: Duration) -> VoiceResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| VoiceError::Config("STT requires stt.api_key, STT_API_KEY or OPENAI_API_KEY".to_string()))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::Recognition(e.to_string()))?;
        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            language: config.language.clone(),
            client,
        })
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Vec<TranscriptionSegment>,
}

#[derive(Deserialize)]
struct TranscriptionSegment {
    avg_logprob: Option<f32>,
}

impl Recognizer for OpenAiRecognizer {
    fn recognize(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<Transcript> {
        if samples.is_empty() {
            return Ok(Transcript::new(""));
        }
        let wav = encode_wav(samples, sample_rate)?;
        let url = format!("{}/audio/transcriptions", self.base_url);
        let part = reqwest::blocking::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Recognition(e.to_string()))?;
        let mut form = reqwest::blocking::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json");
        if let Some(ref lang) = self.language {
            form = form.text("language", lang.clone());
        }
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| VoiceError::Recognition(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Recognition(format!("STT API error {}: {}", status, body)));
        }
        let body: TranscriptionResponse = res.json().map_err(|e| VoiceError::Recognition(e.to_string()))?;

        let logprobs: Vec<f32> = body.segments.iter().filter_map(|s| s.avg_logprob).collect();
        let confidence = if logprobs.is_empty() {
            None
        } else {
            let mean = logprobs.iter().sum::<f32>() / logprobs.len() as f32;
            Some(mean.exp().clamp(0.0, 1.0))
        };

        Ok(Transcript {
            text: body.text.trim().to_string(),
            confidence,
        })
    }
}
