//! Error types for the Parley voice pipeline

use std::time::Duration;
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice orchestration system
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Recognition error: {0}")]
    Recognition(String),

    #[error("Reasoning backend error: {0}")]
    Backend(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Cache IO error: {0}")]
    CacheIo(String),

    #[error("Session persistence error: {0}")]
    Persistence(String),

    #[error("{what} timed out after {}ms", after.as_millis())]
    Timeout { what: &'static str, after: Duration },

    #[error("Conversation session is awaiting a reply")]
    SessionBusy,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Whether this error must terminate the process (device or persistence loss).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::AudioDevice(_) | VoiceError::Persistence(_) | VoiceError::Config(_)
        )
    }

    /// Name of the component that produced the error, for exit diagnostics.
    pub fn component(&self) -> &'static str {
        match self {
            VoiceError::AudioDevice(_) | VoiceError::AudioStream(_) => "audio device",
            VoiceError::Recognition(_) => "recognizer",
            VoiceError::Backend(_) | VoiceError::SessionBusy => "reasoning backend",
            VoiceError::Synthesis(_) => "synthesizer",
            VoiceError::Playback(_) => "playback",
            VoiceError::CacheIo(_) => "cache manager",
            VoiceError::Persistence(_) => "conversation record",
            VoiceError::Timeout { what, .. } => what,
            VoiceError::Config(_) => "configuration",
            VoiceError::Worker(_) => "orchestrator",
            VoiceError::Io(_) => "io",
        }
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        VoiceError::CacheIo(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Persistence(err.to_string())
    }
}
