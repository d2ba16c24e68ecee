//! # Parley Voice - real-time spoken dialogue
//!
//! Turns a continuous microphone stream into utterances, transcribes them,
//! asks a conversational model for a reply and speaks it back, one turn at a
//! time, while persisting the session.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Session Orchestrator                      │
//! │  ┌─────────────┐   ┌─────────────┐   ┌──────────────┐           │
//! │  │  Capture    │ → │ Recognition │ → │ Conversation │           │
//! │  │ (cpal+VAD)  │   │ (1 in-flight│   │  (bounded    │           │
//! │  │  thread     │   │  FIFO)      │   │   history)   │           │
//! │  └─────────────┘   └─────────────┘   └──────────────┘           │
//! │         ↑                                    ↓                   │
//! │         │  resume / barge-in       ┌──────────────────┐          │
//! │         └──────────────────────────│ Synthesis+Playback│          │
//! │                                    │  (rodio thread)   │          │
//! │                                    └──────────────────┘          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod cache;
pub mod capture;
pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod playback;
pub mod recognition;
pub mod segmenter;
pub mod stt;
pub mod tts;
pub mod vad;
pub mod worker;

pub use audio::{AudioConfig, AudioDevice, AudioFrame, AudioSink, CpalDevice, FrameLabel, FrameRead, FrameSource, PlayOutcome};
pub use cache::{CacheConfig, CacheEntry, CacheFence, CacheLimits, CacheManager, EvictionReport};
pub use config::VoiceConfig;
pub use conversation::{ConversationConfig, ConversationManager, ConversationRequest, ConversationTurn, Reply, Role, SessionLog, SessionState};
pub use error::{VoiceError, VoiceResult};
pub use llm::{ChatCompletionsBackend, ChatMessage, ChatRole, LlmConfig, ReasoningBackend};
pub use orchestrator::{Backends, Orchestrator, SessionReport, Transition, TurnState, TurnTakingConfig};
pub use playback::{PlaybackHandle, PlaybackOutcome, PlaybackReport, PlaybackScheduler, SynthesisArtifact};
pub use recognition::{RecognitionDispatcher, RecognitionFailure, RecognitionResult};
pub use segmenter::{Segmenter, SegmenterConfig, Utterance};
pub use stt::{OpenAiRecognizer, Recognizer, SttConfig, Transcript};
pub use tts::{OpenAiSynthesizer, Synthesizer, TtsConfig, VoiceParams};
pub use vad::{ClassifierKind, EnergyClassifier, FrameClassifier, VadConfig, WebRtcClassifier};

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run a session with the shipped backends until CTRL-C.
///
/// Owns its runtime: call from a plain `main`, not from async code.
pub fn run(config: VoiceConfig) -> VoiceResult<SessionReport> {
    // Blocking HTTP clients must be built and dropped outside the runtime.
    let backends = Backends::from_config(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("parley-worker")
        .build()?;

    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(config, backends.clone());

    let result = runtime.block_on(async {
        let signal = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("CTRL-C received; shutting down");
                    signal.cancel();
                }
                Err(e) => warn!(error = %e, "Cannot listen for CTRL-C"),
            }
        });
        orchestrator.run(shutdown.clone()).await
    });

    shutdown.cancel();
    runtime.shutdown_timeout(Duration::from_secs(2));
    drop(backends);
    result
}
