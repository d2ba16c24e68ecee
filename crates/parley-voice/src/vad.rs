//! Frame classification for voice activity detection
//!
//! Wraps WebRTC VAD, with an RMS energy gate as an alternative for
//! environments where WebRTC misbehaves (and for deterministic tests).
//! Classification never fails: a frame that cannot be classified is silence.

use crate::audio::FrameLabel;
use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Which classifier backs the segmenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    WebRtc,
    Energy,
}

/// Configuration for VAD detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Classifier backend (default: WebRTC)
    pub classifier: ClassifierKind,

    /// WebRTC detection mode (0-3, where 3 is most aggressive)
    pub mode: u8,

    /// Energy gate in dBFS for the energy classifier (default: -40 dB)
    pub energy_threshold_db: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            classifier: ClassifierKind::WebRtc,
            mode: 2,
            energy_threshold_db: -40.0,
        }
    }
}

/// Labels one frame as speech or silence.
pub trait FrameClassifier {
    fn classify(&mut self, frame: &[f32]) -> FrameLabel;
}

/// Build the configured classifier. Must be called on the thread that will use it
/// (WebRTC VAD holds a raw handle and is not `Send`).
pub fn build_classifier(config: &VadConfig, sample_rate: u32) -> VoiceResult<Box<dyn FrameClassifier>> {
    match config.classifier {
        ClassifierKind::WebRtc => Ok(Box::new(WebRtcClassifier::new(sample_rate, config.mode)?)),
        ClassifierKind::Energy => Ok(Box::new(EnergyClassifier::new(config.energy_threshold_db))),
    }
}

/// Voice Activity Detector using WebRTC VAD
pub struct WebRtcClassifier {
    vad: Vad,
}

impl WebRtcClassifier {
    pub fn new(sample_rate: u32, mode: u8) -> VoiceResult<Self> {
        info!("🎙️ Initializing WebRTC VAD (sample_rate: {}Hz, mode: {})", sample_rate, mode);

        let sample_rate = match sample_rate {
            8000 => SampleRate::Rate8kHz,
            16000 => SampleRate::Rate16kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            other => {
                return Err(VoiceError::Config(format!(
                    "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                    other
                )))
            }
        };

        let vad_mode = match mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            3 => VadMode::VeryAggressive,
            other => return Err(VoiceError::Config(format!("VAD mode must be 0-3, got {}", other))),
        };

        Ok(Self {
            vad: Vad::new_with_rate_and_mode(sample_rate, vad_mode),
        })
    }
}

impl FrameClassifier for WebRtcClassifier {
    fn classify(&mut self, frame: &[f32]) -> FrameLabel {
        let pcm = to_i16(frame);
        match self.vad.is_voice_segment(&pcm) {
            Ok(true) => FrameLabel::Speech,
            Ok(false) => FrameLabel::Silence,
            Err(()) => {
                debug!("VAD rejected a {} sample frame, treating as silence", frame.len());
                FrameLabel::Silence
            }
        }
    }
}

/// RMS energy gate.
#[derive(Debug, Clone)]
pub struct EnergyClassifier {
    threshold_db: f32,
}

impl EnergyClassifier {
    pub fn new(threshold_db: f32) -> Self {
        Self { threshold_db }
    }
}

impl FrameClassifier for EnergyClassifier {
    fn classify(&mut self, frame: &[f32]) -> FrameLabel {
        if energy_db(frame) > self.threshold_db {
            FrameLabel::Speech
        } else {
            FrameLabel::Silence
        }
    }
}

/// Frame energy in dBFS; an empty or all-zero frame is -100 dB.
pub fn energy_db(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return -100.0;
    }
    let mean_square = frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
    let rms = mean_square.sqrt();
    if rms <= f32::EPSILON {
        -100.0
    } else {
        (20.0 * rms.log10()).max(-100.0)
    }
}

/// Convert f32 samples to i16 PCM.
pub(crate) fn to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| (sample.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}
