//! Utterance segmentation
//!
//! Implements the "Gap Logic": speech starts after a debounce run of speech
//! frames and ends once the silence timeout elapses. Everything is counted in
//! frames, so the same input always produces the same utterances.

use crate::audio::{AudioFrame, FrameLabel};
use crate::cache::CacheFence;
use crate::vad::FrameClassifier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for utterance detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Consecutive speech frames before speech start is declared (default: 3)
    pub start_frames: usize,

    /// Silence after speech before the utterance is committed (default: 800ms)
    pub silence_timeout_ms: u64,

    /// Minimum accumulated speech for a valid utterance (default: 300ms)
    pub min_speech_ms: u64,

    /// Maximum utterance length before auto-commit (default: 30s)
    pub max_utterance_ms: u64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            start_frames: 3,
            silence_timeout_ms: 800,
            min_speech_ms: 300,
            max_utterance_ms: 30_000,
        }
    }
}

/// One bounded span of detected speech.
#[derive(Debug)]
pub struct Utterance {
    /// Monotonic id, unique within a session
    pub id: u64,
    pub frames: Vec<AudioFrame>,
    pub sample_rate: u32,
    pub frame_ms: u32,
    /// When speech start was declared
    pub started_at: DateTime<Utc>,
    /// Frames classified as speech
    pub speech_frames: usize,
    /// Fenced recording in the cache; released when the utterance is dropped
    pub recording: Option<CacheFence>,
}

impl Utterance {
    /// Concatenated PCM of every frame.
    pub fn samples(&self) -> Vec<f32> {
        let len = self.frames.iter().map(|f| f.samples.len()).sum();
        let mut samples = Vec::with_capacity(len);
        for frame in &self.frames {
            samples.extend_from_slice(&frame.samples);
        }
        samples
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.frames.len() as u64 * self.frame_ms as u64)
    }

    pub fn speech_duration(&self) -> Duration {
        Duration::from_millis(self.speech_frames as u64 * self.frame_ms as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentState {
    Idle,
    Speaking,
}

/// Turns a stream of frames into utterances.
pub struct Segmenter {
    classifier: Box<dyn FrameClassifier>,
    sample_rate: u32,
    frame_ms: u32,

    start_frames: usize,
    silence_frames: usize,
    min_speech_frames: usize,
    max_frames: usize,

    state: SegmentState,
    recent: VecDeque<FrameLabel>,
    speech_run: usize,
    frames: Vec<AudioFrame>,
    speech_frames: usize,
    silence_run: usize,
    started_at: Option<DateTime<Utc>>,

    next_id: u64,
    discarded_short: u64,
}

fn frames_for(ms: u64, frame_ms: u32) -> usize {
    let frame_ms = frame_ms.max(1) as u64;
    ((ms + frame_ms - 1) / frame_ms) as usize
}

impl Segmenter {
    pub fn new(
        config: &SegmenterConfig,
        classifier: Box<dyn FrameClassifier>,
        sample_rate: u32,
        frame_ms: u32,
    ) -> Self {
        let start_frames = config.start_frames.max(1);
        Self {
            classifier,
            sample_rate,
            frame_ms,
            start_frames,
            silence_frames: frames_for(config.silence_timeout_ms, frame_ms).max(1),
            min_speech_frames: frames_for(config.min_speech_ms, frame_ms).max(1),
            max_frames: frames_for(config.max_utterance_ms, frame_ms).max(start_frames + 1),
            state: SegmentState::Idle,
            recent: VecDeque::with_capacity(start_frames),
            speech_run: 0,
            frames: Vec::new(),
            speech_frames: 0,
            silence_run: 0,
            started_at: None,
            next_id: 1,
            discarded_short: 0,
        }
    }

    /// Classify a single frame without advancing the segmenter.
    pub fn classify(&mut self, frame: &AudioFrame) -> FrameLabel {
        self.classifier.classify(&frame.samples)
    }

    /// Feed one frame; returns an utterance when one completes.
    pub fn feed(&mut self, mut frame: AudioFrame) -> Option<Utterance> {
        let label = self.classifier.classify(&frame.samples);
        frame.label = Some(label);

        if self.recent.len() == self.start_frames {
            self.recent.pop_front();
        }
        self.recent.push_back(label);
        self.speech_run = match label {
            FrameLabel::Speech => self.speech_run + 1,
            FrameLabel::Silence => 0,
        };

        match self.state {
            SegmentState::Idle => {
                if label == FrameLabel::Silence {
                    self.frames.clear();
                    return None;
                }
                self.frames.push(frame);
                let debounced = self.recent.len() == self.start_frames
                    && self.recent.iter().all(|l| *l == FrameLabel::Speech);
                if debounced {
                    debug!("🎤 Speech started");
                    self.state = SegmentState::Speaking;
                    self.speech_frames = self.frames.len();
                    self.silence_run = 0;
                    self.started_at = Some(Utc::now());
                }
                None
            }
            SegmentState::Speaking => {
                self.frames.push(frame);
                match label {
                    FrameLabel::Speech => {
                        self.speech_frames += 1;
                        self.silence_run = 0;
                    }
                    FrameLabel::Silence => self.silence_run += 1,
                }

                if self.frames.len() >= self.max_frames {
                    warn!("⏱️ Max utterance duration reached, auto-committing");
                    return self.commit();
                }
                if self.silence_run >= self.silence_frames {
                    return self.commit();
                }
                None
            }
        }
    }

    fn commit(&mut self) -> Option<Utterance> {
        if self.speech_frames < self.min_speech_frames {
            debug!(
                speech_ms = self.speech_frames as u64 * self.frame_ms as u64,
                "⏭️ Speech too short, ignoring"
            );
            self.discarded_short += 1;
            self.clear();
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        let utterance = Utterance {
            id,
            frames: std::mem::take(&mut self.frames),
            sample_rate: self.sample_rate,
            frame_ms: self.frame_ms,
            started_at: self.started_at.unwrap_or_else(Utc::now),
            speech_frames: self.speech_frames,
            recording: None,
        };
        info!(
            utterance_id = id,
            frames = utterance.frames.len(),
            "🎯 Utterance committed: {:?} of speech",
            utterance.speech_duration()
        );
        self.clear();
        Some(utterance)
    }

    fn clear(&mut self) {
        self.state = SegmentState::Idle;
        self.frames.clear();
        self.speech_frames = 0;
        self.silence_run = 0;
        self.started_at = None;
    }

    /// Drop any partial utterance. Used when capture pauses or stops.
    pub fn reset(&mut self) {
        if self.state == SegmentState::Speaking {
            debug!("Discarding partial utterance ({} frames)", self.frames.len());
        }
        self.clear();
        self.recent.clear();
        self.speech_run = 0;
    }

    /// Whether speech start has been declared for the current utterance.
    pub fn is_speaking(&self) -> bool {
        self.state == SegmentState::Speaking
    }

    /// Length of the current run of consecutive speech frames.
    pub fn speech_run(&self) -> usize {
        self.speech_run
    }

    /// Utterances discarded for falling under the minimum speech duration.
    pub fn discarded_short(&self) -> u64 {
        self.discarded_short
    }
}
