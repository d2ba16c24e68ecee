//! **Capture pipeline** - microphone to utterances on a dedicated thread.
//!
//! The input stream and the VAD handle are `!Send`, so both are created on the
//! capture thread and never leave it. Every committed utterance is written to
//! the recording cache, announced to the orchestrator and queued for
//! recognition. The orchestrator steers admission through a [`CaptureGate`].

use crate::audio::{AudioConfig, AudioDevice, AudioFrame, FrameRead, FrameSource};
use crate::cache::{CacheEntry, CacheFence, CacheManager};
use crate::error::{VoiceError, VoiceResult};
use crate::orchestrator::{SessionEvent, TurnTakingConfig};
use crate::recognition::RecognitionDispatcher;
use crate::segmenter::{Segmenter, SegmenterConfig, Utterance};
use crate::vad::{build_classifier, to_i16, VadConfig};
use chrono::Local;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Whether captured audio may become an utterance right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureGate {
    /// Frames flow into the segmenter
    Listening,
    /// A reply is playing; frames are dropped unless barge-in is on
    Speaking { playback_id: u64 },
    /// Playback ended; frames are dropped until the instant passes
    ResumeAt(Instant),
}

/// Counters reported when the capture thread exits.
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    pub frames: u64,
    pub utterances: u64,
    pub short_discarded: u64,
    pub barge_ins: u64,
    pub degraded: bool,
}

/// Everything the capture thread needs.
pub struct CaptureContext {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub segmenter: SegmenterConfig,
    pub turn_taking: TurnTakingConfig,
    pub device: Arc<dyn AudioDevice>,
    pub recordings: Arc<CacheManager>,
    pub dispatcher: Arc<RecognitionDispatcher>,
    pub events: mpsc::Sender<SessionEvent>,
    pub gate: watch::Receiver<CaptureGate>,
    pub cancel: CancellationToken,
}

/// Start capturing. Resolves once the input device is open; open failure is
/// returned here and is fatal to the session.
pub async fn spawn_capture(ctx: CaptureContext) -> VoiceResult<JoinHandle<CaptureStats>> {
    let (ready_tx, ready_rx) = oneshot::channel::<VoiceResult<()>>();

    let handle = thread::Builder::new()
        .name("parley-capture".into())
        .spawn(move || {
            let frame_len = ctx.audio.frame_len();
            let opened = ctx
                .device
                .open_input(ctx.audio.input_device.as_deref(), ctx.audio.sample_rate, frame_len)
                .and_then(|source| {
                    let classifier = build_classifier(&ctx.vad, ctx.audio.sample_rate)?;
                    Ok((source, classifier))
                });
            let (source, classifier) = match opened {
                Ok(opened) => {
                    let _ = ready_tx.send(Ok(()));
                    opened
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return CaptureStats::default();
                }
            };
            let segmenter = Segmenter::new(&ctx.segmenter, classifier, ctx.audio.sample_rate, ctx.audio.frame_ms);
            CaptureLoop::new(ctx, segmenter).run(source)
        })
        .map_err(|e| VoiceError::Worker(format!("cannot spawn capture thread: {}", e)))?;

    match ready_rx.await {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => Err(VoiceError::Worker("capture thread exited during startup".into())),
    }
}

struct CaptureLoop {
    ctx: CaptureContext,
    segmenter: Segmenter,
    stats: CaptureStats,
    seq: u64,
    barged: Option<u64>,
}

impl CaptureLoop {
    fn new(ctx: CaptureContext, segmenter: Segmenter) -> Self {
        Self {
            ctx,
            segmenter,
            stats: CaptureStats::default(),
            seq: 0,
            barged: None,
        }
    }

    fn run(mut self, mut source: Box<dyn FrameSource>) -> CaptureStats {
        info!(
            "👂 Listening ({}ms frames at {}Hz)",
            self.ctx.audio.frame_ms, self.ctx.audio.sample_rate
        );
        let mut failures: u32 = 0;

        while !self.ctx.cancel.is_cancelled() {
            match source.read_frame() {
                Ok(FrameRead::Frame(samples)) => {
                    failures = 0;
                    if !self.on_frame(samples) {
                        break;
                    }
                }
                Ok(FrameRead::Idle) => {}
                Ok(FrameRead::Closed) => {
                    info!("Input stream closed");
                    self.segmenter.reset();
                    let _ = self.ctx.events.blocking_send(SessionEvent::CaptureStopped);
                    break;
                }
                Err(e) => {
                    failures += 1;
                    if failures > self.ctx.audio.read_retries {
                        warn!(error = %e, failures, "❌ Capture degraded, input disabled");
                        self.stats.degraded = true;
                        self.segmenter.reset();
                        let _ = self
                            .ctx
                            .events
                            .blocking_send(SessionEvent::CaptureDegraded(e.to_string()));
                        break;
                    }
                    let backoff = read_backoff(self.ctx.audio.retry_backoff_ms, failures);
                    warn!(error = %e, attempt = failures, "Audio read failed, retrying in {:?}", backoff);
                    thread::sleep(backoff);
                }
            }
        }

        self.stats.short_discarded = self.segmenter.discarded_short();
        info!(
            frames = self.stats.frames,
            utterances = self.stats.utterances,
            "👂 Capture stopped"
        );
        self.stats
    }

    /// Returns false when the orchestrator is gone.
    fn on_frame(&mut self, samples: Vec<f32>) -> bool {
        self.stats.frames += 1;
        let frame = AudioFrame::new(self.seq, samples);
        self.seq += 1;

        let gate = *self.ctx.gate.borrow();
        let speaking = match gate {
            CaptureGate::Listening => None,
            CaptureGate::ResumeAt(at) if Instant::now() >= at => None,
            CaptureGate::ResumeAt(_) => {
                self.segmenter.reset();
                return true;
            }
            CaptureGate::Speaking { playback_id } => {
                if !self.ctx.turn_taking.barge_in {
                    self.segmenter.reset();
                    return true;
                }
                Some(playback_id)
            }
        };

        if let Some(utterance) = self.segmenter.feed(frame) {
            if !self.commit(utterance) {
                return false;
            }
        }

        if let Some(playback_id) = speaking {
            let over = self.segmenter.speech_run() >= self.ctx.turn_taking.barge_in_frames;
            if over && self.barged != Some(playback_id) {
                self.barged = Some(playback_id);
                self.stats.barge_ins += 1;
                info!(playback_id, "✋ Barge-in detected");
                if self
                    .ctx
                    .events
                    .blocking_send(SessionEvent::BargeIn { playback_id })
                    .is_err()
                {
                    return false;
                }
            }
        }
        true
    }

    fn commit(&mut self, mut utterance: Utterance) -> bool {
        self.stats.utterances += 1;
        match write_recording(&self.ctx.recordings, &utterance) {
            Ok(fence) => utterance.recording = Some(fence),
            Err(e) => warn!(utterance_id = utterance.id, error = %e, "Recording not cached"),
        }

        let event = SessionEvent::UtteranceCaptured {
            utterance_id: utterance.id,
            duration: utterance.duration(),
        };
        if self.ctx.events.blocking_send(event).is_err() {
            debug!("Event channel closed, capture exiting");
            return false;
        }
        self.ctx.dispatcher.submit(utterance);
        true
    }
}

/// Longest pause between two read attempts.
const MAX_READ_BACKOFF: Duration = Duration::from_secs(2);

/// Exponential backoff before retry `attempt` (1-based), capped.
fn read_backoff(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    Duration::from_millis(base_ms)
        .saturating_mul(factor)
        .min(MAX_READ_BACKOFF)
}

/// Write the utterance as 16-bit mono WAV and register it, fenced until the
/// utterance is dropped.
fn write_recording(cache: &CacheManager, utterance: &Utterance) -> VoiceResult<CacheFence> {
    let name = format!(
        "rec_{}_{}.wav",
        Local::now().format("%Y%m%d_%H%M%S"),
        utterance.id
    );
    let path = cache.dir().join(name);
    let fence = cache.fence(&path);
    write_wav(&path, &utterance.samples(), utterance.sample_rate)?;
    let entry = CacheEntry::from_file(&path).map_err(|e| VoiceError::CacheIo(e.to_string()))?;
    cache.register(entry);
    debug!(path = %path.display(), "💾 Recording cached");
    Ok(fence)
}

fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> VoiceResult<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for sample in to_i16(samples) {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioSink;
    use crate::cache::CacheLimits;
    use crate::recognition::RecognitionConfig;
    use chrono::Utc;

    /// Input that fails every read.
    struct Broken;

    impl FrameSource for Broken {
        fn read_frame(&mut self) -> VoiceResult<FrameRead> {
            Err(VoiceError::AudioStream("device unplugged".into()))
        }
    }

    struct BrokenDevice;

    impl AudioDevice for BrokenDevice {
        fn open_input(&self, _: Option<&str>, _: u32, _: usize) -> VoiceResult<Box<dyn FrameSource>> {
            Ok(Box::new(Broken))
        }

        fn open_output(&self, _: Option<&str>, _: u32) -> VoiceResult<Box<dyn AudioSink>> {
            Err(VoiceError::AudioDevice("no output".into()))
        }
    }

    #[test]
    fn read_backoff_doubles_and_saturates() {
        assert_eq!(read_backoff(50, 1), Duration::from_millis(50));
        assert_eq!(read_backoff(50, 3), Duration::from_millis(200));
        assert_eq!(read_backoff(50, 40), MAX_READ_BACKOFF);
        assert_eq!(read_backoff(u64::MAX, 2), MAX_READ_BACKOFF);
        assert_eq!(read_backoff(0, 100), Duration::ZERO);
    }

    #[tokio::test]
    async fn exhausted_retries_report_degraded_capture() {
        let tmp = tempfile::tempdir().unwrap();
        let (events, mut rx) = mpsc::channel(8);
        let (_gate_tx, gate) = watch::channel(CaptureGate::Listening);
        let ctx = CaptureContext {
            audio: AudioConfig {
                read_retries: 40,
                retry_backoff_ms: 0,
                ..Default::default()
            },
            vad: VadConfig {
                classifier: crate::vad::ClassifierKind::Energy,
                ..Default::default()
            },
            segmenter: SegmenterConfig::default(),
            turn_taking: TurnTakingConfig::default(),
            device: Arc::new(BrokenDevice),
            recordings: Arc::new(CacheManager::open("recordings", tmp.path(), CacheLimits::default()).unwrap()),
            dispatcher: Arc::new(RecognitionDispatcher::new(&RecognitionConfig::default())),
            events,
            gate,
            cancel: CancellationToken::new(),
        };

        let handle = spawn_capture(ctx).await.unwrap();
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(SessionEvent::CaptureDegraded(reason))) => assert!(reason.contains("unplugged")),
            other => panic!("expected CaptureDegraded, got {:?}", other),
        }
        let stats = tokio::task::spawn_blocking(move || handle.join()).await.unwrap().unwrap();
        assert!(stats.degraded);
        assert_eq!(stats.frames, 0);
    }

    #[test]
    fn recording_is_written_fenced_and_registered() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CacheManager::open("recordings", tmp.path(), CacheLimits::default()).unwrap();
        let utterance = Utterance {
            id: 42,
            frames: vec![AudioFrame::new(0, vec![0.25; 480]), AudioFrame::new(1, vec![-0.25; 480])],
            sample_rate: 16000,
            frame_ms: 30,
            started_at: Utc::now(),
            speech_frames: 2,
            recording: None,
        };

        let fence = write_recording(&cache, &utterance).unwrap();
        let path = fence.path().to_path_buf();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("rec_") && name.ends_with("_42.wav"));
        assert!(cache.contains(&path));
        assert!(cache.is_fenced(&path));

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.len(), 960);
        drop(fence);
        assert!(!cache.is_fenced(&path));
    }
}
