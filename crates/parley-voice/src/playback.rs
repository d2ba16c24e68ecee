//! Synthesis and playback
//!
//! `speak` resolves a reply to audio (cache first, synthesizer on a miss) and
//! plays it on the output thread, which alone owns the output device. Playback
//! is the one interruptible operation: `PlaybackHandle::interrupt` stops it
//! mid-sentence.

use crate::audio::{AudioDevice, AudioSink, PlayOutcome};
use crate::cache::{CacheEntry, CacheFence, CacheManager};
use crate::error::{VoiceError, VoiceResult};
use crate::tts::{Synthesizer, VoiceParams};
use crate::worker::call_blocking;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub voice: VoiceParams,
    /// Per-call synthesis timeout
    pub timeout_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            voice: VoiceParams::default(),
            timeout_ms: 20_000,
        }
    }
}

/// Synthesized audio for one assistant turn.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisArtifact {
    pub turn_id: u64,
    pub path: PathBuf,
    pub cache_key: String,
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Interrupted,
    /// No audio; the reply stays text-only
    TextOnly(String),
    /// Speech output is switched off
    Disabled,
}

#[derive(Debug, Clone)]
pub struct PlaybackReport {
    pub turn_id: u64,
    pub outcome: PlaybackOutcome,
    pub artifact: Option<SynthesisArtifact>,
}

/// A reply being spoken.
#[derive(Debug)]
pub struct PlaybackHandle {
    turn_id: u64,
    cancel: CancellationToken,
    done: oneshot::Receiver<PlaybackReport>,
}

impl PlaybackHandle {
    fn completed(turn_id: u64, outcome: PlaybackOutcome) -> Self {
        let (tx, done) = oneshot::channel();
        let _ = tx.send(PlaybackReport {
            turn_id,
            outcome,
            artifact: None,
        });
        Self {
            turn_id,
            cancel: CancellationToken::new(),
            done,
        }
    }

    pub fn turn_id(&self) -> u64 {
        self.turn_id
    }

    /// Stop playback now. Idempotent.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    /// Token that interrupts this playback when cancelled.
    pub fn interrupter(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for playback to end.
    pub async fn finished(self) -> PlaybackReport {
        let turn_id = self.turn_id;
        self.done.await.unwrap_or(PlaybackReport {
            turn_id,
            outcome: PlaybackOutcome::Interrupted,
            artifact: None,
        })
    }
}

/// Collapse whitespace so trivially different replies share a cache entry.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// SHA-256 over normalized text and every voice parameter.
pub fn cache_key(text: &str, params: &VoiceParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(text).as_bytes());
    hasher.update(b"|");
    hasher.update(params.voice.as_bytes());
    hasher.update(b"|");
    hasher.update(params.model.as_bytes());
    hasher.update(b"|");
    hasher.update(format!("{:.2}", params.speed).as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn extension_for(audio: &[u8]) -> &'static str {
    if audio.len() >= 4 && &audio[0..4] == b"RIFF" {
        "wav"
    } else {
        "mp3"
    }
}

struct PlayCommand {
    audio: Arc<Vec<u8>>,
    cancel: CancellationToken,
    reply: oneshot::Sender<VoiceResult<PlayOutcome>>,
}

/// The output thread: owns the sink, plays one command at a time.
pub struct OutputThread {
    commands: std_mpsc::Sender<PlayCommand>,
    thread: JoinHandle<()>,
}

impl OutputThread {
    /// Open the output device on a dedicated thread. Open failure is returned here.
    pub async fn spawn(
        device: Arc<dyn AudioDevice>,
        name: Option<String>,
        sample_rate: u32,
    ) -> VoiceResult<Self> {
        let (commands, rx) = std_mpsc::channel::<PlayCommand>();
        let (ready_tx, ready_rx) = oneshot::channel::<VoiceResult<()>>();

        let thread = std::thread::Builder::new()
            .name("parley-output".into())
            .spawn(move || {
                let mut sink: Box<dyn AudioSink> = match device.open_output(name.as_deref(), sample_rate) {
                    Ok(sink) => {
                        let _ = ready_tx.send(Ok(()));
                        sink
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while let Ok(cmd) = rx.recv() {
                    let outcome = if cmd.cancel.is_cancelled() {
                        Ok(PlayOutcome::Interrupted)
                    } else {
                        sink.play(&cmd.audio, &cmd.cancel)
                    };
                    let _ = cmd.reply.send(outcome);
                }
                debug!("Output thread exiting");
            })
            .map_err(|e| VoiceError::Worker(format!("cannot spawn output thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self { commands, thread }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(VoiceError::Worker("output thread exited during startup".into())),
        }
    }

    /// Close the command channel and wait for the thread. Every scheduler
    /// built on this thread must be dropped first.
    pub async fn shutdown(self) {
        drop(self.commands);
        let thread = self.thread;
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => {}
            _ => warn!("Output thread panicked"),
        }
    }
}

struct Shared {
    params: VoiceParams,
    timeout: Duration,
    synthesizer: Arc<dyn Synthesizer>,
    cache: Arc<CacheManager>,
    output: std_mpsc::Sender<PlayCommand>,
    shutdown: CancellationToken,
    cache_hits: AtomicU64,
    synth_calls: AtomicU64,
}

/// Turns assistant text into speech.
#[derive(Clone)]
pub struct PlaybackScheduler {
    shared: Option<Arc<Shared>>,
}

impl PlaybackScheduler {
    pub fn new(
        config: &PlaybackConfig,
        synthesizer: Arc<dyn Synthesizer>,
        cache: Arc<CacheManager>,
        output: &OutputThread,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            shared: Some(Arc::new(Shared {
                params: config.voice.clone(),
                timeout: Duration::from_millis(config.timeout_ms),
                synthesizer,
                cache,
                output: output.commands.clone(),
                shutdown,
                cache_hits: AtomicU64::new(0),
                synth_calls: AtomicU64::new(0),
            })),
        }
    }

    /// Scheduler for sessions without speech output; every handle completes at once.
    pub fn disabled() -> Self {
        Self { shared: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.is_some()
    }

    pub fn cache_hits(&self) -> u64 {
        self.shared
            .as_ref()
            .map_or(0, |s| s.cache_hits.load(Ordering::Relaxed))
    }

    pub fn synth_calls(&self) -> u64 {
        self.shared
            .as_ref()
            .map_or(0, |s| s.synth_calls.load(Ordering::Relaxed))
    }

    /// Start speaking `text` for assistant turn `turn_id`.
    pub fn speak(&self, turn_id: u64, text: &str) -> PlaybackHandle {
        let Some(shared) = self.shared.as_ref() else {
            return PlaybackHandle::completed(turn_id, PlaybackOutcome::Disabled);
        };
        let text = normalize_text(text);
        if text.is_empty() {
            return PlaybackHandle::completed(turn_id, PlaybackOutcome::TextOnly("empty reply".into()));
        }

        let cancel = shared.shutdown.child_token();
        let (tx, done) = oneshot::channel();
        let shared = Arc::clone(shared);
        let token = cancel.clone();
        tokio::spawn(async move {
            let report = speak_turn(&shared, turn_id, text, &token).await;
            drop(shared);
            let _ = tx.send(report);
        });

        PlaybackHandle { turn_id, cancel, done }
    }
}

async fn resolve_audio(
    shared: &Shared,
    text: String,
    key: &str,
    cancel: &CancellationToken,
) -> VoiceResult<(Vec<u8>, CacheFence, bool)> {
    let stem = format!("tts_{}", &key[..16]);
    for ext in ["wav", "mp3"] {
        let path = shared.cache.dir().join(format!("{}.{}", stem, ext));
        if let Some(fence) = shared.cache.fence_existing(&path) {
            match tokio::fs::read(&path).await {
                Ok(audio) => {
                    shared.cache_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(path = %path.display(), "🎯 Synthesis cache hit");
                    return Ok((audio, fence, true));
                }
                Err(e) => warn!(error = %VoiceError::CacheIo(e.to_string()), "Cached audio unreadable, re-synthesizing"),
            }
        }
    }

    shared.synth_calls.fetch_add(1, Ordering::Relaxed);
    let synthesizer = Arc::clone(&shared.synthesizer);
    let params = shared.params.clone();
    let audio = call_blocking("synthesizer", shared.timeout, cancel, move || {
        synthesizer.synthesize(&text, &params)
    })
    .await?;
    if audio.is_empty() {
        return Err(VoiceError::Synthesis("synthesizer returned no audio".into()));
    }

    let path = shared.cache.dir().join(format!("{}.{}", stem, extension_for(&audio)));
    let fence = shared.cache.fence(&path);
    match tokio::fs::write(&path, &audio).await {
        Ok(()) => match CacheEntry::from_file(&path) {
            Ok(entry) => {
                shared.cache.register(entry);
            }
            Err(e) => warn!(error = %VoiceError::CacheIo(e.to_string()), "Cannot stat synthesized audio"),
        },
        Err(e) => warn!(error = %VoiceError::CacheIo(e.to_string()), "Cannot cache synthesized audio"),
    }
    Ok((audio, fence, false))
}

async fn speak_turn(shared: &Shared, turn_id: u64, text: String, cancel: &CancellationToken) -> PlaybackReport {
    let key = cache_key(&text, &shared.params);
    let text_only = |reason: String| PlaybackReport {
        turn_id,
        outcome: PlaybackOutcome::TextOnly(reason),
        artifact: None,
    };

    let (audio, fence, from_cache) = match resolve_audio(shared, text, &key, cancel).await {
        Ok(resolved) => resolved,
        Err(_) if cancel.is_cancelled() => {
            return PlaybackReport {
                turn_id,
                outcome: PlaybackOutcome::Interrupted,
                artifact: None,
            }
        }
        Err(e) => {
            warn!(turn_id, error = %e, "🔇 Synthesis failed, reply is text-only");
            return text_only(e.to_string());
        }
    };
    let artifact = SynthesisArtifact {
        turn_id,
        path: fence.path().to_path_buf(),
        cache_key: key,
        from_cache,
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    let cmd = PlayCommand {
        audio: Arc::new(audio),
        cancel: cancel.clone(),
        reply: reply_tx,
    };
    if shared.output.send(cmd).is_err() {
        return text_only("output thread stopped".into());
    }

    info!(turn_id, from_cache, "🔊 Speaking");
    let outcome = match reply_rx.await {
        Ok(Ok(PlayOutcome::Finished)) => PlaybackOutcome::Completed,
        Ok(Ok(PlayOutcome::Interrupted)) => PlaybackOutcome::Interrupted,
        Ok(Err(e)) => {
            warn!(turn_id, error = %e, "Playback failed, reply is text-only");
            PlaybackOutcome::TextOnly(e.to_string())
        }
        Err(_) => PlaybackOutcome::TextOnly("output thread stopped".into()),
    };
    drop(fence);

    PlaybackReport {
        turn_id,
        outcome,
        artifact: Some(artifact),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FrameSource;
    use crate::cache::CacheLimits;
    use crate::stt::encode_wav;
    use std::sync::Mutex;

    #[test]
    fn key_ignores_whitespace_but_not_voice() {
        let params = VoiceParams::default();
        assert_eq!(cache_key("hi  there\n", &params), cache_key(" hi there", &params));
        let other = VoiceParams {
            voice: "nova".into(),
            ..VoiceParams::default()
        };
        assert_ne!(cache_key("hi there", &params), cache_key("hi there", &other));
        assert_eq!(cache_key("x", &params).len(), 64);
    }

    #[test]
    fn sniffs_container() {
        assert_eq!(extension_for(b"RIFF....WAVE"), "wav");
        assert_eq!(extension_for(&[0xff, 0xfb, 0x90, 0x00]), "mp3");
    }

    struct CountingSynth {
        calls: Mutex<u32>,
        fail: bool,
    }

    impl Synthesizer for CountingSynth {
        fn synthesize(&self, _text: &str, _params: &VoiceParams) -> VoiceResult<Vec<u8>> {
            *self.calls.lock().unwrap() += 1;
            if self.fail {
                return Err(VoiceError::Synthesis("offline".into()));
            }
            encode_wav(&[0.1; 160], 16000)
        }
    }

    /// Output device whose sink "plays" for `play_ms` unless cancelled.
    struct Silent {
        play_ms: u64,
    }

    struct SilentSink {
        play_ms: u64,
    }

    impl AudioSink for SilentSink {
        fn play(&mut self, _audio: &[u8], cancel: &CancellationToken) -> VoiceResult<PlayOutcome> {
            for _ in 0..self.play_ms {
                if cancel.is_cancelled() {
                    return Ok(PlayOutcome::Interrupted);
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(PlayOutcome::Finished)
        }
    }

    impl AudioDevice for Silent {
        fn open_input(&self, _: Option<&str>, _: u32, _: usize) -> VoiceResult<Box<dyn FrameSource>> {
            Err(VoiceError::AudioDevice("no input".into()))
        }

        fn open_output(&self, _: Option<&str>, _: u32) -> VoiceResult<Box<dyn AudioSink>> {
            Ok(Box::new(SilentSink { play_ms: self.play_ms }))
        }
    }

    async fn scheduler(dir: &std::path::Path, synth: Arc<CountingSynth>, play_ms: u64) -> (PlaybackScheduler, OutputThread) {
        let cache = Arc::new(CacheManager::open("tts", dir, CacheLimits::default()).unwrap());
        let output = OutputThread::spawn(Arc::new(Silent { play_ms }), None, 16000).await.unwrap();
        let scheduler = PlaybackScheduler::new(
            &PlaybackConfig::default(),
            synth,
            cache,
            &output,
            CancellationToken::new(),
        );
        (scheduler, output)
    }

    #[tokio::test]
    async fn identical_requests_synthesize_once() {
        let tmp = tempfile::tempdir().unwrap();
        let synth = Arc::new(CountingSynth {
            calls: Mutex::new(0),
            fail: false,
        });
        let (scheduler, output) = scheduler(tmp.path(), Arc::clone(&synth), 1).await;

        let first = scheduler.speak(1, "hi there").finished().await;
        assert_eq!(first.outcome, PlaybackOutcome::Completed);
        assert!(!first.artifact.as_ref().unwrap().from_cache);

        let second = scheduler.speak(2, "  hi   there ").finished().await;
        assert_eq!(second.outcome, PlaybackOutcome::Completed);
        let artifact = second.artifact.unwrap();
        assert!(artifact.from_cache);
        assert!(artifact.path.extension().map_or(false, |e| e == "wav"));

        assert_eq!(*synth.calls.lock().unwrap(), 1);
        assert_eq!(scheduler.cache_hits(), 1);
        drop(scheduler);
        output.shutdown().await;
    }

    #[tokio::test]
    async fn synthesis_failure_is_text_only() {
        let tmp = tempfile::tempdir().unwrap();
        let synth = Arc::new(CountingSynth {
            calls: Mutex::new(0),
            fail: true,
        });
        let (scheduler, output) = scheduler(tmp.path(), synth, 1).await;

        let report = scheduler.speak(3, "hello").finished().await;
        assert!(matches!(report.outcome, PlaybackOutcome::TextOnly(_)));
        assert!(report.artifact.is_none());
        drop(scheduler);
        output.shutdown().await;
    }

    #[tokio::test]
    async fn interrupt_stops_playback() {
        let tmp = tempfile::tempdir().unwrap();
        let synth = Arc::new(CountingSynth {
            calls: Mutex::new(0),
            fail: false,
        });
        let (scheduler, output) = scheduler(tmp.path(), synth, 5_000).await;

        let handle = scheduler.speak(4, "a long answer");
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.interrupt();
        let report = tokio::time::timeout(Duration::from_secs(1), handle.finished())
            .await
            .unwrap();
        assert_eq!(report.outcome, PlaybackOutcome::Interrupted);
        drop(scheduler);
        output.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_handle_is_already_done() {
        let scheduler = PlaybackScheduler::disabled();
        assert!(!scheduler.is_enabled());
        let report = tokio_test::assert_ready!(tokio_test::task::spawn(scheduler.speak(9, "hi").finished()).poll());
        assert_eq!(report.outcome, PlaybackOutcome::Disabled);
        assert_eq!(report.turn_id, 9);
    }
}
