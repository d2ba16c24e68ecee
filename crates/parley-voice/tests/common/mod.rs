//! Fakes for driving a full session without hardware or network.

#![allow(dead_code)]

use parley_voice::stt::encode_wav;
use parley_voice::{
    AudioDevice, AudioSink, ChatMessage, ClassifierKind, FrameRead, FrameSource, PlayOutcome,
    ReasoningBackend, Recognizer, Synthesizer, Transcript, Transition, TurnState, VoiceConfig,
    VoiceError, VoiceParams, VoiceResult,
};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub const FRAME: usize = 480;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Config for tests: energy VAD, short timeouts, every directory under `root`.
pub fn test_config(root: &Path) -> VoiceConfig {
    let mut config = VoiceConfig::default();
    config.vad.classifier = ClassifierKind::Energy;
    config.segmenter.start_frames = 3;
    config.segmenter.silence_timeout_ms = 300;
    config.segmenter.min_speech_ms = 300;
    config.recognition.timeout_ms = 2_000;
    config.conversation.timeout_ms = 2_000;
    config.conversation.record_dir = root.join("records");
    config.playback.timeout_ms = 2_000;
    config.cache.recordings_dir = root.join("recordings");
    config.cache.synthesis_dir = root.join("tts");
    config.turn_taking.resume_delay_ms = 0;
    config
}

/// Pushes frames into a [`FakeDevice`] input.
#[derive(Clone)]
pub struct FrameFeed {
    tx: std_mpsc::Sender<Vec<f32>>,
}

impl FrameFeed {
    pub fn speech(&self, frames: usize) {
        for _ in 0..frames {
            let _ = self.tx.send(vec![0.5; FRAME]);
        }
    }

    pub fn silence(&self, frames: usize) {
        for _ in 0..frames {
            let _ = self.tx.send(vec![0.0; FRAME]);
        }
    }

    /// One utterance: `speech` frames then enough silence to commit it.
    pub fn utterance(&self, speech: usize) {
        self.speech(speech);
        self.silence(15);
    }
}

struct FeedSource {
    rx: std_mpsc::Receiver<Vec<f32>>,
    failing_reads: Arc<AtomicUsize>,
}

impl FrameSource for FeedSource {
    fn read_frame(&mut self) -> VoiceResult<FrameRead> {
        let failing = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(VoiceError::AudioStream("buffer overrun".into()));
        }
        match self.rx.recv_timeout(Duration::from_millis(5)) {
            Ok(frame) => Ok(FrameRead::Frame(frame)),
            Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(FrameRead::Idle),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Ok(FrameRead::Idle),
        }
    }
}

/// What the output sink saw.
#[derive(Debug, Default)]
pub struct SinkLog {
    pub finished: usize,
    pub interrupted: usize,
}

struct MemorySink {
    play_ms: u64,
    log: Arc<Mutex<SinkLog>>,
}

impl AudioSink for MemorySink {
    fn play(&mut self, _audio: &[u8], cancel: &CancellationToken) -> VoiceResult<PlayOutcome> {
        for _ in 0..self.play_ms {
            if cancel.is_cancelled() {
                self.log.lock().unwrap().interrupted += 1;
                return Ok(PlayOutcome::Interrupted);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.log.lock().unwrap().finished += 1;
        Ok(PlayOutcome::Finished)
    }
}

/// Audio device fed by a [`FrameFeed`] with an in-memory output.
pub struct FakeDevice {
    input: Mutex<Option<std_mpsc::Receiver<Vec<f32>>>>,
    play_ms: u64,
    fail_input: bool,
    failing_reads: Arc<AtomicUsize>,
    pub sink_log: Arc<Mutex<SinkLog>>,
}

impl FakeDevice {
    pub fn new(play_ms: u64) -> (Arc<Self>, FrameFeed) {
        let (tx, rx) = std_mpsc::channel();
        let device = Arc::new(Self {
            input: Mutex::new(Some(rx)),
            play_ms,
            fail_input: false,
            failing_reads: Arc::new(AtomicUsize::new(0)),
            sink_log: Arc::new(Mutex::new(SinkLog::default())),
        });
        (device, FrameFeed { tx })
    }

    /// Make the next `n` reads fail with a stream error.
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            input: Mutex::new(None),
            play_ms: 0,
            fail_input: true,
            failing_reads: Arc::new(AtomicUsize::new(0)),
            sink_log: Arc::new(Mutex::new(SinkLog::default())),
        })
    }
}

impl AudioDevice for FakeDevice {
    fn open_input(&self, _device: Option<&str>, _rate: u32, _frame_len: usize) -> VoiceResult<Box<dyn FrameSource>> {
        if self.fail_input {
            return Err(VoiceError::AudioDevice("no input device available".into()));
        }
        let rx = self
            .input
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| VoiceError::AudioDevice("input already open".into()))?;
        Ok(Box::new(FeedSource {
            rx,
            failing_reads: Arc::clone(&self.failing_reads),
        }))
    }

    fn open_output(&self, _device: Option<&str>, _rate: u32) -> VoiceResult<Box<dyn AudioSink>> {
        Ok(Box::new(MemorySink {
            play_ms: self.play_ms,
            log: Arc::clone(&self.sink_log),
        }))
    }
}

/// One scripted recognizer response.
pub enum Step {
    Text(&'static str),
    Hang(u64),
    Fail,
}

/// Returns scripted transcripts in call order; empty text once the script runs out.
#[derive(Default)]
pub struct ScriptedRecognizer {
    steps: Mutex<VecDeque<Step>>,
    pub calls: AtomicUsize,
}

impl ScriptedRecognizer {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
        })
    }
}

impl Recognizer for ScriptedRecognizer {
    fn recognize(&self, samples: &[f32], _sample_rate: u32) -> VoiceResult<Transcript> {
        assert!(!samples.is_empty());
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Text(text)) => Ok(Transcript::new(text)),
            Some(Step::Hang(ms)) => {
                std::thread::sleep(Duration::from_millis(ms));
                Ok(Transcript::new("too late"))
            }
            Some(Step::Fail) => Err(VoiceError::Recognition("engine offline".into())),
            None => Ok(Transcript::new("")),
        }
    }
}

/// Answers "hello" with "hi there", anything else with a fixed reply.
pub struct FakeReasoner {
    pub reply: &'static str,
    pub completes: AtomicUsize,
    pub summarizes: AtomicUsize,
    pub requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl FakeReasoner {
    pub fn new(reply: &'static str) -> Arc<Self> {
        Arc::new(Self {
            reply,
            completes: AtomicUsize::new(0),
            summarizes: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }
}

impl ReasoningBackend for FakeReasoner {
    fn complete(&self, messages: &[ChatMessage]) -> VoiceResult<String> {
        self.completes.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(messages.to_vec());
        let last = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        if last == "hello" {
            Ok("hi there".to_string())
        } else {
            Ok(self.reply.to_string())
        }
    }

    fn summarize(&self, messages: &[ChatMessage]) -> VoiceResult<String> {
        self.summarizes.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{} earlier messages", messages.len()))
    }
}

/// Produces a short WAV and counts calls.
#[derive(Default)]
pub struct FakeSynthesizer {
    pub calls: AtomicUsize,
}

impl Synthesizer for FakeSynthesizer {
    fn synthesize(&self, _text: &str, _params: &VoiceParams) -> VoiceResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        encode_wav(&[0.1; 1600], 16000)
    }
}

/// Wait until a transition matching `pred` is published; returns it.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<Transition>, pred: F) -> Transition
where
    F: Fn(&Transition) -> bool,
{
    let fut = async {
        loop {
            match rx.recv().await {
                Ok(t) if pred(&t) => return t,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("transition channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out waiting for transition")
}

pub fn to(state: TurnState) -> impl Fn(&Transition) -> bool {
    move |t| t.to == state
}
