//! Session orchestrator - the turn-taking state machine
//!
//! This module ties together capture, recognition, conversation and playback.
//! Every worker reports to one event channel; the orchestrator is its only
//! consumer and the only place state changes, so exactly one turn is in
//! flight at a time:
//!
//! `idle → listening → recognizing → reasoning → speaking → listening`
//!
//! with `shutdown` reachable from every state.

use crate::audio::{AudioDevice, CpalDevice};
use crate::cache::CacheManager;
use crate::capture::{spawn_capture, CaptureContext, CaptureGate, CaptureStats};
use crate::config::VoiceConfig;
use crate::conversation::{ConversationManager, ConversationRequest, ConversationSummary, Reply};
use crate::error::{VoiceError, VoiceResult};
use crate::llm::{ChatCompletionsBackend, ReasoningBackend};
use crate::playback::{OutputThread, PlaybackOutcome, PlaybackReport, PlaybackScheduler};
use crate::recognition::{RecognitionDispatcher, RecognitionFailure, RecognitionResult};
use crate::stt::{OpenAiRecognizer, Recognizer};
use crate::tts::{OpenAiSynthesizer, Synthesizer};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Events buffered between the workers and the orchestrator.
const EVENT_QUEUE: usize = 64;

/// Turn-taking policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnTakingConfig {
    /// Let user speech interrupt a reply (default: off)
    pub barge_in: bool,
    /// Consecutive speech frames during playback that count as barge-in (default: 8)
    pub barge_in_frames: usize,
    /// Pause after a reply finishes before capture resumes; 0 resumes at once
    pub resume_delay_ms: u64,
}

impl Default for TurnTakingConfig {
    fn default() -> Self {
        Self {
            barge_in: false,
            barge_in_frames: 8,
            resume_delay_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Listening,
    Recognizing,
    Reasoning,
    Speaking,
    Shutdown,
}

/// One state change, published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: TurnState,
    pub to: TurnState,
    pub cause: String,
}

/// Completion events reported by the workers.
#[derive(Debug)]
pub enum SessionEvent {
    UtteranceCaptured { utterance_id: u64, duration: Duration },
    Recognized(RecognitionResult),
    Replied(VoiceResult<Reply>),
    PlaybackFinished(PlaybackReport),
    BargeIn { playback_id: u64 },
    CaptureDegraded(String),
    CaptureStopped,
}

/// External collaborators, injected at construction.
#[derive(Clone)]
pub struct Backends {
    pub recognizer: Arc<dyn Recognizer>,
    pub reasoner: Arc<dyn ReasoningBackend>,
    /// Required only when speech output is enabled
    pub synthesizer: Option<Arc<dyn Synthesizer>>,
    pub audio: Arc<dyn AudioDevice>,
}

impl Backends {
    /// The shipped HTTP adapters and host audio, built from `config`.
    /// Blocking HTTP clients: call outside of an async runtime.
    pub fn from_config(config: &VoiceConfig) -> VoiceResult<Self> {
        let recognizer = OpenAiRecognizer::new(&config.stt, config.recognition.timeout())?;
        let reasoner = ChatCompletionsBackend::new(
            &config.llm,
            Duration::from_millis(config.conversation.timeout_ms),
        )?;
        let synthesizer: Option<Arc<dyn Synthesizer>> = if config.tts.enabled {
            Some(Arc::new(OpenAiSynthesizer::new(
                &config.tts,
                Duration::from_millis(config.playback.timeout_ms),
            )?))
        } else {
            None
        };
        info!(model = reasoner.model(), "🔌 Backends configured");
        Ok(Self {
            recognizer: Arc::new(recognizer),
            reasoner: Arc::new(reasoner),
            synthesizer,
            audio: Arc::new(CpalDevice),
        })
    }
}

/// Session statistics returned when the orchestrator stops.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionReport {
    pub utterances: u64,
    pub short_discarded: u64,
    pub recognized: u64,
    pub empty_transcripts: u64,
    pub recognition_failures: u64,
    pub dropped: u64,
    pub turns_recorded: u64,
    pub summaries: u64,
    pub degraded_replies: u64,
    pub replies_spoken: u64,
    pub replies_interrupted: u64,
    pub text_only_replies: u64,
    pub barge_ins: u64,
    pub synthesis_cache_hits: u64,
    pub capture_degraded: bool,
    pub record: Option<PathBuf>,
    pub transcript: Option<PathBuf>,
}

/// The main voice orchestration system
pub struct Orchestrator {
    config: VoiceConfig,
    backends: Backends,
    transitions: broadcast::Sender<Transition>,
}

impl Orchestrator {
    pub fn new(config: VoiceConfig, backends: Backends) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            config,
            backends,
            transitions,
        }
    }

    /// Observe state transitions. Subscribe before calling `run`.
    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    /// Start every worker and drive the state machine until `shutdown` fires
    /// or a fatal error occurs. Startup failures (device, record) are returned
    /// before any turn is taken.
    pub async fn run(self, shutdown: CancellationToken) -> VoiceResult<SessionReport> {
        let Orchestrator {
            config,
            backends,
            transitions,
        } = self;
        info!("🎭 Starting Parley session");

        let cancel = shutdown.child_token();
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE);
        let (gate_tx, gate_rx) = watch::channel(CaptureGate::Listening);

        let recordings = Arc::new(CacheManager::open(
            "recordings",
            &config.cache.recordings_dir,
            config.cache.recordings.clone(),
        )?);
        let manager = ConversationManager::open(
            config.conversation.clone(),
            Arc::clone(&backends.reasoner),
            cancel.clone(),
        )?;

        let (scheduler, output) = match (config.tts.enabled, &backends.synthesizer) {
            (true, Some(synthesizer)) => {
                let cache = Arc::new(CacheManager::open(
                    "synthesis",
                    &config.cache.synthesis_dir,
                    config.cache.synthesis.clone(),
                )?);
                let output = OutputThread::spawn(
                    Arc::clone(&backends.audio),
                    config.audio.output_device.clone(),
                    config.audio.sample_rate,
                )
                .await?;
                let scheduler = PlaybackScheduler::new(
                    &config.playback,
                    Arc::clone(synthesizer),
                    cache,
                    &output,
                    cancel.clone(),
                );
                (scheduler, Some(output))
            }
            (true, None) => {
                return Err(VoiceError::Config(
                    "speech output is enabled but no synthesizer is configured".into(),
                ))
            }
            (false, _) => {
                info!("🔇 Speech output disabled, replies are text-only");
                (PlaybackScheduler::disabled(), None)
            }
        };

        let dispatcher = Arc::new(RecognitionDispatcher::new(&config.recognition));
        let capture = spawn_capture(CaptureContext {
            audio: config.audio.clone(),
            vad: config.vad.clone(),
            segmenter: config.segmenter.clone(),
            turn_taking: config.turn_taking.clone(),
            device: Arc::clone(&backends.audio),
            recordings,
            dispatcher: Arc::clone(&dispatcher),
            events: events_tx.clone(),
            gate: gate_rx,
            cancel: cancel.clone(),
        })
        .await;
        let capture = match capture {
            Ok(handle) => handle,
            Err(e) => {
                cancel.cancel();
                drop(scheduler);
                if let Some(output) = output {
                    output.shutdown().await;
                }
                return Err(e);
            }
        };

        let recognition_task = tokio::spawn(Arc::clone(&dispatcher).run(
            Arc::clone(&backends.recognizer),
            config.recognition.timeout(),
            events_tx.clone(),
            cancel.clone(),
        ));
        let (conversation_tx, conversation_rx) = mpsc::channel(4);
        let conversation_task = tokio::spawn(manager.serve(conversation_rx, events_tx.clone()));

        let mut session = Session {
            state: TurnState::Idle,
            transitions,
            gate: gate_tx,
            conversation: conversation_tx,
            scheduler,
            events: events_tx,
            current: None,
            outstanding: 0,
            ready: VecDeque::new(),
            ready_limit: config.recognition.backlog.max(1),
            resume_delay: Duration::from_millis(config.turn_taking.resume_delay_ms),
            report: SessionReport::default(),
        };
        session.transition(TurnState::Listening, "components ready");

        let outcome: VoiceResult<()> = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                event = events_rx.recv() => match event {
                    Some(event) => {
                        if let Err(e) = session.handle(event) {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
            }
        };

        // Unwind: stop intake, cancel outstanding calls, then join the workers.
        let cause = match &outcome {
            Ok(()) => "termination signal".to_string(),
            Err(e) => format!("fatal {} failure", e.component()),
        };
        session.transition(TurnState::Shutdown, cause);
        cancel.cancel();
        events_rx.close();
        session.stop_playback();

        let Session {
            scheduler,
            conversation,
            mut report,
            ..
        } = session;
        drop(conversation);

        match conversation_task.await {
            Ok(summary) => report.absorb_conversation(summary),
            Err(e) => warn!(error = %e, "Conversation worker failed"),
        }
        if let Err(e) = recognition_task.await {
            warn!(error = %e, "Recognition worker failed");
        }
        match tokio::task::spawn_blocking(move || capture.join()).await {
            Ok(Ok(stats)) => report.absorb_capture(stats),
            _ => warn!("Capture thread panicked"),
        }
        report.synthesis_cache_hits = scheduler.cache_hits();
        drop(scheduler);
        if let Some(output) = output {
            output.shutdown().await;
        }

        info!(
            utterances = report.utterances,
            turns = report.turns_recorded,
            "🛑 Parley session stopped"
        );
        outcome.map(|()| report)
    }
}

impl SessionReport {
    fn absorb_conversation(&mut self, summary: ConversationSummary) {
        self.turns_recorded = summary.turns_recorded;
        self.summaries = summary.summaries;
        self.degraded_replies = summary.degraded_replies;
        self.record = summary.record;
        self.transcript = summary.transcript;
    }

    fn absorb_capture(&mut self, stats: CaptureStats) {
        self.short_discarded = stats.short_discarded;
        self.capture_degraded |= stats.degraded;
    }
}

/// State owned by the event loop.
struct Session {
    state: TurnState,
    transitions: broadcast::Sender<Transition>,
    gate: watch::Sender<CaptureGate>,
    conversation: mpsc::Sender<ConversationRequest>,
    scheduler: PlaybackScheduler,
    events: mpsc::Sender<SessionEvent>,
    /// Reply being spoken: assistant turn id and its interrupter
    current: Option<(u64, CancellationToken)>,
    /// Utterances captured whose results have not arrived
    outstanding: usize,
    /// Results that arrived while a turn was in flight
    ready: VecDeque<RecognitionResult>,
    /// Oldest queued result is dropped beyond this
    ready_limit: usize,
    resume_delay: Duration,
    report: SessionReport,
}

impl Session {
    fn transition(&mut self, to: TurnState, cause: impl Into<String>) {
        let from = self.state;
        if from == to {
            return;
        }
        let cause = cause.into();
        info!("🔀 {:?} → {:?} ({})", from, to, cause);
        self.state = to;
        let _ = self.transitions.send(Transition { from, to, cause });
    }

    fn handle(&mut self, event: SessionEvent) -> VoiceResult<()> {
        match event {
            SessionEvent::UtteranceCaptured { utterance_id, duration } => {
                debug!(utterance_id, "Utterance captured ({:?})", duration);
                self.report.utterances += 1;
                self.outstanding += 1;
                if self.state == TurnState::Listening {
                    self.transition(TurnState::Recognizing, "utterance captured");
                }
            }
            SessionEvent::Recognized(result) => {
                self.outstanding = self.outstanding.saturating_sub(1);
                self.count(&result);
                match self.state {
                    TurnState::Listening | TurnState::Recognizing => {
                        if self.state == TurnState::Listening {
                            self.transition(TurnState::Recognizing, "result ready");
                        }
                        self.process(result);
                        self.advance();
                    }
                    _ => self.enqueue(result),
                }
            }
            SessionEvent::Replied(Ok(reply)) => self.on_reply(reply),
            SessionEvent::Replied(Err(e)) if e.is_fatal() => {
                error!(error = %e, "❌ Unrecoverable {} failure", e.component());
                return Err(e);
            }
            SessionEvent::Replied(Err(e)) => {
                warn!(error = %e, "No reply for this turn");
                self.transition(TurnState::Listening, "reasoning aborted");
                self.advance();
            }
            SessionEvent::PlaybackFinished(report) => self.on_playback_finished(report),
            SessionEvent::BargeIn { playback_id } => self.on_barge_in(playback_id),
            SessionEvent::CaptureDegraded(reason) => {
                warn!(reason = %reason, "⚠️ Capture degraded; session continues without input");
                self.report.capture_degraded = true;
            }
            SessionEvent::CaptureStopped => info!("Input ended"),
        }
        Ok(())
    }

    fn enqueue(&mut self, result: RecognitionResult) {
        debug!(utterance_id = result.utterance_id, "Turn in flight, result queued");
        if self.ready.len() >= self.ready_limit {
            if let Some(oldest) = self.ready.pop_front() {
                warn!(
                    utterance_id = oldest.utterance_id,
                    limit = self.ready_limit,
                    "⚠️ Too many transcripts waiting, dropping oldest"
                );
                if oldest.is_usable() {
                    self.report.recognized = self.report.recognized.saturating_sub(1);
                    self.report.dropped += 1;
                }
            }
        }
        self.ready.push_back(result);
    }

    fn count(&mut self, result: &RecognitionResult) {
        match &result.failure {
            None if result.text.trim().is_empty() => self.report.empty_transcripts += 1,
            None => self.report.recognized += 1,
            Some(RecognitionFailure::Dropped) => self.report.dropped += 1,
            Some(_) => self.report.recognition_failures += 1,
        }
    }

    /// Handle one result while `Recognizing`.
    fn process(&mut self, result: RecognitionResult) {
        if !result.is_usable() {
            let cause = match result.failure {
                None => "no speech detected",
                Some(RecognitionFailure::Timeout) => "recognizer timed out",
                Some(RecognitionFailure::Backend(_)) => "recognition failed",
                Some(RecognitionFailure::Dropped) => "utterance dropped",
            };
            self.transition(TurnState::Listening, cause);
            return;
        }
        self.transition(TurnState::Reasoning, "transcript ready");
        let request = ConversationRequest::Respond {
            text: result.text,
            recording: result.recording,
        };
        if let Err(e) = self.conversation.try_send(request) {
            error!(error = %e, "Conversation worker unavailable");
            self.transition(TurnState::Listening, "conversation unavailable");
        }
    }

    /// Back in `Listening`: pick up queued results or wait on outstanding ones.
    fn advance(&mut self) {
        while self.state == TurnState::Listening {
            if let Some(result) = self.ready.pop_front() {
                self.transition(TurnState::Recognizing, "queued result");
                self.process(result);
            } else {
                if self.outstanding > 0 {
                    self.transition(TurnState::Recognizing, "awaiting recognition");
                }
                break;
            }
        }
    }

    fn on_reply(&mut self, reply: Reply) {
        if self.state != TurnState::Reasoning {
            warn!(state = ?self.state, "Reply outside of reasoning, ignored");
            return;
        }
        let turn_id = reply.assistant_turn.id;
        let _ = self.gate.send(CaptureGate::Speaking { playback_id: turn_id });
        self.transition(
            TurnState::Speaking,
            if reply.degraded { "apology" } else { "reply ready" },
        );

        let handle = self.scheduler.speak(turn_id, &reply.assistant_turn.text);
        self.current = Some((turn_id, handle.interrupter()));
        let events = self.events.clone();
        tokio::spawn(async move {
            let report = handle.finished().await;
            let _ = events.send(SessionEvent::PlaybackFinished(report)).await;
        });
    }

    fn on_playback_finished(&mut self, report: PlaybackReport) {
        if let Some(artifact) = &report.artifact {
            let link = ConversationRequest::AttachAudio {
                turn_id: artifact.turn_id,
                path: artifact.path.clone(),
            };
            if let Err(e) = self.conversation.try_send(link) {
                warn!(turn_id = artifact.turn_id, error = %e, "Speech audio not linked to turn");
            }
        }
        match self.current {
            Some((id, _)) if id == report.turn_id => self.current = None,
            _ => {
                debug!(turn_id = report.turn_id, "Stale playback report ignored");
                return;
            }
        }

        let cause = match &report.outcome {
            PlaybackOutcome::Completed => {
                self.report.replies_spoken += 1;
                "playback completed"
            }
            PlaybackOutcome::Interrupted => {
                self.report.replies_interrupted += 1;
                "playback interrupted"
            }
            PlaybackOutcome::TextOnly(_) => {
                self.report.text_only_replies += 1;
                "text-only reply"
            }
            PlaybackOutcome::Disabled => {
                self.report.text_only_replies += 1;
                "speech output disabled"
            }
        };
        let gate = if report.outcome == PlaybackOutcome::Completed && !self.resume_delay.is_zero() {
            CaptureGate::ResumeAt(Instant::now() + self.resume_delay)
        } else {
            CaptureGate::Listening
        };
        let _ = self.gate.send(gate);
        self.transition(TurnState::Listening, cause);
        self.advance();
    }

    fn on_barge_in(&mut self, playback_id: u64) {
        let matches = matches!(self.current, Some((id, _)) if id == playback_id);
        if self.state != TurnState::Speaking || !matches {
            debug!(playback_id, "Barge-in for a finished reply ignored");
            return;
        }
        self.stop_playback();
        self.report.barge_ins += 1;
        self.report.replies_interrupted += 1;
        let _ = self.gate.send(CaptureGate::Listening);
        self.transition(TurnState::Listening, "barge-in");
        self.advance();
    }

    fn stop_playback(&mut self) {
        if let Some((_, interrupter)) = self.current.take() {
            interrupter.cancel();
        }
    }
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TurnState::Idle => "idle",
            TurnState::Listening => "listening",
            TurnState::Recognizing => "recognizing",
            TurnState::Reasoning => "reasoning",
            TurnState::Speaking => "speaking",
            TurnState::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ConversationTurn, Role};
    use chrono::Utc;

    type Requests = mpsc::Receiver<ConversationRequest>;

    fn session() -> (Session, broadcast::Receiver<Transition>, Requests, watch::Receiver<CaptureGate>) {
        let (transitions, rx) = broadcast::channel(64);
        let (gate, gate_rx) = watch::channel(CaptureGate::Listening);
        let (conversation, conv_rx) = mpsc::channel(4);
        let (events, _) = mpsc::channel(4);
        let session = Session {
            state: TurnState::Listening,
            transitions,
            gate,
            conversation,
            scheduler: PlaybackScheduler::disabled(),
            events,
            current: None,
            outstanding: 0,
            ready: VecDeque::new(),
            ready_limit: 4,
            resume_delay: Duration::from_millis(250),
            report: SessionReport::default(),
        };
        (session, rx, conv_rx, gate_rx)
    }

    fn result(id: u64, text: &str, failure: Option<RecognitionFailure>) -> RecognitionResult {
        RecognitionResult {
            utterance_id: id,
            text: text.to_string(),
            confidence: None,
            timestamp: Utc::now(),
            failure,
            recording: None,
        }
    }

    fn reply(id: u64, text: &str) -> Reply {
        let turn = |id, role, text: &str| ConversationTurn {
            id,
            role,
            text: text.to_string(),
            timestamp: Utc::now(),
            audio: None,
        };
        Reply {
            user_turn: turn(id - 1, Role::User, "q"),
            assistant_turn: turn(id, Role::Assistant, text),
            degraded: false,
        }
    }

    fn respond_text(request: ConversationRequest) -> String {
        match request {
            ConversationRequest::Respond { text, .. } => text,
            other => panic!("expected a reply request, got {:?}", other),
        }
    }

    fn states(rx: &mut broadcast::Receiver<Transition>) -> Vec<TurnState> {
        let mut out = Vec::new();
        while let Ok(t) = rx.try_recv() {
            out.push(t.to);
        }
        out
    }

    #[tokio::test]
    async fn failed_recognition_returns_to_listening() {
        let (mut s, mut rx, mut conv, _gate) = session();
        s.handle(SessionEvent::UtteranceCaptured {
            utterance_id: 1,
            duration: Duration::from_millis(900),
        })
        .unwrap();
        s.handle(SessionEvent::Recognized(result(1, "", Some(RecognitionFailure::Timeout))))
            .unwrap();
        assert_eq!(states(&mut rx), vec![TurnState::Recognizing, TurnState::Listening]);
        assert!(conv.try_recv().is_err());
        assert_eq!(s.report.recognition_failures, 1);
    }

    #[tokio::test]
    async fn results_during_a_turn_are_queued_in_order() {
        let (mut s, mut rx, mut conv, _gate) = session();
        for id in 1..=3 {
            s.handle(SessionEvent::UtteranceCaptured {
                utterance_id: id,
                duration: Duration::from_secs(1),
            })
            .unwrap();
        }
        s.handle(SessionEvent::Recognized(result(1, "first", None))).unwrap();
        assert_eq!(s.state, TurnState::Reasoning);
        s.handle(SessionEvent::Recognized(result(2, "second", None))).unwrap();
        s.handle(SessionEvent::Recognized(result(3, "third", None))).unwrap();
        assert_eq!(s.ready.len(), 2);
        assert_eq!(respond_text(conv.try_recv().unwrap()), "first");
        assert!(conv.try_recv().is_err());

        s.handle(SessionEvent::Replied(Ok(reply(2, "answer")))).unwrap();
        assert_eq!(s.state, TurnState::Speaking);
        s.handle(SessionEvent::PlaybackFinished(PlaybackReport {
            turn_id: 2,
            outcome: PlaybackOutcome::Disabled,
            artifact: None,
        }))
        .unwrap();

        // the next queued transcript starts the next turn immediately
        assert_eq!(s.state, TurnState::Reasoning);
        assert_eq!(respond_text(conv.try_recv().unwrap()), "second");
        let seen = states(&mut rx);
        assert_eq!(
            seen,
            vec![
                TurnState::Recognizing,
                TurnState::Reasoning,
                TurnState::Speaking,
                TurnState::Listening,
                TurnState::Recognizing,
                TurnState::Reasoning,
            ]
        );
    }

    #[tokio::test]
    async fn barge_in_interrupts_and_ignores_stale_report() {
        let (mut s, mut rx, _conv, gate) = session();
        s.state = TurnState::Reasoning;
        s.handle(SessionEvent::Replied(Ok(reply(8, "a long answer")))).unwrap();
        assert_eq!(*gate.borrow(), CaptureGate::Speaking { playback_id: 8 });
        let interrupter = s.current.as_ref().unwrap().1.clone();

        s.handle(SessionEvent::BargeIn { playback_id: 8 }).unwrap();
        assert!(interrupter.is_cancelled());
        assert_eq!(s.state, TurnState::Listening);
        assert_eq!(*gate.borrow(), CaptureGate::Listening);
        assert_eq!(s.report.barge_ins, 1);

        s.handle(SessionEvent::PlaybackFinished(PlaybackReport {
            turn_id: 8,
            outcome: PlaybackOutcome::Interrupted,
            artifact: None,
        }))
        .unwrap();
        assert_eq!(s.state, TurnState::Listening);
        let seen = states(&mut rx);
        assert_eq!(seen, vec![TurnState::Speaking, TurnState::Listening]);
    }

    #[tokio::test]
    async fn completed_playback_delays_capture() {
        let (mut s, _rx, _conv, gate) = session();
        s.state = TurnState::Reasoning;
        s.handle(SessionEvent::Replied(Ok(reply(4, "ok")))).unwrap();
        s.handle(SessionEvent::PlaybackFinished(PlaybackReport {
            turn_id: 4,
            outcome: PlaybackOutcome::Completed,
            artifact: None,
        }))
        .unwrap();
        assert!(matches!(*gate.borrow(), CaptureGate::ResumeAt(_)));
        assert_eq!(s.report.replies_spoken, 1);
    }

    #[tokio::test]
    async fn persistence_failure_is_fatal() {
        let (mut s, _rx, _conv, _gate) = session();
        s.state = TurnState::Reasoning;
        let err = s
            .handle(SessionEvent::Replied(Err(VoiceError::Persistence("disk full".into()))))
            .unwrap_err();
        assert_eq!(err.component(), "conversation record");
    }

    #[tokio::test]
    async fn queued_transcripts_are_capped_oldest_first() {
        let (mut s, _rx, mut conv, _gate) = session();
        s.state = TurnState::Reasoning;
        for id in 1..=6 {
            s.handle(SessionEvent::UtteranceCaptured {
                utterance_id: id,
                duration: Duration::from_secs(1),
            })
            .unwrap();
            s.handle(SessionEvent::Recognized(result(id, &format!("t{}", id), None)))
                .unwrap();
        }
        assert_eq!(s.ready.len(), 4);
        assert_eq!(s.ready.front().unwrap().utterance_id, 3);
        assert_eq!(s.report.dropped, 2);
        assert_eq!(s.report.recognized, 4);

        s.handle(SessionEvent::Replied(Ok(reply(2, "answer")))).unwrap();
        s.handle(SessionEvent::PlaybackFinished(PlaybackReport {
            turn_id: 2,
            outcome: PlaybackOutcome::Disabled,
            artifact: None,
        }))
        .unwrap();
        assert_eq!(respond_text(conv.try_recv().unwrap()), "t3");
    }

    #[tokio::test]
    async fn reply_carries_recording_and_spoken_audio_is_linked() {
        let (mut s, _rx, mut conv, _gate) = session();
        s.handle(SessionEvent::UtteranceCaptured {
            utterance_id: 1,
            duration: Duration::from_secs(1),
        })
        .unwrap();
        let mut heard = result(1, "hello", None);
        heard.recording = Some(PathBuf::from("rec_1.wav"));
        s.handle(SessionEvent::Recognized(heard)).unwrap();
        assert_eq!(
            conv.try_recv().unwrap(),
            ConversationRequest::Respond {
                text: "hello".into(),
                recording: Some(PathBuf::from("rec_1.wav")),
            }
        );

        s.handle(SessionEvent::Replied(Ok(reply(2, "hi")))).unwrap();
        s.handle(SessionEvent::PlaybackFinished(PlaybackReport {
            turn_id: 2,
            outcome: PlaybackOutcome::Completed,
            artifact: Some(crate::playback::SynthesisArtifact {
                turn_id: 2,
                path: PathBuf::from("tts_ab.wav"),
                cache_key: "ab".into(),
                from_cache: false,
            }),
        }))
        .unwrap();
        assert_eq!(
            conv.try_recv().unwrap(),
            ConversationRequest::AttachAudio {
                turn_id: 2,
                path: PathBuf::from("tts_ab.wav"),
            }
        );
    }

    #[test]
    fn state_names() {
        assert_eq!(TurnState::Recognizing.to_string(), "recognizing");
    }
}
