//! Recognition dispatcher
//!
//! Utterances wait in a bounded backlog and are recognized one at a time by a
//! single worker, so results leave in submission order. When the backlog is
//! full the oldest utterance that has not started is dropped: its audio is
//! freed immediately and a `Dropped` result takes its place in the order.

use crate::error::VoiceError;
use crate::orchestrator::SessionEvent;
use crate::segmenter::Utterance;
use crate::stt::Recognizer;
use crate::worker::SingleFlight;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Utterances allowed to wait for the recognizer (default: 4)
    pub backlog: usize,
    /// Per-call recognizer timeout
    pub timeout_ms: u64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            backlog: 4,
            timeout_ms: 15_000,
        }
    }
}

impl RecognitionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Why a result carries no transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionFailure {
    Timeout,
    Backend(String),
    /// Evicted from a full backlog before recognition started
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionResult {
    pub utterance_id: u64,
    pub text: String,
    pub confidence: Option<f32>,
    pub timestamp: DateTime<Utc>,
    pub failure: Option<RecognitionFailure>,
    /// Recording of the utterance in the cache, if one was written
    pub recording: Option<PathBuf>,
}

impl RecognitionResult {
    fn failed(utterance_id: u64, failure: RecognitionFailure, recording: Option<PathBuf>) -> Self {
        Self {
            utterance_id,
            text: String::new(),
            confidence: None,
            timestamp: Utc::now(),
            failure: Some(failure),
            recording,
        }
    }

    /// A transcript worth a conversation turn: no failure and some text.
    pub fn is_usable(&self) -> bool {
        self.failure.is_none() && !self.text.trim().is_empty()
    }
}

/// What `submit` did with the utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Queued after dropping the audio of this older utterance
    DroppedOldest(u64),
}

/// An utterance evicted from the backlog, still owed a `Dropped` result.
struct DroppedMarker {
    id: u64,
    recording: Option<PathBuf>,
}

/// Evictions always take the oldest waiting utterance, so every marker is
/// older than every waiting utterance and is reported first.
#[derive(Default)]
struct Queue {
    dropped: VecDeque<DroppedMarker>,
    waiting: VecDeque<Utterance>,
}

enum Next {
    Dropped(DroppedMarker),
    Recognize(Utterance),
}

pub struct RecognitionDispatcher {
    backlog: usize,
    queue: Mutex<Queue>,
    notify: Notify,
}

impl RecognitionDispatcher {
    pub fn new(config: &RecognitionConfig) -> Self {
        Self {
            backlog: config.backlog.max(1),
            queue: Mutex::new(Queue::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an utterance. Never blocks; callable from the capture thread.
    pub fn submit(&self, utterance: Utterance) -> SubmitOutcome {
        let mut outcome = SubmitOutcome::Queued;
        {
            let mut queue = self.lock();
            if queue.waiting.len() >= self.backlog {
                if let Some(oldest) = queue.waiting.pop_front() {
                    warn!(
                        utterance_id = oldest.id,
                        backlog = self.backlog,
                        "⚠️ Recognition backlog full, dropping oldest utterance"
                    );
                    outcome = SubmitOutcome::DroppedOldest(oldest.id);
                    queue.dropped.push_back(DroppedMarker {
                        id: oldest.id,
                        recording: oldest.recording.as_ref().map(|f| f.path().to_path_buf()),
                    });
                }
            }
            debug!(utterance_id = utterance.id, "📥 Utterance queued for recognition");
            queue.waiting.push_back(utterance);
        }
        self.notify.notify_one();
        outcome
    }

    /// Utterances waiting for the recognizer; never more than the backlog.
    pub fn pending(&self) -> usize {
        self.lock().waiting.len()
    }

    /// Dropped utterances whose `Dropped` result has not been sent yet.
    ///
    /// The worker reports these without calling the recognizer, so they only
    /// pile up for as long as one recognizer call lasts.
    pub fn unreported_drops(&self) -> usize {
        self.lock().dropped.len()
    }

    fn next(&self) -> Option<Next> {
        let mut queue = self.lock();
        if let Some(marker) = queue.dropped.pop_front() {
            return Some(Next::Dropped(marker));
        }
        queue.waiting.pop_front().map(Next::Recognize)
    }

    /// Worker loop: recognize queued utterances in order until `cancel` fires or
    /// the event channel closes.
    pub async fn run(
        self: Arc<Self>,
        recognizer: Arc<dyn Recognizer>,
        timeout: Duration,
        events: mpsc::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) {
        info!("🧠 Recognition worker started");
        let lane = SingleFlight::new("recognizer");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let next = match self.next() {
                Some(next) => next,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.notify.notified() => continue,
                    }
                }
            };

            let result = match next {
                Next::Dropped(marker) => {
                    RecognitionResult::failed(marker.id, RecognitionFailure::Dropped, marker.recording)
                }
                Next::Recognize(utterance) => {
                    let result = recognize(&lane, &recognizer, &utterance, timeout, &cancel).await;
                    drop(utterance);
                    match result {
                        Some(r) => r,
                        None => break,
                    }
                }
            };

            if events.send(SessionEvent::Recognized(result)).await.is_err() {
                debug!("Event channel closed, recognition worker exiting");
                break;
            }
        }
        info!("🧠 Recognition worker stopped");
    }
}

/// Recognize one utterance. `None` means shutdown interrupted the call.
async fn recognize(
    lane: &SingleFlight,
    recognizer: &Arc<dyn Recognizer>,
    utterance: &Utterance,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Option<RecognitionResult> {
    let id = utterance.id;
    let recording = utterance.recording.as_ref().map(|f| f.path().to_path_buf());
    let samples = utterance.samples();
    let sample_rate = utterance.sample_rate;
    let recognizer = Arc::clone(recognizer);

    let outcome = lane
        .call(timeout, cancel, move || recognizer.recognize(&samples, sample_rate))
        .await;

    Some(match outcome {
        Ok(transcript) => {
            info!(utterance_id = id, text = %transcript.text, "📝 Recognized");
            RecognitionResult {
                utterance_id: id,
                text: transcript.text,
                confidence: transcript.confidence,
                timestamp: Utc::now(),
                failure: None,
                recording,
            }
        }
        Err(VoiceError::Timeout { .. }) => {
            warn!(utterance_id = id, "Recognizer timed out");
            RecognitionResult::failed(id, RecognitionFailure::Timeout, recording)
        }
        Err(_) if cancel.is_cancelled() => return None,
        Err(e) => {
            warn!(utterance_id = id, error = %e, "Recognition failed");
            RecognitionResult::failed(id, RecognitionFailure::Backend(e.to_string()), recording)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFrame;
    use crate::error::VoiceResult;
    use crate::stt::Transcript;

    fn utterance(id: u64) -> Utterance {
        Utterance {
            id,
            frames: vec![AudioFrame::new(0, vec![id as f32 / 100.0; 480])],
            sample_rate: 16000,
            frame_ms: 30,
            started_at: Utc::now(),
            speech_frames: 1,
            recording: None,
        }
    }

    /// Echoes the utterance id (encoded in the first sample) after a per-id delay.
    struct Slow;

    impl Recognizer for Slow {
        fn recognize(&self, samples: &[f32], _sample_rate: u32) -> VoiceResult<Transcript> {
            let id = (samples[0] * 100.0).round() as u64;
            std::thread::sleep(Duration::from_millis(if id % 2 == 1 { 40 } else { 5 }));
            Ok(Transcript::new(format!("u{}", id)))
        }
    }

    #[test]
    fn full_backlog_drops_oldest_waiting() {
        let dispatcher = RecognitionDispatcher::new(&RecognitionConfig {
            backlog: 2,
            ..Default::default()
        });
        assert_eq!(dispatcher.submit(utterance(1)), SubmitOutcome::Queued);
        assert_eq!(dispatcher.submit(utterance(2)), SubmitOutcome::Queued);
        assert_eq!(dispatcher.submit(utterance(3)), SubmitOutcome::DroppedOldest(1));
        assert_eq!(dispatcher.submit(utterance(4)), SubmitOutcome::DroppedOldest(2));
        assert_eq!(dispatcher.pending(), 2);
        assert_eq!(dispatcher.unreported_drops(), 2);
    }

    #[tokio::test]
    async fn stalled_recognizer_keeps_backlog_bounded() {
        struct Stalled;
        impl Recognizer for Stalled {
            fn recognize(&self, samples: &[f32], _sample_rate: u32) -> VoiceResult<Transcript> {
                std::thread::sleep(Duration::from_millis(200));
                Ok(Transcript::new(format!("u{}", (samples[0] * 100.0).round() as u64)))
            }
        }

        let dispatcher = Arc::new(RecognitionDispatcher::new(&RecognitionConfig {
            backlog: 2,
            ..Default::default()
        }));
        let (tx, mut rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(&dispatcher).run(
            Arc::new(Stalled),
            Duration::from_secs(2),
            tx,
            cancel.clone(),
        ));

        dispatcher.submit(utterance(1));
        while dispatcher.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for id in 2..=21 {
            dispatcher.submit(utterance(id));
        }
        assert_eq!(dispatcher.pending(), 2);
        assert_eq!(dispatcher.unreported_drops(), 18);

        let mut seen = Vec::new();
        for _ in 1..=21 {
            match rx.recv().await {
                Some(SessionEvent::Recognized(r)) => seen.push((r.utterance_id, r.failure)),
                other => panic!("unexpected event {:?}", other.is_some()),
            }
        }
        let ids: Vec<u64> = seen.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, (1..=21).collect::<Vec<_>>());
        for (id, failure) in &seen {
            let dropped = (2..=19).contains(id);
            assert_eq!(*failure == Some(RecognitionFailure::Dropped), dropped, "utterance {}", id);
        }
        assert_eq!(dispatcher.unreported_drops(), 0);

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn results_keep_submission_order() {
        let dispatcher = Arc::new(RecognitionDispatcher::new(&RecognitionConfig {
            backlog: 3,
            ..Default::default()
        }));
        for id in 1..=5 {
            dispatcher.submit(utterance(id));
        }
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(&dispatcher).run(
            Arc::new(Slow),
            Duration::from_secs(2),
            tx,
            cancel.clone(),
        ));

        let mut seen = Vec::new();
        for _ in 0..5 {
            match rx.recv().await {
                Some(SessionEvent::Recognized(r)) => seen.push((r.utterance_id, r.failure.clone(), r.text)),
                other => panic!("unexpected event {:?}", other.is_some()),
            }
        }
        cancel.cancel();
        worker.await.unwrap();

        let ids: Vec<u64> = seen.iter().map(|s| s.0).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(seen[0].1, Some(RecognitionFailure::Dropped));
        assert_eq!(seen[1].1, Some(RecognitionFailure::Dropped));
        assert_eq!(seen[2].2, "u3");
        assert_eq!(seen[4].2, "u5");
    }

    #[tokio::test]
    async fn timeout_becomes_failure_marker() {
        struct Stuck;
        impl Recognizer for Stuck {
            fn recognize(&self, _: &[f32], _: u32) -> VoiceResult<Transcript> {
                std::thread::sleep(Duration::from_millis(300));
                Ok(Transcript::new("late"))
            }
        }

        let dispatcher = Arc::new(RecognitionDispatcher::new(&RecognitionConfig::default()));
        dispatcher.submit(utterance(7));
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(&dispatcher).run(
            Arc::new(Stuck),
            Duration::from_millis(20),
            tx,
            cancel.clone(),
        ));

        let Some(SessionEvent::Recognized(result)) = rx.recv().await else {
            panic!("expected a recognition result");
        };
        assert_eq!(result.utterance_id, 7);
        assert_eq!(result.failure, Some(RecognitionFailure::Timeout));
        assert!(!result.is_usable());
        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn timed_out_calls_never_overlap() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Default)]
        struct Counting {
            in_flight: AtomicUsize,
            peak: AtomicUsize,
        }
        impl Recognizer for Counting {
            fn recognize(&self, _: &[f32], _: u32) -> VoiceResult<Transcript> {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(120));
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(Transcript::new("late"))
            }
        }

        let dispatcher = Arc::new(RecognitionDispatcher::new(&RecognitionConfig::default()));
        for id in 1..=3 {
            dispatcher.submit(utterance(id));
        }
        let recognizer = Arc::new(Counting::default());
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(&dispatcher).run(
            recognizer.clone(),
            Duration::from_millis(30),
            tx,
            cancel.clone(),
        ));

        for id in 1..=3 {
            let Some(SessionEvent::Recognized(result)) = rx.recv().await else {
                panic!("expected a recognition result");
            };
            assert_eq!(result.utterance_id, id);
            assert_eq!(result.failure, Some(RecognitionFailure::Timeout));
        }
        cancel.cancel();
        worker.await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(recognizer.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_text_is_not_usable() {
        let mut result = RecognitionResult::failed(1, RecognitionFailure::Dropped, None);
        result.failure = None;
        assert!(!result.is_usable());
        result.text = "hello".into();
        assert!(result.is_usable());
    }
}
