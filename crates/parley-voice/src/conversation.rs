//! Conversation session manager
//!
//! Owns the dialogue history. The history is bounded: when an append pushes it
//! past `max_history`, everything but the most recent `keep_recent` turns is
//! folded into a single summary turn. Every turn is appended to a JSON Lines
//! record as soon as it exists.

use crate::error::{VoiceError, VoiceResult};
use crate::llm::{ChatMessage, ReasoningBackend};
use crate::orchestrator::SessionEvent;
use crate::worker::SingleFlight;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly voice assistant. Keep answers short and \
    natural for speech, usually one or two sentences. If you are not sure, say so.";

const DEFAULT_APOLOGY: &str = "Sorry, I'm having trouble answering right now. Please try again.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Upper bound on turns kept, summary included (default: 20)
    pub max_history: usize,
    /// Turns left untouched when the history is compacted (default: 10)
    pub keep_recent: usize,
    /// Per-call reasoning timeout
    pub timeout_ms: u64,
    /// Directory for session records
    pub record_dir: PathBuf,
    pub system_prompt: String,
    /// Assistant text used when the backend fails
    pub apology: String,
    /// Write a plain-text transcript next to the record when the session closes
    pub export_text: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_history: 20,
            keep_recent: 10,
            timeout_ms: 30_000,
            record_dir: PathBuf::from("conversation_records"),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            apology: DEFAULT_APOLOGY.to_string(),
            export_text: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Summary,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Summary => "Summary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: u64,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Recording (user) or synthesized speech (assistant) for this turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<PathBuf>,
}

impl ConversationTurn {
    fn to_message(&self) -> ChatMessage {
        match self.role {
            Role::User => ChatMessage::user(self.text.clone()),
            Role::Assistant => ChatMessage::assistant(self.text.clone()),
            Role::Summary => ChatMessage::system(format!("Summary of the earlier conversation: {}", self.text)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingReply,
}

/// Outcome of one `respond` call.
#[derive(Debug, Clone)]
pub struct Reply {
    pub user_turn: ConversationTurn,
    pub assistant_turn: ConversationTurn,
    /// The assistant turn is the apology, not a model answer
    pub degraded: bool,
}

/// Work handed to the conversation worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationRequest {
    /// Answer a transcript, optionally linked to its recording
    Respond { text: String, recording: Option<PathBuf> },
    /// Link spoken audio to an assistant turn once playback has it
    AttachAudio { turn_id: u64, path: PathBuf },
}

/// Links audio produced after a turn was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AudioLink {
    audio_for: u64,
    path: PathBuf,
    timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecordLine {
    Turn(ConversationTurn),
    Audio(AudioLink),
}

/// Append-only JSON Lines record: one line per turn, plus one per audio link.
#[derive(Debug)]
pub struct SessionLog {
    path: PathBuf,
    file: File,
}

impl SessionLog {
    /// Create `session_<YYYYmmdd_HHMMSS>.jsonl` under `dir`, keyed by `started`.
    pub fn create(dir: &Path, started: DateTime<Local>) -> VoiceResult<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| VoiceError::Persistence(format!("cannot create {}: {}", dir.display(), e)))?;
        let path = dir.join(format!("session_{}.jsonl", started.format("%Y%m%d_%H%M%S")));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| VoiceError::Persistence(format!("cannot open {}: {}", path.display(), e)))?;
        info!("📝 Conversation record: {}", path.display());
        Ok(Self { path, file })
    }

    pub fn append(&mut self, turn: &ConversationTurn) -> VoiceResult<()> {
        self.write_line(turn)
    }

    /// Record that `path` holds the audio of turn `turn_id`.
    pub fn append_audio(&mut self, turn_id: u64, path: &Path) -> VoiceResult<()> {
        self.write_line(&AudioLink {
            audio_for: turn_id,
            path: path.to_path_buf(),
            timestamp: Utc::now(),
        })
    }

    fn write_line<T: Serialize>(&mut self, entry: &T) -> VoiceResult<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.flush())
            .map_err(|e| VoiceError::Persistence(format!("{}: {}", self.path.display(), e)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every turn recorded in `path`, audio links applied.
    pub fn read(path: &Path) -> VoiceResult<Vec<ConversationTurn>> {
        let file = File::open(path).map_err(|e| VoiceError::Persistence(e.to_string()))?;
        let mut turns: Vec<ConversationTurn> = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| VoiceError::Persistence(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line)? {
                RecordLine::Turn(turn) => turns.push(turn),
                RecordLine::Audio(link) => {
                    if let Some(turn) = turns.iter_mut().rev().find(|t| t.id == link.audio_for) {
                        turn.audio = Some(link.path);
                    }
                }
            }
        }
        Ok(turns)
    }
}

/// What a finished session leaves behind.
#[derive(Debug, Clone, Default)]
pub struct ConversationSummary {
    pub turns_recorded: u64,
    pub summaries: u64,
    pub degraded_replies: u64,
    pub record: Option<PathBuf>,
    pub transcript: Option<PathBuf>,
}

pub struct ConversationManager {
    config: ConversationConfig,
    backend: Arc<dyn ReasoningBackend>,
    lane: SingleFlight,
    cancel: CancellationToken,
    turns: Vec<ConversationTurn>,
    state: SessionState,
    log: SessionLog,
    next_id: u64,
    turns_recorded: u64,
    summaries: u64,
    degraded_replies: u64,
}

impl ConversationManager {
    /// Start a session whose record is keyed by the current local time.
    pub fn open(
        config: ConversationConfig,
        backend: Arc<dyn ReasoningBackend>,
        cancel: CancellationToken,
    ) -> VoiceResult<Self> {
        let log = SessionLog::create(&config.record_dir, Local::now())?;
        Ok(Self {
            config,
            backend,
            lane: SingleFlight::new("reasoning backend"),
            cancel,
            turns: Vec::new(),
            state: SessionState::Idle,
            log,
            next_id: 1,
            turns_recorded: 0,
            summaries: 0,
            degraded_replies: 0,
        })
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn summaries(&self) -> u64 {
        self.summaries
    }

    pub fn record_path(&self) -> &Path {
        self.log.path()
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn new_turn(&mut self, role: Role, text: String) -> ConversationTurn {
        let turn = ConversationTurn {
            id: self.next_id,
            role,
            text,
            timestamp: Utc::now(),
            audio: None,
        };
        self.next_id += 1;
        turn
    }

    async fn append(&mut self, turn: ConversationTurn) -> VoiceResult<()> {
        self.log.append(&turn)?;
        self.turns_recorded += 1;
        self.turns.push(turn);
        if self.turns.len() > self.config.max_history {
            self.compact().await?;
        }
        Ok(())
    }

    /// Fold every turn except the most recent `keep_recent` into one summary turn.
    async fn compact(&mut self) -> VoiceResult<()> {
        let keep = self.config.keep_recent.min(self.turns.len());
        let split = self.turns.len() - keep;
        let old: Vec<ConversationTurn> = self.turns.drain(..split).collect();
        let messages: Vec<ChatMessage> = old.iter().map(ConversationTurn::to_message).collect();

        let backend = Arc::clone(&self.backend);
        let outcome = self.lane.call(self.timeout(), &self.cancel, move || {
            backend.summarize(&messages)
        })
        .await;

        match outcome {
            Ok(summary) if !summary.trim().is_empty() => {
                let turn = self.new_turn(Role::Summary, summary.trim().to_string());
                info!(folded = old.len(), "📋 History compacted into summary");
                self.summaries += 1;
                self.log.append(&turn)?;
                self.turns_recorded += 1;
                self.turns.insert(0, turn);
            }
            other => {
                if let Err(e) = other {
                    warn!(error = %e, "Summarization failed, truncating history");
                } else {
                    warn!("Summarization returned nothing, truncating history");
                }
                if let Some(previous) = old.into_iter().find(|t| t.role == Role::Summary) {
                    self.turns.insert(0, previous);
                }
            }
        }
        debug!(turns = self.turns.len(), "History size after compaction");
        Ok(())
    }

    fn request(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.turns.len() + 1);
        if !self.config.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(self.config.system_prompt.clone()));
        }
        messages.extend(self.turns.iter().map(ConversationTurn::to_message));
        messages
    }

    /// Append the user turn, ask the backend, append its reply.
    ///
    /// Backend failures produce the apology turn. Errors are returned only for
    /// persistence failures (fatal), a busy session, or shutdown.
    pub async fn respond(&mut self, user_text: &str) -> VoiceResult<Reply> {
        self.respond_with_recording(user_text, None).await
    }

    /// `respond`, with the user turn linked to the recording it came from.
    pub async fn respond_with_recording(
        &mut self,
        user_text: &str,
        recording: Option<PathBuf>,
    ) -> VoiceResult<Reply> {
        if self.state == SessionState::AwaitingReply {
            return Err(VoiceError::SessionBusy);
        }
        self.state = SessionState::AwaitingReply;

        let mut user_turn = self.new_turn(Role::User, user_text.trim().to_string());
        user_turn.audio = recording;
        info!(turn_id = user_turn.id, "👤 User: {}", user_turn.text);
        self.append(user_turn.clone()).await?;

        let messages = self.request();
        let backend = Arc::clone(&self.backend);
        let outcome = self.lane.call(self.timeout(), &self.cancel, move || {
            backend.complete(&messages)
        })
        .await;

        let (text, degraded) = match outcome {
            Ok(text) => (text, false),
            Err(e) if self.cancel.is_cancelled() => {
                self.state = SessionState::Idle;
                return Err(e);
            }
            Err(e) => {
                warn!(error = %e, "Reasoning backend failed, replying with apology");
                self.degraded_replies += 1;
                (self.config.apology.clone(), true)
            }
        };

        let assistant_turn = self.new_turn(Role::Assistant, text);
        info!(turn_id = assistant_turn.id, "🤖 Assistant: {}", assistant_turn.text);
        self.append(assistant_turn.clone()).await?;
        self.state = SessionState::Idle;

        Ok(Reply {
            user_turn,
            assistant_turn,
            degraded,
        })
    }

    /// Link spoken audio to an assistant turn already in the record.
    pub fn attach_audio(&mut self, turn_id: u64, path: &Path) -> VoiceResult<()> {
        self.log.append_audio(turn_id, path)?;
        if let Some(turn) = self.turns.iter_mut().find(|t| t.id == turn_id) {
            turn.audio = Some(path.to_path_buf());
        }
        debug!(turn_id, path = %path.display(), "🔗 Audio linked to turn");
        Ok(())
    }

    /// Render the full session record as plain text next to it.
    pub fn export_text(&self) -> VoiceResult<PathBuf> {
        let turns = SessionLog::read(self.log.path())?;
        let path = self.log.path().with_extension("txt");
        let mut out = String::new();
        for turn in &turns {
            out.push_str(&format!(
                "[{}] {}: {}\n",
                turn.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                turn.role.label(),
                turn.text
            ));
            if let Some(audio) = &turn.audio {
                out.push_str(&format!("    audio: {}\n", audio.display()));
            }
        }
        fs::write(&path, out).map_err(|e| VoiceError::Persistence(format!("{}: {}", path.display(), e)))?;
        info!("📄 Conversation exported to {}", path.display());
        Ok(path)
    }

    /// Flush the record and optionally export the transcript.
    pub fn close(self) -> ConversationSummary {
        let transcript = if self.config.export_text && self.turns_recorded > 0 {
            match self.export_text() {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(error = %e, "Transcript export failed");
                    None
                }
            }
        } else {
            None
        };
        if let Err(e) = self.log.file.sync_all() {
            warn!(error = %e, "Could not sync conversation record");
        }
        ConversationSummary {
            turns_recorded: self.turns_recorded,
            summaries: self.summaries,
            degraded_replies: self.degraded_replies,
            record: Some(self.log.path().to_path_buf()),
            transcript,
        }
    }

    /// Conversation worker: answer each request in order until the request
    /// channel closes or `cancel` fires, then close the session.
    pub async fn serve(
        mut self,
        mut requests: mpsc::Receiver<ConversationRequest>,
        events: mpsc::Sender<SessionEvent>,
    ) -> ConversationSummary {
        let cancel = self.cancel.clone();
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                next = requests.recv() => match next {
                    Some(request) => request,
                    None => break,
                },
            };
            let (text, recording) = match request {
                ConversationRequest::Respond { text, recording } => (text, recording),
                ConversationRequest::AttachAudio { turn_id, path } => {
                    if let Err(e) = self.attach_audio(turn_id, &path) {
                        warn!(turn_id, error = %e, "Could not link audio to turn");
                    }
                    continue;
                }
            };
            let result = self.respond_with_recording(&text, recording).await;
            if let Err(ref e) = result {
                if e.is_fatal() {
                    error!(error = %e, "❌ Conversation record failed");
                }
            }
            let stop = matches!(result, Err(ref e) if e.is_fatal()) || cancel.is_cancelled();
            if events.send(SessionEvent::Replied(result)).await.is_err() || stop {
                break;
            }
        }
        // Links already queued are still written; unanswered transcripts are not.
        while let Ok(request) = requests.try_recv() {
            if let ConversationRequest::AttachAudio { turn_id, path } = request {
                if let Err(e) = self.attach_audio(turn_id, &path) {
                    warn!(turn_id, error = %e, "Could not link audio to turn");
                }
            }
        }
        self.close()
    }
}
