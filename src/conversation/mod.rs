//! The conversation state machine.
//!
//! One [`Conversation`] owns the capture source, the live session, the
//! playback scheduler and the transcript. Every asynchronous source (user
//! commands, connect results, server messages, playback ends, microphone
//! frames and tool completions) is funnelled into a single loop, so handlers
//! run to completion one at a time and never race on shared state. Slow work
//! (dialing the session, running tools) happens in spawned tasks that report
//! back into the loop.

mod events;

pub use events::{Command, ConversationEvent, ConversationHandle, ConversationPhase};

use crate::audio_codec::decode_wire_audio;
use crate::capture::CaptureSource;
use crate::config::LiveConfig;
use crate::error::LiveError;
use crate::persona::{LearnerProfile, SystemPrompts};
use crate::playback::{AudioOutput, ChunkId, PlaybackScheduler};
use crate::protocol::{pcm_rate, FunctionCall, InboundEvent};
use crate::session::{
    LiveSession, LiveTransport, SessionError, SessionEvent, SessionEventKind, SessionId,
    SessionSetup,
};
use crate::tools::{ToolError, ToolExecutor, ToolOutput};
use crate::transcript::{
    EntryId, HistoryStore, SessionHistory, SessionSnapshot, Speaker, TranscriptEntry,
    TranscriptStore,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;

/// Collaborators injected by the composition root.
pub struct ConversationDeps {
    pub transport: Arc<dyn LiveTransport>,
    pub capture: Box<dyn CaptureSource>,
    pub output: Box<dyn AudioOutput>,
    pub tools: Arc<ToolExecutor>,
    pub history: Arc<dyn HistoryStore>,
}

struct PendingTool {
    cancel: CancellationToken,
    cancelled: bool,
}

struct Connected {
    session_id: SessionId,
    result: Result<Box<dyn LiveSession>, SessionError>,
}

struct ToolCompletion {
    session_id: SessionId,
    call_id: String,
    name: String,
    result: Result<ToolOutput, ToolError>,
}

enum Input {
    Command(Command),
    Connected(Connected),
    Session(SessionEvent),
    PlaybackEnded(ChunkId),
    CaptureFrame(Vec<f32>),
    ToolFinished(ToolCompletion),
}

pub struct Conversation {
    config: LiveConfig,
    profile: LearnerProfile,

    transport: Arc<dyn LiveTransport>,
    capture: Box<dyn CaptureSource>,
    playback: PlaybackScheduler,
    tools: Arc<ToolExecutor>,
    history_store: Arc<dyn HistoryStore>,

    transcript: TranscriptStore,
    history: SessionHistory,
    history_loaded: bool,

    phase: ConversationPhase,
    session: Option<Box<dyn LiveSession>>,
    /// Attempt whose events are accepted; None while idle
    live_id: Option<SessionId>,
    last_session_id: SessionId,
    stopping: bool,
    turn_complete_pending: bool,
    session_start_len: usize,
    pending_tools: HashMap<String, PendingTool>,

    commands_rx: mpsc::UnboundedReceiver<Command>,
    connected_tx: mpsc::UnboundedSender<Connected>,
    connected_rx: mpsc::UnboundedReceiver<Connected>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    ended_rx: mpsc::UnboundedReceiver<ChunkId>,
    frames_rx: Option<mpsc::UnboundedReceiver<Vec<f32>>>,
    tool_tx: mpsc::UnboundedSender<ToolCompletion>,
    tool_rx: mpsc::UnboundedReceiver<ToolCompletion>,
    events_tx: broadcast::Sender<ConversationEvent>,
}

impl Conversation {
    pub fn new(
        config: LiveConfig,
        profile: LearnerProfile,
        deps: ConversationDeps,
    ) -> (Self, ConversationHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (tool_tx, tool_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (playback, ended_rx) = PlaybackScheduler::new(deps.output);

        let handle = ConversationHandle::new(commands_tx, events_tx.clone());

        let conversation = Self {
            transcript: TranscriptStore::new(config.transcript_modes),
            history: SessionHistory::new(config.history_capacity),
            history_loaded: false,
            config,
            profile,
            transport: deps.transport,
            capture: deps.capture,
            playback,
            tools: deps.tools,
            history_store: deps.history,
            phase: ConversationPhase::Idle,
            session: None,
            live_id: None,
            last_session_id: 0,
            stopping: false,
            turn_complete_pending: false,
            session_start_len: 0,
            pending_tools: HashMap::new(),
            commands_rx,
            connected_tx,
            connected_rx,
            session_tx,
            session_rx,
            ended_rx,
            frames_rx: None,
            tool_tx,
            tool_rx,
            events_tx,
        };

        (conversation, handle)
    }

    pub fn phase(&self) -> ConversationPhase {
        self.phase
    }

    pub fn transcript(&self) -> &TranscriptStore {
        &self.transcript
    }

    pub fn history(&self) -> &SessionHistory {
        &self.history
    }

    pub fn is_live(&self) -> bool {
        self.live_id.is_some()
    }

    /// Live, but the session has not been acknowledged yet.
    pub fn is_connecting(&self) -> bool {
        self.live_id.is_some() && self.session.is_none()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events_tx.subscribe()
    }

    /// Process events until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        log::info!("🧑‍🏫 Conversation loop started");
        while self.process_next().await {}
        log::info!("🧑‍🏫 Conversation loop finished");
    }

    /// Wait for and handle one event. Returns false after shutdown.
    pub async fn process_next(&mut self) -> bool {
        let input = self.next_input().await;
        self.dispatch(input).await
    }

    async fn next_input(&mut self) -> Input {
        tokio::select! {
            command = self.commands_rx.recv() => Input::Command(command.unwrap_or(Command::Shutdown)),
            Some(connected) = self.connected_rx.recv() => Input::Connected(connected),
            Some(event) = self.session_rx.recv() => Input::Session(event),
            Some(id) = self.ended_rx.recv() => Input::PlaybackEnded(id),
            Some(frame) = recv_optional(&mut self.frames_rx) => Input::CaptureFrame(frame),
            Some(done) = self.tool_rx.recv() => Input::ToolFinished(done),
        }
    }

    async fn dispatch(&mut self, input: Input) -> bool {
        match input {
            Input::Command(Command::Start) => self.start().await,
            Input::Command(Command::Stop) => self.stop().await,
            Input::Command(Command::ShowHistory) => self.show_history().await,
            Input::Command(Command::Shutdown) => {
                self.stop().await;
                return false;
            }
            Input::Connected(connected) => self.handle_connected(connected).await,
            Input::Session(event) => self.handle_session_event(event).await,
            Input::PlaybackEnded(id) => self.handle_playback_ended(id),
            Input::CaptureFrame(frame) => self.handle_capture_frame(frame),
            Input::ToolFinished(done) => self.handle_tool_completion(done),
        }
        true
    }

    /// idle → listening. No-op unless idle.
    ///
    /// The session is dialed in the background; microphone frames captured
    /// before it is acknowledged are dropped.
    pub async fn start(&mut self) {
        if self.phase != ConversationPhase::Idle || self.stopping {
            log::debug!("Start ignored in phase {}", self.phase);
            return;
        }

        self.last_session_id += 1;
        let session_id = self.last_session_id;
        self.turn_complete_pending = false;
        self.session_start_len = self.transcript.len();
        self.pending_tools.clear();

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        if let Err(e) = self.capture.start(frames_tx) {
            let err = LiveError::from(e);
            log::error!("❌ Could not start microphone: {}", err);
            self.notice(err.user_message());
            return;
        }
        self.frames_rx = Some(frames_rx);
        self.live_id = Some(session_id);
        self.set_phase(ConversationPhase::Listening);

        let setup = SessionSetup::new(
            &self.config,
            SystemPrompts::live_tutor(&self.profile),
            self.tools.registry().declarations(),
        );

        let transport = Arc::clone(&self.transport);
        let events = self.session_tx.clone();
        let connected_tx = self.connected_tx.clone();
        tokio::spawn(async move {
            let result = transport.connect(session_id, setup, events).await;
            if let Err(mpsc::error::SendError(Connected {
                result: Ok(mut session),
                ..
            })) = connected_tx.send(Connected { session_id, result })
            {
                // Conversation is gone
                session.close();
            }
        });
    }

    async fn handle_connected(&mut self, connected: Connected) {
        let Connected { session_id, result } = connected;

        if self.live_id != Some(session_id) || self.stopping {
            if let Ok(mut session) = result {
                log::debug!("Closing session {} that finished connecting after stop", session_id);
                session.close();
            }
            return;
        }

        match result {
            Ok(session) => {
                log::info!("🎙️ Conversation {} is live", session_id);
                self.session = Some(session);
            }
            Err(e) => {
                let err = LiveError::from(e);
                log::error!("❌ Could not open live session: {}", err);
                self.notice(err.user_message());
                self.stop().await;
            }
        }
    }

    /// any → idle. Tears down at most once per session.
    pub async fn stop(&mut self) {
        if self.stopping || self.phase == ConversationPhase::Idle {
            log::debug!("Stop ignored (stopping: {}, phase: {})", self.stopping, self.phase);
            return;
        }
        self.stopping = true;
        log::info!("🛑 Stopping conversation");

        self.finalize_open_entries();
        let new_entries = self.transcript.snapshot_since(self.session_start_len);

        self.frames_rx = None;
        self.capture.stop();
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.playback.flush();
        for (_, pending) in self.pending_tools.drain() {
            pending.cancel.cancel();
        }
        self.turn_complete_pending = false;
        self.live_id = None;
        self.set_phase(ConversationPhase::Idle);

        self.persist(new_entries).await;
        self.stopping = false;
    }

    async fn persist(&mut self, entries: Vec<TranscriptEntry>) {
        let snapshot = match SessionSnapshot::from_entries(entries, Utc::now()) {
            Some(snapshot) => snapshot,
            None => {
                log::debug!("Session produced no transcript, nothing to save");
                return;
            }
        };

        self.ensure_history_loaded().await;
        if let Some(evicted) = self.history.push(snapshot.clone()) {
            log::debug!("History full, dropped session from {}", evicted.timestamp);
        }

        let snapshots = self.history.to_vec();
        match self.history_store.save(&snapshots).await {
            Ok(()) => {
                log::info!("💾 Saved session with {} entries", snapshot.transcript.len());
                self.emit(ConversationEvent::SessionSaved(snapshot));
            }
            Err(e) => {
                let err = LiveError::from(e);
                log::error!("Failed to save session history: {}", err);
                self.notice(err.user_message());
            }
        }
    }

    async fn ensure_history_loaded(&mut self) {
        if self.history_loaded {
            return;
        }
        match self.history_store.load().await {
            Ok(snapshots) => {
                self.history = SessionHistory::from_snapshots(snapshots, self.config.history_capacity);
            }
            Err(e) => {
                let err = LiveError::from(e);
                log::warn!("Starting with empty history: {}", err);
                self.notice(err.user_message());
            }
        }
        self.history_loaded = true;
    }

    async fn show_history(&mut self) {
        self.ensure_history_loaded().await;
        self.emit(ConversationEvent::History(self.history.to_vec()));
    }

    pub async fn handle_session_event(&mut self, event: SessionEvent) {
        if self.live_id != Some(event.session_id) {
            log::trace!("Ignoring event from old session {}", event.session_id);
            return;
        }

        match event.kind {
            SessionEventKind::Message(inbound) => self.handle_inbound(inbound),
            SessionEventKind::Malformed(reason) => {
                log::warn!("Malformed server message: {}", reason);
                self.notice("I didn't understand the last message from the tutor.".to_string());
            }
            SessionEventKind::Error(reason) => {
                let err = LiveError::ConnectionFailure(reason);
                log::error!("❌ {}", err);
                self.notice(err.user_message());
                self.stop().await;
            }
            SessionEventKind::Closed { reason } => {
                log::info!("Live session closed by server: {:?}", reason);
                let err = LiveError::ConnectionFailure(
                    reason.unwrap_or_else(|| "closed by server".to_string()),
                );
                self.notice(err.user_message());
                self.stop().await;
            }
        }
    }

    fn handle_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::SetupComplete => log::debug!("Duplicate setup acknowledgement"),
            InboundEvent::InputTranscript(text) => self.amend(Speaker::User, &text),
            InboundEvent::OutputTranscript(text) => {
                self.amend(Speaker::Model, &text);
                self.model_responding();
            }
            InboundEvent::Audio { data, mime_type } => {
                self.model_responding();
                self.play_audio(&data, mime_type.as_deref());
            }
            InboundEvent::TurnComplete => self.on_turn_complete(),
            InboundEvent::Interrupted => self.on_interrupted(),
            InboundEvent::ToolCall(calls) => {
                for call in calls {
                    self.start_tool_call(call);
                }
            }
            InboundEvent::ToolCallCancellation(ids) => {
                for id in ids {
                    if let Some(pending) = self.pending_tools.get_mut(&id) {
                        log::info!("Tool call {} cancelled by server", id);
                        pending.cancelled = true;
                        pending.cancel.cancel();
                    }
                }
            }
            InboundEvent::GoAway { time_left } => {
                log::warn!("Server will close the session soon (time left: {:?})", time_left);
            }
        }
    }

    fn model_responding(&mut self) {
        if self.phase == ConversationPhase::Listening {
            self.set_phase(ConversationPhase::Processing);
        }
    }

    fn play_audio(&mut self, data: &str, mime_type: Option<&str>) {
        let rate = mime_type
            .and_then(pcm_rate)
            .unwrap_or(self.config.output_sample_rate);

        let buffer = match decode_wire_audio(data, rate, 1) {
            Ok(buffer) => buffer,
            Err(e) => {
                let err = LiveError::from(e);
                log::warn!("Dropping audio chunk: {}", err);
                self.notice(err.user_message());
                return;
            }
        };
        if buffer.is_empty() {
            return;
        }

        if let Err(e) = self.playback.enqueue_now(buffer) {
            let err = LiveError::from(e);
            log::warn!("Could not schedule audio chunk: {}", err);
            self.notice(err.user_message());
        }
    }

    fn on_turn_complete(&mut self) {
        self.finalize_open_entries();
        if self.playback.has_in_flight() {
            log::debug!(
                "Turn complete, waiting for {} chunks to finish",
                self.playback.in_flight_len()
            );
            self.turn_complete_pending = true;
        } else {
            self.turn_complete_pending = false;
            self.set_phase(ConversationPhase::Listening);
        }
    }

    fn on_interrupted(&mut self) {
        log::info!("✋ Model interrupted");
        self.playback.flush();
        self.turn_complete_pending = false;
        self.finalize_source(Speaker::Model);
        self.set_phase(ConversationPhase::Listening);
    }

    pub fn handle_playback_ended(&mut self, id: ChunkId) {
        let drained = self.playback.on_chunk_ended(id);
        if drained && self.turn_complete_pending && self.is_live() {
            self.turn_complete_pending = false;
            self.set_phase(ConversationPhase::Listening);
        }
    }

    pub fn handle_capture_frame(&mut self, frame: Vec<f32>) {
        let Some(session) = self.session.as_mut() else {
            log::trace!("Dropping capture frame without a session");
            return;
        };
        if let Err(e) = session.send_audio_frame(&frame) {
            log::warn!("Could not send audio frame: {}", e);
        }
    }

    fn start_tool_call(&mut self, call: FunctionCall) {
        let Some(session_id) = self.live_id else {
            return;
        };
        let FunctionCall { id, name, args } = call;
        log::info!("🛠️ Tool call {} ({})", name, id);

        let placeholder = self.tools.placeholder_text(&name, &args);
        self.append_final(Speaker::Model, placeholder, None);

        let cancel = CancellationToken::new();
        self.pending_tools.insert(
            id.clone(),
            PendingTool {
                cancel: cancel.clone(),
                cancelled: false,
            },
        );

        let tools = Arc::clone(&self.tools);
        let tool_tx = self.tool_tx.clone();
        tokio::spawn(async move {
            let result = tools.execute(&name, args, cancel).await;
            let _ = tool_tx.send(ToolCompletion {
                session_id,
                call_id: id,
                name,
                result,
            });
        });
    }

    fn handle_tool_completion(&mut self, done: ToolCompletion) {
        if self.live_id != Some(done.session_id) {
            log::debug!("Ignoring tool result {} from an ended session", done.call_id);
            return;
        }

        let cancelled = self
            .pending_tools
            .remove(&done.call_id)
            .map(|pending| pending.cancelled)
            .unwrap_or(false);

        let response = match done.result {
            Ok(output) => {
                log::info!("✅ Tool {} finished", done.name);
                self.append_final(Speaker::Model, output.transcript_text, output.image_url);
                output.response
            }
            Err(_) if cancelled => {
                self.append_final(Speaker::Model, SystemPrompts::tool_cancelled(), None);
                return;
            }
            Err(e) => {
                let err = LiveError::from(e.clone());
                log::warn!("Tool {} failed: {}", done.name, err);
                self.append_final(Speaker::Model, SystemPrompts::tool_failure(&e.to_string()), None);
                e.to_response()
            }
        };

        if cancelled {
            log::debug!("Not reporting result of cancelled call {}", done.call_id);
            return;
        }

        match self.session.as_mut() {
            Some(session) => {
                if let Err(e) = session.send_tool_result(&done.call_id, &done.name, response) {
                    log::error!("Could not send tool result for {}: {}", done.call_id, e);
                }
            }
            None => log::warn!("No session to report tool result {}", done.call_id),
        }
    }

    fn amend(&mut self, source: Speaker, fragment: &str) {
        if let Some(id) = self.transcript.append_or_amend(source, fragment, false) {
            self.publish_entry(id);
        }
    }

    fn append_final(&mut self, source: Speaker, text: impl Into<String>, image_url: Option<String>) {
        let open = self.transcript.open_entry(source).map(|entry| entry.id);
        let id = self.transcript.append_final(source, text, image_url);
        if let Some(open) = open {
            self.publish_entry(open);
        }
        self.publish_entry(id);
    }

    fn finalize_source(&mut self, source: Speaker) {
        if let Some(id) = self.transcript.open_entry(source).map(|entry| entry.id) {
            self.transcript.finalize_source(source);
            self.publish_entry(id);
        }
    }

    fn finalize_open_entries(&mut self) {
        let open: Vec<EntryId> = [Speaker::User, Speaker::Model]
            .into_iter()
            .filter_map(|source| self.transcript.open_entry(source).map(|entry| entry.id))
            .collect();
        self.transcript.finalize_open_entries();
        for id in open {
            self.publish_entry(id);
        }
    }

    fn publish_entry(&mut self, id: EntryId) {
        if let Some(entry) = self.transcript.get(id) {
            let entry = entry.clone();
            self.emit(ConversationEvent::TranscriptUpdated(entry));
        }
    }

    fn set_phase(&mut self, phase: ConversationPhase) {
        if self.phase == phase {
            return;
        }
        log::debug!("Phase {} → {}", self.phase, phase);
        self.phase = phase;
        self.emit(ConversationEvent::PhaseChanged(phase));
    }

    fn notice(&self, message: String) {
        self.emit(ConversationEvent::Notice(message));
    }

    fn emit(&self, event: ConversationEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }
}

async fn recv_optional<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
