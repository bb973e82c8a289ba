//! In-process doubles for every collaborator of the conversation.

#![allow(dead_code)]

use async_trait::async_trait;
use live_tutor::audio_codec::{encode_frame, AudioBuffer};
use live_tutor::capture::{CaptureError, CaptureSource};
use live_tutor::config::LiveConfig;
use live_tutor::persona::LearnerProfile;
use live_tutor::playback::{AudioOutput, ChunkId, PlaybackError};
use live_tutor::protocol::InboundEvent;
use live_tutor::session::{
    LiveSession, LiveTransport, SessionError, SessionEvent, SessionEventKind, SessionId,
    SessionSetup,
};
use live_tutor::tools::{create_default_registry, ImageGenerator, ToolError, ToolExecutor};
use live_tutor::transcript::{HistoryStore, MemoryHistoryStore};
use live_tutor::{Conversation, ConversationDeps, ConversationEvent, ConversationHandle};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};

/// Everything the doubles observed.
#[derive(Default, Clone)]
pub struct Probe {
    pub capture_starts: Arc<AtomicUsize>,
    pub capture_stops: Arc<AtomicUsize>,
    pub session_closes: Arc<AtomicUsize>,
    pub connects: Arc<AtomicUsize>,
    pub setups: Arc<Mutex<Vec<SessionSetup>>>,
    pub audio_frames: Arc<Mutex<Vec<usize>>>,
    pub tool_results: Arc<Mutex<Vec<(String, String, Value)>>>,
    pub frames_tx: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>>,
    pub server: Arc<Mutex<Option<(SessionId, mpsc::UnboundedSender<SessionEvent>)>>>,
    pub scheduled: Arc<Mutex<Vec<(ChunkId, f64, mpsc::UnboundedSender<ChunkId>)>>>,
    pub stopped_chunks: Arc<Mutex<Vec<ChunkId>>>,
}

impl Probe {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn tool_results(&self) -> Vec<(String, String, Value)> {
        self.tool_results.lock().unwrap().clone()
    }

    pub fn scheduled_ids(&self) -> Vec<ChunkId> {
        self.scheduled.lock().unwrap().iter().map(|(id, _, _)| *id).collect()
    }
}

pub struct FakeCapture {
    probe: Probe,
    active: bool,
    fail_with: Option<CaptureError>,
}

impl CaptureSource for FakeCapture {
    fn start(&mut self, frames: mpsc::UnboundedSender<Vec<f32>>) -> Result<(), CaptureError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        self.probe.capture_starts.fetch_add(1, Ordering::SeqCst);
        *self.probe.frames_tx.lock().unwrap() = Some(frames);
        self.active = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.probe.capture_stops.fetch_add(1, Ordering::SeqCst);
        self.probe.frames_tx.lock().unwrap().take();
        self.active = false;
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

pub struct FakeTransport {
    probe: Probe,
    fail: bool,
    /// When set, connect waits for a permit before answering
    gate: Option<Arc<Notify>>,
}

#[async_trait]
impl LiveTransport for FakeTransport {
    async fn connect(
        &self,
        session_id: SessionId,
        setup: SessionSetup,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Box<dyn LiveSession>, SessionError> {
        self.probe.connects.fetch_add(1, Ordering::SeqCst);
        self.probe.setups.lock().unwrap().push(setup);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail {
            return Err(SessionError::Connect("connection refused".to_string()));
        }
        *self.probe.server.lock().unwrap() = Some((session_id, events));
        Ok(Box::new(FakeSession {
            probe: self.probe.clone(),
            open: true,
        }))
    }
}

struct FakeSession {
    probe: Probe,
    open: bool,
}

impl LiveSession for FakeSession {
    fn send_audio_frame(&mut self, samples: &[f32]) -> Result<(), SessionError> {
        if !self.open {
            return Err(SessionError::Closed);
        }
        self.probe.audio_frames.lock().unwrap().push(samples.len());
        Ok(())
    }

    fn send_tool_result(&mut self, call_id: &str, name: &str, response: Value) -> Result<(), SessionError> {
        if !self.open {
            return Err(SessionError::Closed);
        }
        self.probe
            .tool_results
            .lock()
            .unwrap()
            .push((call_id.to_string(), name.to_string(), response));
        Ok(())
    }

    fn close(&mut self) {
        self.probe.session_closes.fetch_add(1, Ordering::SeqCst);
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Output whose clock stays at zero; chunk ends are fired by the test.
pub struct FakeOutput {
    probe: Probe,
}

impl AudioOutput for FakeOutput {
    fn now(&self) -> f64 {
        0.0
    }

    fn schedule(
        &mut self,
        id: ChunkId,
        _buffer: AudioBuffer,
        start_at: f64,
        ended: mpsc::UnboundedSender<ChunkId>,
    ) -> Result<(), PlaybackError> {
        self.probe.scheduled.lock().unwrap().push((id, start_at, ended));
        Ok(())
    }

    fn stop(&mut self, id: ChunkId) {
        self.probe.stopped_chunks.lock().unwrap().push(id);
    }
}

pub enum Images {
    Succeed(String),
    Fail(String),
    Hang,
}

#[async_trait]
impl ImageGenerator for Images {
    async fn generate(&self, _prompt: &str) -> Result<String, ToolError> {
        match self {
            Images::Succeed(url) => Ok(url.clone()),
            Images::Fail(reason) => Err(ToolError::ExecutionFailed(reason.clone())),
            Images::Hang => std::future::pending().await,
        }
    }
}

pub struct HarnessOptions {
    pub fail_connect: bool,
    pub capture_error: Option<CaptureError>,
    pub images: Images,
    pub tool_timeout: Duration,
    pub history: Arc<dyn HistoryStore>,
    pub hold_connect: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            fail_connect: false,
            capture_error: None,
            images: Images::Succeed("data:image/png;base64,AAAA".to_string()),
            tool_timeout: Duration::from_secs(5),
            history: Arc::new(MemoryHistoryStore::new()),
            hold_connect: false,
        }
    }
}

pub struct Harness {
    pub conversation: Conversation,
    pub handle: ConversationHandle,
    pub events: broadcast::Receiver<ConversationEvent>,
    pub probe: Probe,
    pub connect_gate: Arc<Notify>,
}

impl Harness {
    pub fn new(options: HarnessOptions) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let probe = Probe::default();
        let connect_gate = Arc::new(Notify::new());
        let config = LiveConfig {
            tool_timeout: options.tool_timeout,
            ..LiveConfig::default()
        };
        let tools = ToolExecutor::new(
            create_default_registry(),
            Arc::new(options.images),
            options.tool_timeout,
        );

        let (conversation, handle) = Conversation::new(
            config,
            LearnerProfile {
                name: "Maya".to_string(),
                age: Some(7),
                interests: vec!["foxes".to_string()],
            },
            ConversationDeps {
                transport: Arc::new(FakeTransport {
                    probe: probe.clone(),
                    fail: options.fail_connect,
                    gate: options.hold_connect.then(|| Arc::clone(&connect_gate)),
                }),
                capture: Box::new(FakeCapture {
                    probe: probe.clone(),
                    active: false,
                    fail_with: options.capture_error,
                }),
                output: Box::new(FakeOutput {
                    probe: probe.clone(),
                }),
                tools: Arc::new(tools),
                history: options.history,
            },
        );
        let events = handle.subscribe();

        Self {
            conversation,
            handle,
            events,
            probe,
            connect_gate,
        }
    }

    /// Handle exactly one queued event.
    pub async fn step(&mut self) {
        let running = tokio::time::timeout(Duration::from_secs(2), self.conversation.process_next())
            .await
            .expect("conversation did not receive an event in time");
        assert!(running, "conversation loop ended unexpectedly");
    }

    /// Start and, when a connect was launched, process its outcome too.
    pub async fn start(&mut self) {
        let was_live = self.conversation.is_live();
        self.handle.start();
        self.step().await;
        if !was_live && self.conversation.is_connecting() {
            self.step().await;
        }
    }

    /// Let a held connect answer.
    pub fn release_connect(&self) {
        self.connect_gate.notify_one();
    }

    pub async fn stop(&mut self) {
        self.handle.stop();
        self.step().await;
    }

    pub fn current_session(&self) -> SessionId {
        self.probe
            .server
            .lock()
            .unwrap()
            .as_ref()
            .map(|(id, _)| *id)
            .expect("no session connected")
    }

    /// Deliver a raw session event without processing it.
    pub fn push_session_event(&self, session_id: SessionId, kind: SessionEventKind) {
        let server = self.probe.server.lock().unwrap();
        let (_, tx) = server.as_ref().expect("no session connected");
        tx.send(SessionEvent { session_id, kind }).unwrap();
    }

    /// Deliver a server message on the current session and process it.
    pub async fn server(&mut self, event: InboundEvent) {
        let id = self.current_session();
        self.push_session_event(id, SessionEventKind::Message(event));
        self.step().await;
    }

    /// Send `secs` of model speech.
    pub async fn model_audio(&mut self, secs: f64) {
        let samples = vec![0.25_f32; (secs * 24000.0) as usize];
        self.server(InboundEvent::Audio {
            data: encode_frame(&samples),
            mime_type: Some("audio/pcm;rate=24000".to_string()),
        })
        .await;
    }

    /// Report the end of the `index`-th scheduled chunk and process it.
    pub async fn finish_chunk(&mut self, index: usize) {
        {
            let scheduled = self.probe.scheduled.lock().unwrap();
            let (id, _, ended) = &scheduled[index];
            ended.send(*id).unwrap();
        }
        self.step().await;
    }

    /// Push one microphone frame and process it.
    pub async fn mic_frame(&mut self, samples: usize) {
        {
            let frames = self.probe.frames_tx.lock().unwrap();
            frames
                .as_ref()
                .expect("capture not started")
                .send(vec![0.0; samples])
                .unwrap();
        }
        self.step().await;
    }

    /// Everything published since the last drain.
    pub fn drain_events(&mut self) -> Vec<ConversationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
