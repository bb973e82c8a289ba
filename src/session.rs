//! Duplex session with the live model.
//!
//! A [`LiveTransport`] opens sessions; each [`LiveSession`] is a handle used
//! for exactly one conversation attempt. Inbound traffic is delivered as
//! [`SessionEvent`]s tagged with the id the session was opened with, so a
//! consumer can discard events from attempts it has already abandoned.

use crate::audio_codec::encode_frame;
use crate::config::{ApiConfig, LiveConfig};
use crate::protocol::{
    ClientMessage, Content, FunctionDeclaration, GenerationConfig, InboundEvent, ProtocolError,
    ServerMessage, Setup, SpeechConfig, ToolDeclarations, TranscriptionConfig,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Could not connect: {0}")]
    Connect(String),

    #[error("No setup acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("Server rejected the session: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session is closed")]
    Closed,
}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        SessionError::Protocol(err.to_string())
    }
}

/// Identifies one conversation attempt.
pub type SessionId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    Message(InboundEvent),
    /// A frame that could not be understood; the session stays up
    Malformed(String),
    /// Transport failure; the session is unusable
    Error(String),
    /// Remote side closed the connection
    Closed { reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub kind: SessionEventKind,
}

/// Everything carried by the initial `setup` frame.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub model: String,
    pub system_instruction: String,
    pub voice_name: String,
    pub tools: Vec<FunctionDeclaration>,
    /// Rate stated on outbound audio frames
    pub input_sample_rate: u32,
}

impl SessionSetup {
    pub fn new(config: &LiveConfig, system_instruction: String, tools: Vec<FunctionDeclaration>) -> Self {
        Self {
            model: config.model.clone(),
            system_instruction,
            voice_name: config.voice_name.clone(),
            tools,
            input_sample_rate: config.input_sample_rate,
        }
    }

    pub fn to_message(&self) -> ClientMessage {
        let tools = if self.tools.is_empty() {
            Vec::new()
        } else {
            vec![ToolDeclarations {
                function_declarations: self.tools.clone(),
            }]
        };

        ClientMessage::Setup(Setup {
            model: self.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(SpeechConfig::prebuilt(&self.voice_name)),
            },
            system_instruction: Content::text(&self.system_instruction),
            tools,
            input_audio_transcription: TranscriptionConfig::default(),
            output_audio_transcription: TranscriptionConfig::default(),
        })
    }
}

/// Opens live sessions.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Resolves once the remote side has acknowledged the setup.
    async fn connect(
        &self,
        session_id: SessionId,
        setup: SessionSetup,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Box<dyn LiveSession>, SessionError>;
}

/// Handle to one open session. Sends never wait for the network.
pub trait LiveSession: Send {
    /// Encode and queue one frame of microphone samples.
    fn send_audio_frame(&mut self, samples: &[f32]) -> Result<(), SessionError>;

    /// Complete a tool call received on this session.
    fn send_tool_result(&mut self, call_id: &str, name: &str, response: Value) -> Result<(), SessionError>;

    /// Best-effort shutdown. Safe to call any number of times.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

enum Outbound {
    Frame(String),
    Close,
}

/// Websocket transport for the Gemini Live API.
pub struct GeminiLiveTransport {
    api: Arc<ApiConfig>,
    endpoint: String,
    connect_timeout: Duration,
}

impl GeminiLiveTransport {
    pub fn new(api: Arc<ApiConfig>, config: &LiveConfig) -> Self {
        Self {
            api,
            endpoint: config.endpoint.clone(),
            connect_timeout: config.connect_timeout,
        }
    }

    fn session_url(&self) -> Result<Url, SessionError> {
        let mut url =
            Url::parse(&self.endpoint).map_err(|e| SessionError::Connect(format!("Bad endpoint: {}", e)))?;
        url.query_pairs_mut().append_pair("key", self.api.gemini_key());
        Ok(url)
    }
}

#[async_trait]
impl LiveTransport for GeminiLiveTransport {
    async fn connect(
        &self,
        session_id: SessionId,
        setup: SessionSetup,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Box<dyn LiveSession>, SessionError> {
        let url = self.session_url()?;
        let setup_json = setup.to_message().to_json()?;
        let input_sample_rate = setup.input_sample_rate;

        log::info!("🔌 Connecting live session {} ({})", session_id, setup.model);

        let handshake = async {
            let (ws_stream, _) = connect_async(url.as_str())
                .await
                .map_err(|e| SessionError::Connect(e.to_string()))?;
            let (mut write, mut read) = ws_stream.split();

            write
                .send(Message::Text(setup_json.into()))
                .await
                .map_err(|e| SessionError::Connect(e.to_string()))?;

            loop {
                let message = match read.next().await {
                    Some(Ok(Message::Text(text))) => ServerMessage::parse(text.as_str())?,
                    Some(Ok(Message::Binary(data))) => ServerMessage::parse_bytes(data.as_slice())?,
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed during setup".to_string());
                        return Err(SessionError::Rejected(reason));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(SessionError::Connect(e.to_string())),
                    None => return Err(SessionError::Closed),
                };

                if message.setup_complete.is_some() {
                    break;
                }
                log::debug!("Session {}: ignoring frame before setup completed", session_id);
            }

            Ok::<_, SessionError>((write, read))
        };

        let (mut write, mut read) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| SessionError::Timeout(self.connect_timeout))??;

        log::info!("✅ Live session {} ready", session_id);

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let cancel = CancellationToken::new();

        let writer_events = events.clone();
        tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                match outbound {
                    Outbound::Frame(json) => {
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            log::error!("Session {}: send failed: {}", session_id, e);
                            let _ = writer_events.send(SessionEvent {
                                session_id,
                                kind: SessionEventKind::Error(e.to_string()),
                            });
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            let _ = write.close().await;
            log::debug!("Session {}: writer finished", session_id);
        });

        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    next = read.next() => next,
                };

                let kinds = match next {
                    Some(Ok(Message::Text(text))) => decode_frame(ServerMessage::parse(text.as_str())),
                    Some(Ok(Message::Binary(data))) => decode_frame(ServerMessage::parse_bytes(data.as_slice())),
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string());
                        log::info!("Session {}: server closed connection: {:?}", session_id, reason);
                        let _ = events.send(SessionEvent {
                            session_id,
                            kind: SessionEventKind::Closed { reason },
                        });
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::error!("Session {}: websocket error: {}", session_id, e);
                        let _ = events.send(SessionEvent {
                            session_id,
                            kind: SessionEventKind::Error(e.to_string()),
                        });
                        break;
                    }
                    None => {
                        let _ = events.send(SessionEvent {
                            session_id,
                            kind: SessionEventKind::Closed { reason: None },
                        });
                        break;
                    }
                };

                for kind in kinds {
                    if events.send(SessionEvent { session_id, kind }).is_err() {
                        return;
                    }
                }
            }
            log::debug!("Session {}: reader finished", session_id);
        });

        Ok(Box::new(GeminiLiveSession {
            session_id,
            outbound: outbound_tx,
            cancel,
            input_sample_rate,
            open: true,
        }))
    }
}

fn decode_frame(parsed: Result<ServerMessage, ProtocolError>) -> Vec<SessionEventKind> {
    match parsed {
        Ok(message) => message
            .into_events()
            .into_iter()
            .map(SessionEventKind::Message)
            .collect(),
        Err(e) => {
            log::warn!("Unparseable server frame: {}", e);
            vec![SessionEventKind::Malformed(e.to_string())]
        }
    }
}

struct GeminiLiveSession {
    session_id: SessionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    input_sample_rate: u32,
    open: bool,
}

impl GeminiLiveSession {
    fn queue(&self, message: ClientMessage) -> Result<(), SessionError> {
        if !self.open {
            return Err(SessionError::Closed);
        }
        let json = message.to_json()?;
        self.outbound
            .send(Outbound::Frame(json))
            .map_err(|_| SessionError::Closed)
    }
}

impl LiveSession for GeminiLiveSession {
    fn send_audio_frame(&mut self, samples: &[f32]) -> Result<(), SessionError> {
        log::trace!("Session {}: audio frame of {} samples", self.session_id, samples.len());
        self.queue(ClientMessage::audio_frame(
            encode_frame(samples),
            self.input_sample_rate,
        ))
    }

    fn send_tool_result(&mut self, call_id: &str, name: &str, response: Value) -> Result<(), SessionError> {
        log::debug!("Session {}: tool result for {} ({})", self.session_id, name, call_id);
        self.queue(ClientMessage::tool_result(
            call_id.to_string(),
            name.to_string(),
            response,
        ))
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let _ = self.outbound.send(Outbound::Close);
        self.cancel.cancel();
        log::info!("🔌 Live session {} closed", self.session_id);
    }

    fn is_open(&self) -> bool {
        self.open && !self.outbound.is_closed()
    }
}

impl Drop for GeminiLiveSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup(tools: Vec<FunctionDeclaration>) -> SessionSetup {
        SessionSetup::new(&LiveConfig::default(), "Be a kind tutor".to_string(), tools)
    }

    #[test]
    fn test_setup_message_carries_persona_and_tools() {
        let declaration = FunctionDeclaration {
            name: "generate_image".to_string(),
            description: "Draw a picture".to_string(),
            parameters: json!({"type": "object"}),
        };
        let json = setup(vec![declaration]).to_message().to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(
            value["setup"]["systemInstruction"]["parts"][0]["text"],
            "Be a kind tutor"
        );
        assert_eq!(
            value["setup"]["tools"][0]["functionDeclarations"][0]["name"],
            "generate_image"
        );
        assert_eq!(
            value["setup"]["model"],
            LiveConfig::default().model.as_str()
        );
    }

    #[test]
    fn test_setup_without_tools_omits_field() {
        let json = setup(vec![]).to_message().to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert!(value["setup"].get("tools").is_none());
    }

    #[test]
    fn test_session_url_carries_key() {
        let api = Arc::new(ApiConfig::from_key("AIzaTestKey").unwrap());
        let transport = GeminiLiveTransport::new(api, &LiveConfig::default());
        let url = transport.session_url().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert!(url.query_pairs().any(|(k, v)| k == "key" && v == "AIzaTestKey"));
    }

    #[test]
    fn test_decode_frame_reports_malformed() {
        let kinds = decode_frame(ServerMessage::parse("{not json"));
        assert!(matches!(kinds.as_slice(), [SessionEventKind::Malformed(_)]));

        let kinds = decode_frame(ServerMessage::parse(r#"{"serverContent": {"turnComplete": true}}"#));
        assert_eq!(kinds, vec![SessionEventKind::Message(InboundEvent::TurnComplete)]);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_sends() {
        let (outbound, _rx) = mpsc::unbounded_channel();
        let mut session = GeminiLiveSession {
            session_id: 7,
            outbound,
            cancel: CancellationToken::new(),
            input_sample_rate: 16000,
            open: true,
        };

        assert!(session.send_audio_frame(&[0.0; 4]).is_ok());
        session.close();
        session.close();
        assert!(!session.is_open());
        assert_eq!(session.send_audio_frame(&[0.0; 4]), Err(SessionError::Closed));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_to_connect() {
        let api = Arc::new(ApiConfig::from_key("AIzaTestKey").unwrap());
        let config = LiveConfig {
            endpoint: "ws://127.0.0.1:9/live".to_string(),
            connect_timeout: Duration::from_secs(2),
            ..LiveConfig::default()
        };
        let transport = GeminiLiveTransport::new(api, &config);
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = transport.connect(1, setup(vec![]), tx).await;
        assert!(matches!(
            result,
            Err(SessionError::Connect(_)) | Err(SessionError::Timeout(_))
        ));
    }
}
