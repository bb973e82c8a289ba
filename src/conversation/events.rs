use crate::transcript::{SessionSnapshot, TranscriptEntry};
use strum::{AsRefStr, Display};
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ConversationPhase {
    #[default]
    Idle,
    /// Waiting for the learner to speak
    Listening,
    /// The model is answering
    Processing,
}

/// User gestures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    ShowHistory,
    /// Stop and end the event loop
    Shutdown,
}

/// What the UI layer observes.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    PhaseChanged(ConversationPhase),
    /// An entry was added or amended; upsert by id
    TranscriptUpdated(TranscriptEntry),
    /// Banner text for the learner
    Notice(String),
    SessionSaved(SessionSnapshot),
    /// Past sessions, newest first
    History(Vec<SessionSnapshot>),
}

/// Cloneable front door to a running conversation.
#[derive(Clone)]
pub struct ConversationHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ConversationEvent>,
}

impl ConversationHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        events: broadcast::Sender<ConversationEvent>,
    ) -> Self {
        Self { commands, events }
    }

    /// Returns false once the conversation loop has ended.
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn start(&self) -> bool {
        self.send(Command::Start)
    }

    pub fn stop(&self) -> bool {
        self.send(Command::Stop)
    }

    pub fn show_history(&self) -> bool {
        self.send(Command::ShowHistory)
    }

    pub fn shutdown(&self) -> bool {
        self.send(Command::Shutdown)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }
}
