pub mod audio_codec;
pub mod capture;
pub mod config;
pub mod conversation;
pub mod devices;
pub mod error;
pub mod persona;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod transcript;

pub use conversation::{
    Command, Conversation, ConversationDeps, ConversationEvent, ConversationHandle,
    ConversationPhase,
};
pub use error::{LiveError, Result};
