//! Turn-structured transcript of the live conversation.
//!
//! Each speaker has at most one open (non-final) entry. Streaming fragments
//! amend that entry in place until a turn completes or the model is
//! interrupted, at which point it is frozen.

pub mod history;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

pub use history::{
    FileHistoryStore, HistoryError, HistoryStore, MemoryHistoryStore, SessionHistory,
    SessionSnapshot,
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Speaker {
    User,
    Model,
}

/// How a streamed fragment combines with the open entry's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FragmentMode {
    /// Fragments are deltas
    #[default]
    Append,
    /// Fragments are the full text so far
    Replace,
}

/// Fragment contract per transcription direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TranscriptModes {
    /// Learner speech-to-text
    pub input: FragmentMode,
    /// Model speech source text
    pub output: FragmentMode,
}

impl TranscriptModes {
    pub fn for_speaker(&self, speaker: Speaker) -> FragmentMode {
        match speaker {
            Speaker::User => self.input,
            Speaker::Model => self.output,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub id: EntryId,
    pub source: Speaker,
    pub text: String,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl TranscriptEntry {
    /// Entries worth keeping in history
    pub fn has_content(&self) -> bool {
        !self.text.trim().is_empty() || self.image_url.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TranscriptStore {
    entries: Vec<TranscriptEntry>,
    next_id: u64,
    modes: TranscriptModes,
}

impl TranscriptStore {
    pub fn new(modes: TranscriptModes) -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
            modes,
        }
    }

    fn open_index(&self, source: Speaker) -> Option<usize> {
        self.entries
            .iter()
            .rposition(|entry| entry.source == source && !entry.is_final)
    }

    fn push(&mut self, source: Speaker, text: String, is_final: bool, image_url: Option<String>) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.entries.push(TranscriptEntry {
            id,
            source,
            text,
            is_final,
            image_url,
        });
        id
    }

    /// Amend the speaker's open entry, or open a new one.
    ///
    /// An empty fragment never opens an entry on its own; it can still close
    /// the open one when `is_final` is set.
    pub fn append_or_amend(&mut self, source: Speaker, fragment: &str, is_final: bool) -> Option<EntryId> {
        if let Some(index) = self.open_index(source) {
            let entry = &mut self.entries[index];
            match self.modes.for_speaker(source) {
                FragmentMode::Append => entry.text.push_str(fragment),
                FragmentMode::Replace => {
                    entry.text.clear();
                    entry.text.push_str(fragment);
                }
            }
            entry.is_final = is_final;
            return Some(entry.id);
        }

        if fragment.is_empty() {
            return None;
        }

        Some(self.push(source, fragment.to_string(), is_final, None))
    }

    /// Close the speaker's open entry and append a finished one after it.
    pub fn append_final(&mut self, source: Speaker, text: impl Into<String>, image_url: Option<String>) -> EntryId {
        self.finalize_source(source);
        self.push(source, text.into(), true, image_url)
    }

    /// Freeze every open entry without touching its text.
    pub fn finalize_open_entries(&mut self) {
        for entry in self.entries.iter_mut().filter(|e| !e.is_final) {
            entry.is_final = true;
        }
    }

    /// Freeze the speaker's open entry, if any.
    pub fn finalize_source(&mut self, source: Speaker) {
        if let Some(index) = self.open_index(source) {
            self.entries[index].is_final = true;
        }
    }

    /// Entries from `index` to the end.
    pub fn snapshot_since(&self, index: usize) -> Vec<TranscriptEntry> {
        self.entries[index.min(self.entries.len())..].to_vec()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn get(&self, id: EntryId) -> Option<&TranscriptEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn open_entry(&self, source: Speaker) -> Option<&TranscriptEntry> {
        self.open_index(source).map(|index| &self.entries[index])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
