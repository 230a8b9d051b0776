use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// The assistant's lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConversationState {
    #[default]
    Waiting = 0,
    Listening = 1,
    Recording = 2,
    Processing = 3,
    Speaking = 4,
    Ending = 5,
}

impl ConversationState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationState::Waiting => "waiting",
            ConversationState::Listening => "listening",
            ConversationState::Recording => "recording",
            ConversationState::Processing => "processing",
            ConversationState::Speaking => "speaking",
            ConversationState::Ending => "ending",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConversationState::Listening,
            2 => ConversationState::Recording,
            3 => ConversationState::Processing,
            4 => ConversationState::Speaking,
            5 => ConversationState::Ending,
            _ => ConversationState::Waiting,
        }
    }

    /// Microphone audio goes to the server in these states.
    pub fn streams_audio(self) -> bool {
        matches!(self, ConversationState::Listening | ConversationState::Recording)
    }

    /// Whether `self → to` is an edge of the conversation state machine.
    pub fn can_transition(self, to: ConversationState) -> bool {
        use ConversationState::*;
        if to == Speaking {
            // The server may start speech from anywhere; Recording defers
            // until the session allows interrupting it.
            return true;
        }
        matches!(
            (self, to),
            (Waiting, Listening)
                | (Listening, Recording)
                | (Listening, Waiting)
                | (Recording, Processing)
                | (Processing, Ending)
                | (Speaking, Ending)
                | (Ending, Waiting)
        )
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state name pushed by the server over HTTP.
///
/// Servers are inconsistent about casing and naming, so several spellings
/// map onto each state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Waiting,
    Listening,
    Thinking,
    Speaking,
    Ending,
}

impl RemoteState {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "waiting" | "idle" | "ready" => Some(RemoteState::Waiting),
            "listening" | "recording" => Some(RemoteState::Listening),
            "thinking" | "processing" => Some(RemoteState::Thinking),
            "speaking" | "responding" => Some(RemoteState::Speaking),
            "ending" | "complete" | "completed" | "done" => Some(RemoteState::Ending),
            _ => None,
        }
    }
}

/// Lock-free published copy of the current state for other threads.
#[derive(Debug, Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ConversationState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ConversationState {
        ConversationState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ConversationState) {
        self.0.store(state as u8, Ordering::Release);
    }
}
