//! Per-conversation generation state.
//!
//! [`GenerationState`] records which conversations are waiting on a
//! streamed response. It is a plain value mutated only through its named
//! transitions; [`GenerationState::reduce`] applies a [`GenerationAction`]
//! for callers that prefer message-style updates.

use std::collections::HashMap;

use chatlink_proto::message::ConversationId;

/// A transition of [`GenerationState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationAction {
    /// A request for the conversation was sent.
    Begin(ConversationId),
    /// The conversation's response finished or was aborted.
    End(ConversationId),
    /// The channel dropped; nothing is generating any more.
    Disconnect,
}

/// Map of conversation id to "generation in progress". Absent means false.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationState {
    entries: HashMap<ConversationId, bool>,
}

impl GenerationState {
    /// Empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` as generating. Creates the entry if needed.
    pub fn begin(&mut self, id: ConversationId) {
        self.entries.insert(id, true);
    }

    /// Mark `id` as finished. An id that never began stays absent.
    pub fn end(&mut self, id: &ConversationId) {
        if let Some(flag) = self.entries.get_mut(id) {
            *flag = false;
        }
    }

    /// Clear every flag. Creates no entries.
    pub fn disconnect(&mut self) {
        for flag in self.entries.values_mut() {
            *flag = false;
        }
    }

    /// Whether `id` is generating.
    #[must_use]
    pub fn is_generating(&self, id: &ConversationId) -> bool {
        self.entries.get(id).copied().unwrap_or(false)
    }

    /// Whether any conversation is generating.
    #[must_use]
    pub fn any_generating(&self) -> bool {
        self.entries.values().any(|g| *g)
    }

    /// Copy of every entry.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<ConversationId, bool> {
        self.entries.clone()
    }

    /// Apply one action.
    pub fn reduce(&mut self, action: GenerationAction) {
        match action {
            GenerationAction::Begin(id) => self.begin(id),
            GenerationAction::End(id) => self.end(&id),
            GenerationAction::Disconnect => self.disconnect(),
        }
    }
}

/// The conversation the user is looking at.
#[derive(Debug, Clone, Default)]
pub struct ActiveConversation {
    current: ConversationId,
}

impl ActiveConversation {
    /// Start on a fresh conversation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start on an existing conversation.
    #[must_use]
    pub const fn with_id(id: ConversationId) -> Self {
        Self { current: id }
    }

    /// Switch to `id`.
    pub fn select(&mut self, id: ConversationId) {
        self.current = id;
    }

    /// Switch to a fresh random id and return it.
    pub fn reset(&mut self) -> ConversationId {
        self.current = ConversationId::new();
        self.current.clone()
    }

    /// Current conversation.
    #[must_use]
    pub const fn current(&self) -> &ConversationId {
        &self.current
    }
}
