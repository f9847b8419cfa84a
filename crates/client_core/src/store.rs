use std::collections::HashMap;

use chrono::{DateTime, Utc};

use shared::domain::{ConversationId, MessageId, MessageKind, UserId};

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub id: UserId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastMessage {
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: ConversationId,
    pub name: String,
    pub participants: Vec<UserId>,
    pub messages: Vec<Message>,
    pub last_message: Option<LastMessage>,
    pub unread_count: u32,
    /// False until the first successful history fetch; a conversation that
    /// never loads history still receives live messages.
    pub history_loaded: bool,
}

/// Conversation metadata as reported by the list endpoints, without any
/// message bodies.
#[derive(Debug, Clone)]
pub struct ConversationSeed {
    pub id: ConversationId,
    pub name: String,
    pub participants: Vec<UserId>,
    pub last_message: Option<LastMessage>,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The message id is already present; the frame was discarded.
    Duplicate,
    /// Direct message from a user absent from the contact list, or group
    /// message for an unknown group. Nothing was stored.
    UnknownSender,
}

/// In-memory conversation state. Single-writer: callers serialize access
/// through a lock; the store itself does no synchronization.
#[derive(Default)]
pub struct ConversationStore {
    contacts: HashMap<UserId, Contact>,
    conversations: Vec<Conversation>,
    active: Option<ConversationId>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_contacts(&mut self, contacts: Vec<Contact>) {
        self.contacts = contacts
            .into_iter()
            .map(|contact| (contact.id.clone(), contact))
            .collect();
    }

    pub fn contact(&self, user_id: &UserId) -> Option<&Contact> {
        self.contacts.get(user_id)
    }

    /// Merges list-endpoint snapshots into the store. Existing message
    /// bodies and `history_loaded` flags survive the merge; only metadata
    /// is refreshed. The list is re-sorted newest-first, with conversations
    /// that have no last message at the end.
    pub fn upsert_from_snapshot(&mut self, seeds: Vec<ConversationSeed>) {
        for seed in seeds {
            match self.position(&seed.id) {
                Some(index) => {
                    let conversation = &mut self.conversations[index];
                    conversation.name = seed.name;
                    conversation.participants = seed.participants;
                    conversation.last_message = seed.last_message;
                    if self.active.as_ref() != Some(&conversation.id) {
                        conversation.unread_count = seed.unread_count;
                    }
                }
                None => self.conversations.push(Conversation {
                    id: seed.id,
                    name: seed.name,
                    participants: seed.participants,
                    messages: Vec::new(),
                    last_message: seed.last_message,
                    unread_count: seed.unread_count,
                    history_loaded: false,
                }),
            }
        }
        self.conversations.sort_by(|a, b| {
            let a_key = a.last_message.as_ref().and_then(|last| last.timestamp);
            let b_key = b.last_message.as_ref().and_then(|last| last.timestamp);
            b_key.cmp(&a_key)
        });
    }

    /// Appends a live message, creating the direct conversation on first
    /// contact. Idempotent on message id, so a frame delivered on both the
    /// user queue and a room topic lands once.
    pub fn append_message(
        &mut self,
        conversation_id: &ConversationId,
        message: Message,
    ) -> AppendOutcome {
        let index = match self.position(conversation_id) {
            Some(index) => index,
            None => match conversation_id {
                ConversationId::Direct(user_id) => {
                    let Some(contact) = self.contacts.get(user_id) else {
                        return AppendOutcome::UnknownSender;
                    };
                    self.conversations.push(Conversation {
                        id: conversation_id.clone(),
                        name: contact.name.clone(),
                        participants: vec![user_id.clone()],
                        messages: Vec::new(),
                        last_message: None,
                        unread_count: 0,
                        history_loaded: false,
                    });
                    self.conversations.len() - 1
                }
                ConversationId::Group(_) => return AppendOutcome::UnknownSender,
            },
        };

        let conversation = &mut self.conversations[index];
        if conversation.messages.iter().any(|m| m.id == message.id) {
            return AppendOutcome::Duplicate;
        }
        conversation.last_message = Some(LastMessage {
            content: message.content.clone(),
            timestamp: Some(message.timestamp),
        });
        conversation.messages.push(message);
        if self.active.as_ref() != Some(conversation_id) {
            conversation.unread_count += 1;
        }
        self.move_to_front(index);
        AppendOutcome::Appended
    }

    /// Installs fetched history, replacing whatever was accumulated while
    /// the fetch was in flight. Live messages that arrived meanwhile are
    /// kept if the fetched page does not already contain them.
    pub fn replace_history(&mut self, conversation_id: &ConversationId, mut history: Vec<Message>) {
        let Some(index) = self.position(conversation_id) else {
            return;
        };
        let conversation = &mut self.conversations[index];
        history.sort_by_key(|message| message.timestamp);
        for live in conversation.messages.drain(..).collect::<Vec<_>>() {
            if !history.iter().any(|m| m.id == live.id) {
                history.push(live);
            }
        }
        if let Some(last) = history.last() {
            conversation.last_message = Some(LastMessage {
                content: last.content.clone(),
                timestamp: Some(last.timestamp),
            });
        }
        conversation.messages = history;
        conversation.history_loaded = true;
    }

    pub fn insert_conversation(&mut self, seed: ConversationSeed) {
        if self.position(&seed.id).is_some() {
            return;
        }
        self.conversations.insert(
            0,
            Conversation {
                id: seed.id,
                name: seed.name,
                participants: seed.participants,
                messages: Vec::new(),
                last_message: seed.last_message,
                unread_count: seed.unread_count,
                history_loaded: false,
            },
        );
    }

    /// Marks a conversation active: unread resets and it moves to the top.
    pub fn set_active(&mut self, conversation_id: Option<ConversationId>) {
        self.active = conversation_id;
        if let Some(id) = self.active.clone() {
            if let Some(index) = self.position(&id) {
                self.conversations[index].unread_count = 0;
                self.move_to_front(index);
            }
        }
    }

    pub fn mark_read(&mut self, conversation_id: &ConversationId) {
        if let Some(index) = self.position(conversation_id) {
            self.conversations[index].unread_count = 0;
        }
    }

    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<&Conversation> {
        self.position(conversation_id)
            .map(|index| &self.conversations[index])
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations.iter().map(|c| c.unread_count).sum()
    }

    pub fn clear(&mut self) {
        self.contacts.clear();
        self.conversations.clear();
        self.active = None;
    }

    fn position(&self, conversation_id: &ConversationId) -> Option<usize> {
        self.conversations.iter().position(|c| &c.id == conversation_id)
    }

    fn move_to_front(&mut self, index: usize) {
        if index > 0 {
            let conversation = self.conversations.remove(index);
            self.conversations.insert(0, conversation);
        }
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
