use std::collections::{HashMap, HashSet};

use shared::domain::{Message, MessageId, UserId};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// A server copy replaced the matching optimistic echo in place.
    Confirmed,
    Duplicate,
}

/// Issued by [`MessageStore::select`]; history fetched for a superseded
/// ticket is discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionTicket {
    contact: UserId,
    generation: u64,
    watermark: u64,
}

impl SelectionTicket {
    pub fn contact(&self) -> &UserId {
        &self.contact
    }
}

struct Entry {
    seq: u64,
    message: Message,
}

#[derive(Default)]
struct Conversation {
    entries: Vec<Entry>,
}

impl Conversation {
    fn contains(&self, message_id: &MessageId) -> bool {
        self.entries
            .iter()
            .any(|entry| &entry.message.id == message_id)
    }

    fn messages(&self) -> Vec<Message> {
        self.entries
            .iter()
            .map(|entry| entry.message.clone())
            .collect()
    }
}

pub struct MessageStore {
    local_user: UserId,
    selected: Option<UserId>,
    generation: u64,
    next_seq: u64,
    conversations: HashMap<UserId, Conversation>,
    unread: HashMap<UserId, u32>,
}

impl MessageStore {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            selected: None,
            generation: 0,
            next_seq: 0,
            conversations: HashMap::new(),
            unread: HashMap::new(),
        }
    }

    /// Inserts unless a message with the same id is already stored.
    pub fn append(&mut self, message: Message) -> bool {
        self.record(message) == AppendOutcome::Inserted
    }

    pub fn record(&mut self, message: Message) -> AppendOutcome {
        let counterpart = message.counterpart(&self.local_user).clone();
        let conversation = self.conversations.entry(counterpart).or_default();
        if conversation.contains(&message.id) {
            return AppendOutcome::Duplicate;
        }

        if message.sender == self.local_user && !message.id.is_provisional() {
            if let Some(entry) = conversation.entries.iter_mut().find(|entry| {
                entry.message.id.is_provisional() && entry.message.same_content(&message)
            }) {
                debug!(
                    provisional_id = %entry.message.id,
                    message_id = %message.id,
                    "messages: optimistic echo confirmed"
                );
                // Counts as a live arrival for any history fetch in flight.
                entry.seq = self.next_seq;
                entry.message = message;
                self.next_seq += 1;
                return AppendOutcome::Confirmed;
            }
        }

        let sender = message.sender.clone();
        conversation.entries.push(Entry {
            seq: self.next_seq,
            message,
        });
        self.next_seq += 1;

        if sender != self.local_user && self.selected.as_ref() != Some(&sender) {
            *self.unread.entry(sender).or_insert(0) += 1;
        }
        AppendOutcome::Inserted
    }

    /// Makes `contact` the active conversation and clears its unread count.
    pub fn select(&mut self, contact: UserId) -> SelectionTicket {
        self.generation += 1;
        self.unread.remove(&contact);
        self.selected = Some(contact.clone());
        SelectionTicket {
            contact,
            generation: self.generation,
            watermark: self.next_seq,
        }
    }

    /// Replaces the conversation with server history. Optimistic echoes the
    /// history does not confirm, and live messages that arrived after the
    /// selection, are kept after the history. Returns false for a stale ticket.
    pub fn apply_history(&mut self, ticket: &SelectionTicket, history: Vec<Message>) -> bool {
        if ticket.generation != self.generation {
            debug!(
                contact_id = %ticket.contact,
                "messages: discarding history for superseded selection"
            );
            return false;
        }

        let previous = self
            .conversations
            .remove(&ticket.contact)
            .unwrap_or_default();
        let mut next = Conversation::default();
        for message in history {
            if next.contains(&message.id) {
                continue;
            }
            next.entries.push(Entry {
                seq: self.next_seq,
                message,
            });
            self.next_seq += 1;
        }

        let mut claimed: HashSet<MessageId> = HashSet::new();
        let mut kept = 0usize;
        for entry in previous.entries {
            if next.contains(&entry.message.id) {
                continue;
            }
            if entry.message.id.is_provisional() {
                let confirmation = next.entries.iter().find(|candidate| {
                    candidate.message.sender == self.local_user
                        && !claimed.contains(&candidate.message.id)
                        && candidate.message.same_content(&entry.message)
                });
                if let Some(confirmation) = confirmation {
                    claimed.insert(confirmation.message.id.clone());
                    continue;
                }
            } else if entry.seq < ticket.watermark {
                continue;
            }
            next.entries.push(entry);
            kept += 1;
        }

        debug!(
            contact_id = %ticket.contact,
            total = next.entries.len(),
            kept,
            "messages: history applied"
        );
        self.conversations.insert(ticket.contact.clone(), next);
        true
    }

    pub fn remove(&mut self, message_id: &MessageId) -> Option<Message> {
        for conversation in self.conversations.values_mut() {
            if let Some(index) = conversation
                .entries
                .iter()
                .position(|entry| &entry.message.id == message_id)
            {
                return Some(conversation.entries.remove(index).message);
            }
        }
        None
    }

    /// Drops a contact's conversation and counter; deselects it if active.
    pub fn forget(&mut self, contact: &UserId) {
        self.conversations.remove(contact);
        self.unread.remove(contact);
        if self.selected.as_ref() == Some(contact) {
            self.selected = None;
            self.generation += 1;
        }
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.conversations
            .values()
            .any(|conversation| conversation.contains(message_id))
    }

    pub fn selected(&self) -> Option<&UserId> {
        self.selected.as_ref()
    }

    /// Log of the active conversation in arrival order.
    pub fn messages(&self) -> Vec<Message> {
        self.selected
            .as_ref()
            .map(|contact| self.conversation(contact))
            .unwrap_or_default()
    }

    pub fn conversation(&self, contact: &UserId) -> Vec<Message> {
        self.conversations
            .get(contact)
            .map(Conversation::messages)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.conversations
            .values()
            .map(|conversation| conversation.entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unread(&self, contact: &UserId) -> u32 {
        self.unread.get(contact).copied().unwrap_or(0)
    }

    pub fn unread_counts(&self) -> HashMap<UserId, u32> {
        self.unread
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(contact, count)| (contact.clone(), *count))
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
