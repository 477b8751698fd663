//! Canvas objects agents can read and react to
//!
//! Pinboards carry voted items, inboxes carry message lists, boards carry
//! free text. Pinboard items disappear once their net score reaches
//! `PIN_REMOVAL_SCORE`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;
use workshop_common::constants::PIN_REMOVAL_SCORE;
use workshop_common::{Position, generate_id, generate_prefixed_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Pinboard,
    Messageboard,
    Inbox,
    Rulebook,
    Portal,
}

impl ElementKind {
    /// Floating emoji shown when an agent walks past
    pub fn reaction_emoji(&self) -> &'static str {
        match self {
            ElementKind::Pinboard => "📌",
            ElementKind::Messageboard => "💬",
            ElementKind::Inbox => "📬",
            ElementKind::Rulebook => "📖",
            ElementKind::Portal => "✨",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Recorded,
    /// The voter had already cast this exact vote
    Unchanged,
    /// The vote pushed the item to the removal threshold
    Removed,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinComment {
    pub author: String,
    pub text: String,
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinItem {
    pub id: String,
    pub text: String,
    pub author: String,
    pub upvoters: BTreeSet<String>,
    pub downvoters: BTreeSet<String>,
    pub comments: Vec<PinComment>,
}

impl PinItem {
    pub fn score(&self) -> i64 {
        self.upvoters.len() as i64 - self.downvoters.len() as i64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxMessage {
    pub id: String,
    pub from: String,
    pub subject: String,
    pub body: String,
    pub read: bool,
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ElementPayload {
    Pinboard {
        items: Vec<PinItem>,
    },
    #[serde(rename_all = "camelCase")]
    Inbox {
        owner_agent_id: Option<String>,
        inbox: Vec<InboxMessage>,
        outbox: Vec<InboxMessage>,
    },
    Board {
        content: String,
    },
    Portal {
        target: String,
    },
}

impl ElementPayload {
    pub fn empty_for(kind: ElementKind) -> Self {
        match kind {
            ElementKind::Pinboard => ElementPayload::Pinboard { items: Vec::new() },
            ElementKind::Inbox => ElementPayload::Inbox {
                owner_agent_id: None,
                inbox: Vec::new(),
                outbox: Vec::new(),
            },
            ElementKind::Messageboard | ElementKind::Rulebook => ElementPayload::Board {
                content: String::new(),
            },
            ElementKind::Portal => ElementPayload::Portal {
                target: String::new(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkshopElement {
    pub id: String,
    pub kind: ElementKind,
    pub label: String,
    pub position: Position,
    pub payload: ElementPayload,
}

impl WorkshopElement {
    pub fn new(kind: ElementKind, label: impl Into<String>, position: Position) -> Self {
        Self {
            id: generate_id(),
            kind,
            label: label.into(),
            position,
            payload: ElementPayload::empty_for(kind),
        }
    }

    /// Add a pinboard item, returning its id
    pub fn add_pin(&mut self, author: &str, text: &str) -> Option<String> {
        let ElementPayload::Pinboard { items } = &mut self.payload else {
            return None;
        };
        let id = generate_prefixed_id("pin");
        items.push(PinItem {
            id: id.clone(),
            text: text.to_string(),
            author: author.to_string(),
            upvoters: BTreeSet::new(),
            downvoters: BTreeSet::new(),
            comments: Vec::new(),
        });
        Some(id)
    }

    /// Cast or switch a vote. One vote per voter per item.
    pub fn vote(&mut self, item_id: &str, voter: &str, direction: VoteDirection) -> VoteOutcome {
        let ElementPayload::Pinboard { items } = &mut self.payload else {
            return VoteOutcome::NotFound;
        };
        let Some(idx) = items.iter().position(|item| item.id == item_id) else {
            return VoteOutcome::NotFound;
        };

        let item = &mut items[idx];
        let (add_to, remove_from) = match direction {
            VoteDirection::Up => (&mut item.upvoters, &mut item.downvoters),
            VoteDirection::Down => (&mut item.downvoters, &mut item.upvoters),
        };
        remove_from.remove(voter);
        if !add_to.insert(voter.to_string()) {
            return VoteOutcome::Unchanged;
        }

        if item.score() <= PIN_REMOVAL_SCORE {
            debug!("Pin {} removed at score {}", item_id, item.score());
            items.remove(idx);
            return VoteOutcome::Removed;
        }
        VoteOutcome::Recorded
    }

    pub fn comment(&mut self, item_id: &str, author: &str, text: &str, at: i64) -> bool {
        let ElementPayload::Pinboard { items } = &mut self.payload else {
            return false;
        };
        match items.iter_mut().find(|item| item.id == item_id) {
            Some(item) => {
                item.comments.push(PinComment {
                    author: author.to_string(),
                    text: text.to_string(),
                    at,
                });
                true
            }
            None => false,
        }
    }

    pub fn pin_items(&self) -> &[PinItem] {
        match &self.payload {
            ElementPayload::Pinboard { items } => items,
            _ => &[],
        }
    }

    /// Deliver a message to an inbox element
    pub fn deliver(&mut self, from: &str, subject: &str, body: &str, at: i64) -> bool {
        let ElementPayload::Inbox { inbox, .. } = &mut self.payload else {
            return false;
        };
        inbox.push(InboxMessage {
            id: generate_prefixed_id("msg"),
            from: from.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            read: false,
            at,
        });
        true
    }

    /// Record an outgoing message on an inbox element
    pub fn send_outgoing(&mut self, from: &str, subject: &str, body: &str, at: i64) -> bool {
        let ElementPayload::Inbox { outbox, .. } = &mut self.payload else {
            return false;
        };
        outbox.push(InboxMessage {
            id: generate_prefixed_id("msg"),
            from: from.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            read: true,
            at,
        });
        true
    }

    pub fn unread_count(&self) -> usize {
        match &self.payload {
            ElementPayload::Inbox { inbox, .. } => inbox.iter().filter(|m| !m.read).count(),
            _ => 0,
        }
    }

    /// Mark every inbox message read, returning how many changed
    pub fn mark_all_read(&mut self) -> usize {
        let ElementPayload::Inbox { inbox, .. } = &mut self.payload else {
            return 0;
        };
        let mut changed = 0;
        for message in inbox.iter_mut().filter(|m| !m.read) {
            message.read = true;
            changed += 1;
        }
        changed
    }

    pub fn owner_agent_id(&self) -> Option<&str> {
        match &self.payload {
            ElementPayload::Inbox { owner_agent_id, .. } => owner_agent_id.as_deref(),
            _ => None,
        }
    }

    pub fn set_owner(&mut self, agent_id: &str) -> bool {
        let ElementPayload::Inbox { owner_agent_id, .. } = &mut self.payload else {
            return false;
        };
        *owner_agent_id = Some(agent_id.to_string());
        true
    }

    pub fn set_content(&mut self, text: &str) -> bool {
        match &mut self.payload {
            ElementPayload::Board { content } => {
                *content = text.to_string();
                true
            }
            ElementPayload::Portal { target } => {
                *target = text.to_string();
                true
            }
            _ => false,
        }
    }

    /// Plain-text rendering used when an agent reads the element
    pub fn describe(&self) -> String {
        match &self.payload {
            ElementPayload::Pinboard { items } if items.is_empty() => {
                format!("Pinboard \"{}\" is empty.", self.label)
            }
            ElementPayload::Pinboard { items } => {
                let lines: Vec<String> = items
                    .iter()
                    .map(|item| format!("- [{:+}] {} (by {})", item.score(), item.text, item.author))
                    .collect();
                format!("Pinboard \"{}\":\n{}", self.label, lines.join("\n"))
            }
            ElementPayload::Inbox { inbox, .. } => {
                let lines: Vec<String> = inbox
                    .iter()
                    .map(|m| format!("- {}{}: {}", if m.read { "" } else { "(unread) " }, m.from, m.subject))
                    .collect();
                format!("Inbox \"{}\" ({} messages):\n{}", self.label, inbox.len(), lines.join("\n"))
            }
            ElementPayload::Board { content } => format!("{} \"{}\":\n{}", kind_name(self.kind), self.label, content),
            ElementPayload::Portal { target } => format!("Portal \"{}\" leads to {}", self.label, target),
        }
    }
}

fn kind_name(kind: ElementKind) -> &'static str {
    match kind {
        ElementKind::Pinboard => "Pinboard",
        ElementKind::Messageboard => "Message board",
        ElementKind::Inbox => "Inbox",
        ElementKind::Rulebook => "Rulebook",
        ElementKind::Portal => "Portal",
    }
}
