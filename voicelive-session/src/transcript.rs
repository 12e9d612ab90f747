//! Ordered conversation transcript shared between the controller, the
//! dispatch loop and the presentation layer.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Status,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
}

/// Change notifications for transcript subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    Appended(Message),
    Updated { id: Uuid, content: String },
    Cleared,
}

#[derive(Clone)]
pub struct Transcript {
    messages: Arc<Mutex<Vec<Message>>>,
    events: broadcast::Sender<TranscriptEvent>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            messages: Arc::new(Mutex::new(Vec::new())),
            events,
        }
    }

    pub fn push(&self, role: Role, content: impl Into<String>) -> Uuid {
        let message = Message {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
        };
        let id = message.id;
        self.messages
            .lock()
            .expect("transcript mutex poisoned")
            .push(message.clone());
        // No subscribers is fine.
        let _ = self.events.send(TranscriptEvent::Appended(message));
        id
    }

    pub fn push_user(&self, content: impl Into<String>) -> Uuid {
        self.push(Role::User, content)
    }

    pub fn push_status(&self, content: impl Into<String>) -> Uuid {
        self.push(Role::Status, content)
    }

    pub fn push_error(&self, content: impl Into<String>) -> Uuid {
        self.push(Role::Error, content)
    }

    /// Append an empty assistant message and hand out its only writer.
    pub fn begin_assistant(&self) -> AssistantMessageWriter {
        let id = self.push(Role::Assistant, String::new());
        AssistantMessageWriter {
            id,
            transcript: self.clone(),
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .lock()
            .expect("transcript mutex poisoned")
            .clone()
    }

    pub fn count(&self, role: Role) -> usize {
        self.messages
            .lock()
            .expect("transcript mutex poisoned")
            .iter()
            .filter(|m| m.role == role)
            .count()
    }

    pub fn clear(&self) {
        self.messages
            .lock()
            .expect("transcript mutex poisoned")
            .clear();
        let _ = self.events.send(TranscriptEvent::Cleared);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.events.subscribe()
    }

    fn append_to(&self, id: Uuid, delta: &str) {
        let content = {
            let mut messages = self.messages.lock().expect("transcript mutex poisoned");
            // A cleared transcript drops late deltas.
            let Some(message) = messages.iter_mut().rev().find(|m| m.id == id) else {
                return;
            };
            message.content.push_str(delta);
            message.content.clone()
        };
        let _ = self.events.send(TranscriptEvent::Updated { id, content });
    }
}

/// Exclusive append handle for one streaming assistant message.
///
/// Not `Clone`: the dispatch task that created the message is its only writer.
pub struct AssistantMessageWriter {
    id: Uuid,
    transcript: Transcript,
}

impl AssistantMessageWriter {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn append(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        self.transcript.append_to(self.id, delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_keep_insertion_order() {
        let transcript = Transcript::new();
        transcript.push_user("hello");
        let mut writer = transcript.begin_assistant();
        transcript.push_status("Searching [x]...");
        writer.append("Hi ");
        writer.append("there");

        let messages = transcript.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hi there");
        assert_eq!(messages[2].role, Role::Status);
    }

    #[tokio::test]
    async fn subscribers_see_appends_and_updates() {
        let transcript = Transcript::new();
        let mut events = transcript.subscribe();

        let mut writer = transcript.begin_assistant();
        writer.append("abc");

        match events.recv().await.unwrap() {
            TranscriptEvent::Appended(message) => {
                assert_eq!(message.role, Role::Assistant);
                assert_eq!(message.id, writer.id());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            events.recv().await.unwrap(),
            TranscriptEvent::Updated {
                id: writer.id(),
                content: "abc".to_string()
            }
        );
    }

    #[test]
    fn deltas_after_clear_are_dropped() {
        let transcript = Transcript::new();
        let mut writer = transcript.begin_assistant();
        transcript.clear();
        writer.append("late");
        assert!(transcript.messages().is_empty());
        assert_eq!(transcript.count(Role::Assistant), 0);
    }
}
