use chrono::Utc;

use tandem_shared::protocol::ChatMessage;
use tandem_shared::types::UserId;

/// Append-only chat history, oldest first.
#[derive(Debug, Default)]
pub struct MessageLog {
    messages: Vec<ChatMessage>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(
        &mut self,
        from: UserId,
        to: UserId,
        content: String,
        template_id: String,
    ) -> ChatMessage {
        let message = ChatMessage {
            from_uuid: from,
            to_uuid: to,
            content,
            template_id,
            timestamp: Utc::now(),
        };
        self.messages.push(message.clone());
        message
    }

    /// The last `limit` messages exchanged between `a` and `b`, in either
    /// direction, oldest first.
    pub fn between(&self, a: &UserId, b: &UserId, limit: usize) -> Vec<ChatMessage> {
        let mut recent: Vec<ChatMessage> = self
            .messages
            .iter()
            .rev()
            .filter(|m| {
                (m.from_uuid == *a && m.to_uuid == *b) || (m.from_uuid == *b && m.to_uuid == *a)
            })
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }
}
