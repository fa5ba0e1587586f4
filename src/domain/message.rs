use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File attached to a chat message. Stored as received, never interpreted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Message record as yielded by the chat listener.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub channel: String,
    pub author: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Stored chat message. `parent_id` is a weak link: the parent may never
/// have been captured.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub parent_id: Option<String>,
    pub channel: String,
    pub author: String,
    pub attachments: Vec<Attachment>,
    pub processed: bool,
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        Self {
            id: record.id,
            timestamp: record.timestamp,
            content: record.content,
            parent_id: record.parent_id,
            channel: record.channel,
            author: record.author,
            attachments: record.attachments,
            processed: false,
        }
    }
}

impl Message {
    /// One line of classifier context: `[timestamp] author: content`.
    pub fn context_line(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.author,
            self.content.trim()
        )
    }
}
