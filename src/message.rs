use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Subject used for logging and delivery when the source message has none.
pub const FALLBACK_SUBJECT: &str = "(no subject)";

/// Protocol-agnostic form every message is converted to between fetch and
/// delivery. Nothing here is mandatory: a missing sender, recipient or
/// subject is substituted at delivery time, never a reason to reject the
/// message.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub text: Option<String>,
    pub html: Option<String>,
    pub headers: HashMap<String, String>,
    pub attachments: Vec<EmailAttachment>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct EmailAttachment {
    pub filename: String,
    pub content: Vec<u8>,
    pub content_type: String,
}

impl EmailMessage {
    pub fn subject_or_placeholder(&self) -> &str {
        self.subject.as_deref().unwrap_or(FALLBACK_SUBJECT)
    }
}
