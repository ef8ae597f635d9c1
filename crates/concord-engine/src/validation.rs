use chrono::{DateTime, Utc};

use concord_types::{Attachment, MessageRecord, ThreadId};

use crate::config::EngineConfig;

/// Structural checks for a message copy, whether composed here or received
/// from another party. Returns the first problem found.
pub fn validate_message(
    message: &MessageRecord,
    thread_id: ThreadId,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<(), String> {
    if message.thread_id != thread_id {
        return Err(format!("message belongs to thread {}", message.thread_id));
    }
    if message.sender.as_str().trim().is_empty() {
        return Err("sender is blank".into());
    }
    if message.visible_to.as_str().trim().is_empty() {
        return Err("recipient is blank".into());
    }
    if message.subject.chars().count() > config.max_subject_len {
        return Err(format!("subject longer than {} characters", config.max_subject_len));
    }
    if message.content.trim().is_empty() && message.attachment.is_none() {
        return Err("message has neither content nor attachment".into());
    }
    if message.content.len() > config.max_content_len {
        return Err(format!("content larger than {} bytes", config.max_content_len));
    }
    if let Some(attachment) = &message.attachment {
        validate_attachment(attachment)?;
    }

    let skew = chrono::Duration::from_std(config.max_clock_skew).unwrap_or_else(|_| chrono::Duration::days(1));
    if message.created_at > now + skew {
        return Err(format!("timestamp {} is in the future", message.created_at));
    }
    Ok(())
}

fn validate_attachment(attachment: &Attachment) -> Result<(), String> {
    if attachment.name.trim().is_empty() {
        return Err("attachment name is blank".into());
    }
    if attachment.sha256.len() != 64 || !attachment.sha256.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(format!("attachment {} has a malformed digest", attachment.name));
    }
    Ok(())
}
