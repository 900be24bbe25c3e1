// Notification messages sent on collaboration events. Only the recipient
// can read, mark or delete them; deletion is a soft flag.

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    db::models::{Message, MessageKind, MessageRow},
    error::{AppError, Result},
};

pub struct NewMessage<'a> {
    pub recipient_id: &'a str,
    pub sender_id: &'a str,
    pub project_id: &'a str,
    pub kind: MessageKind,
    pub body: String,
}

pub async fn send(pool: &SqlitePool, message: NewMessage<'_>) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO messages (id, recipient_id, sender_id, project_id, kind, body, read, deleted, created_at) VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?)",
    )
    .bind(&id)
    .bind(message.recipient_id)
    .bind(message.sender_id)
    .bind(message.project_id)
    .bind(message.kind.as_str())
    .bind(&message.body)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    tracing::debug!(message_id = %id, kind = message.kind.as_str(), "Message sent");
    Ok(id)
}

pub async fn list_for(pool: &SqlitePool, recipient_id: &str) -> Result<Vec<Message>> {
    let rows = sqlx::query_as::<_, MessageRow>(
        r#"
        SELECT id, recipient_id, sender_id, project_id, kind, body, read, deleted, created_at
        FROM messages
        WHERE recipient_id = ? AND deleted = 0
        ORDER BY created_at DESC
        "#,
    )
    .bind(recipient_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Message::try_from).collect()
}

pub async fn unread_count(pool: &SqlitePool, recipient_id: &str) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM messages WHERE recipient_id = ? AND deleted = 0 AND read = 0",
    )
    .bind(recipient_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

async fn ensure_recipient(pool: &SqlitePool, id: &str, user_id: &str) -> Result<()> {
    let recipient = sqlx::query_scalar::<_, String>(
        "SELECT recipient_id FROM messages WHERE id = ? AND deleted = 0",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound("Message not found".to_string()))?;

    if recipient != user_id {
        return Err(AppError::Forbidden(
            "Only the recipient can change this message".to_string(),
        ));
    }
    Ok(())
}

pub async fn mark_read(pool: &SqlitePool, id: &str, user_id: &str) -> Result<()> {
    ensure_recipient(pool, id, user_id).await?;
    sqlx::query("UPDATE messages SET read = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn soft_delete(pool: &SqlitePool, id: &str, user_id: &str) -> Result<()> {
    ensure_recipient(pool, id, user_id).await?;
    sqlx::query("UPDATE messages SET deleted = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
