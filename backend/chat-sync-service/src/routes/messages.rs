//! Message history, sync, send, edit and read-receipt endpoints

use crate::{
    error::AppError,
    middleware::guards::User,
    models::{ChatId, MediaRef, Message, MessageId, MessageView, SyncView},
    services::message_store::NewMessage,
    state::AppState,
};
use actix_multipart::{Field, Multipart};
use actix_web::{get, patch, post, web, HttpResponse};
use futures_util::TryStreamExt as _;
use serde::{Deserialize, Serialize};

const DEFAULT_PAGE_LIMIT: usize = 50;

// ============================================
// Request/Response DTOs
// ============================================

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub before_id: Option<MessageId>,
    pub after_id: Option<MessageId>,
}

#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    #[serde(default)]
    pub cursor: MessageId,
    pub changes_after: Option<u64>,
}

#[derive(Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Deserialize)]
pub struct MarkReadRequest {
    pub up_to_id: MessageId,
}

/// Compact confirmation returned to the sender
#[derive(Serialize)]
pub struct SentMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub content: Option<String>,
    pub has_media: bool,
    pub media_type: Option<String>,
    pub media_url: Option<String>,
}

#[derive(Default)]
struct SendForm {
    content: Option<String>,
    media: Option<MediaRef>,
    idempotency_key: Option<String>,
}

fn render(state: &AppState, messages: &[Message], viewer: u64) -> Vec<MessageView> {
    messages
        .iter()
        .map(|m| MessageView::render(m, viewer, |media| state.media_url(media)))
        .collect()
}

fn clamp_limit(state: &AppState, limit: Option<usize>) -> usize {
    limit
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, state.config.sync.max_page_limit)
}

async fn read_text(mut field: Field, max_bytes: usize) -> Result<String, AppError> {
    let mut buf = Vec::new();
    while let Some(chunk) = field
        .try_next()
        .await
        .map_err(|e| AppError::BadRequest(format!("invalid multipart: {e}")))?
    {
        buf.extend_from_slice(&chunk);
        if buf.len() > max_bytes {
            return Err(AppError::BadRequest("form field too large".into()));
        }
    }
    String::from_utf8(buf).map_err(|_| AppError::BadRequest("form field is not UTF-8".into()))
}

async fn read_form(state: &AppState, mut payload: Multipart) -> Result<SendForm, AppError> {
    let mut form = SendForm::default();
    // Text is bounded in characters; four bytes per char covers any UTF-8
    let max_text_bytes = state.config.max_message_length.saturating_mul(4).max(1024);

    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| AppError::BadRequest(format!("invalid multipart: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "content" => form.content = Some(read_text(field, max_text_bytes).await?),
            "idempotency_key" => {
                form.idempotency_key = Some(read_text(field, 1024).await?.trim().to_string())
            }
            "media" => {
                let content_type = field
                    .content_type()
                    .map(|m| m.essence_str().to_string())
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                let max_bytes = state.config.media.max_upload_bytes;

                let mut bytes = Vec::new();
                while let Some(chunk) = field
                    .try_next()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("upload read error: {e}")))?
                {
                    bytes.extend_from_slice(&chunk);
                    if bytes.len() > max_bytes {
                        return Err(AppError::BadRequest(format!(
                            "media exceeds {max_bytes} bytes"
                        )));
                    }
                }
                // Browsers send an empty part when no file was picked
                if !bytes.is_empty() {
                    form.media = Some(state.media.put(&content_type, bytes).await?);
                }
            }
            other => {
                tracing::debug!(field = other, "ignoring unknown form field");
                while field
                    .try_next()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("invalid multipart: {e}")))?
                    .is_some()
                {}
            }
        }
    }
    Ok(form)
}

// ============================================
// Endpoints
// ============================================

/// GET /api/chat/{id}/messages
///
/// - `after_id`: incremental sync, ascending from the id
/// - `before_id`: the newest `limit` messages below the id
/// - `offset`: skip the newest `offset` messages
#[get("/api/chat/{id}/messages")]
pub async fn get_messages(
    state: web::Data<AppState>,
    user: User,
    chat_id: web::Path<ChatId>,
    query: web::Query<MessagesQuery>,
) -> Result<HttpResponse, AppError> {
    let chat_id = chat_id.into_inner();

    if let Some(after_id) = query.after_id {
        let result = state.sync.poll(user.id, chat_id, after_id).await?;
        let view = SyncView::render(result, user.id, |m| state.media_url(m));
        return Ok(HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "messages": view.messages,
            "has_more": view.has_more,
            "new_cursor": view.new_cursor,
            "resynced": view.resynced,
        })));
    }

    let limit = clamp_limit(&state, query.limit);
    let (messages, has_more) = match query.before_id {
        Some(before_id) => {
            let messages = state
                .store
                .get_range(chat_id, user.id, None, Some(before_id), limit)
                .await?;
            let has_more = messages.first().map(|m| m.id > 1).unwrap_or(false);
            (messages, has_more)
        }
        None => {
            state
                .store
                .get_page(chat_id, user.id, query.offset.unwrap_or(0), limit)
                .await?
        }
    };

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "messages": render(&state, &messages, user.id),
        "has_more": has_more,
    })))
}

/// GET /api/chat/{id}/sync
/// Full delta: new messages, receipts on own messages and edits
#[get("/api/chat/{id}/sync")]
pub async fn sync_chat(
    state: web::Data<AppState>,
    user: User,
    chat_id: web::Path<ChatId>,
    query: web::Query<SyncQuery>,
) -> Result<HttpResponse, AppError> {
    let result = state
        .sync
        .sync(user.id, chat_id.into_inner(), query.cursor, query.changes_after)
        .await?;
    let view = SyncView::render(result, user.id, |m| state.media_url(m));

    let mut body = serde_json::to_value(&view).map_err(|_| AppError::Internal)?;
    if let Some(object) = body.as_object_mut() {
        object.insert("success".into(), serde_json::Value::Bool(true));
    }
    Ok(HttpResponse::Ok().json(body))
}

/// POST /api/chat/{id}/send_message
/// multipart/form-data: `content`, `media`, `idempotency_key`
#[post("/api/chat/{id}/send_message")]
pub async fn send_message(
    state: web::Data<AppState>,
    user: User,
    chat_id: web::Path<ChatId>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let chat_id = chat_id.into_inner();
    // Reject outsiders before storing any upload
    state.store.chat_for(chat_id, user.id)?;

    let form = read_form(&state, payload).await?;
    let appended = state
        .store
        .append(NewMessage {
            chat_id,
            sender_id: user.id,
            content: form.content,
            media: form.media,
            idempotency_key: form.idempotency_key,
        })
        .await?;

    if !appended.duplicate {
        state.dispatcher.notify(chat_id);
    }

    let message = appended.message;
    let sent = SentMessage {
        id: message.id,
        chat_id,
        timestamp: message.created_at,
        has_media: message.has_media(),
        media_type: message.media.as_ref().map(|m| m.media_type.clone()),
        media_url: message.media.as_ref().map(|m| state.media_url(m)),
        content: message.content,
    };

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "duplicate": appended.duplicate,
        "message": sent,
    })))
}

/// PATCH /api/chat/{id}/messages/{message_id}
///
/// Authorization: the message's sender only
#[patch("/api/chat/{id}/messages/{message_id}")]
pub async fn edit_message(
    state: web::Data<AppState>,
    user: User,
    path: web::Path<(ChatId, MessageId)>,
    body: web::Json<EditMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let (chat_id, message_id) = path.into_inner();
    let message = state
        .store
        .edit(chat_id, message_id, user.id, &body.content)
        .await?;
    state.dispatcher.notify(chat_id);

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "message": MessageView::render(&message, user.id, |m| state.media_url(m)),
    })))
}

/// POST /api/chat/{id}/read
/// Marks every message up to `up_to_id` as read by the caller
#[post("/api/chat/{id}/read")]
pub async fn mark_read(
    state: web::Data<AppState>,
    user: User,
    chat_id: web::Path<ChatId>,
    body: web::Json<MarkReadRequest>,
) -> Result<HttpResponse, AppError> {
    let chat_id = chat_id.into_inner();
    let outcome = state
        .store
        .mark_read(chat_id, body.up_to_id, user.id)
        .await?;

    // Read implies delivered
    state.sync.record_delivery(user.id, chat_id, outcome.up_to, None);
    if !outcome.updated.is_empty() {
        state.dispatcher.notify(chat_id);
    }

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "up_to_id": outcome.up_to,
        "updated": outcome.updated.len(),
    })))
}
