//! Chat list and chat lifecycle endpoints

use crate::{
    error::AppError,
    middleware::guards::User,
    models::{Chat, ChatId, ChatKind, ChatSummary, MessageId, UserId},
    state::AppState,
};
use actix_web::{delete, get, post, web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Request/Response DTOs
// ============================================

#[derive(Deserialize)]
pub struct CreateDialogRequest {
    pub user_id: UserId,
}

#[derive(Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub member_ids: Vec<UserId>,
}

#[derive(Serialize)]
pub struct ChatListItem {
    pub id: ChatId,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    pub name: String,
    pub last_message_id: Option<MessageId>,
    pub last_message: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub unread_count: usize,
}

impl From<ChatSummary> for ChatListItem {
    fn from(summary: ChatSummary) -> Self {
        Self {
            id: summary.chat_id,
            kind: summary.kind,
            name: summary.name,
            last_message_id: summary.last_message_id,
            last_message: summary.last_message_preview,
            last_message_time: summary.last_message_time,
            unread_count: summary.unread_count,
        }
    }
}

#[derive(Serialize)]
pub struct ChatInfo {
    pub id: ChatId,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    pub name: String,
    pub owner_id: UserId,
    pub participant_ids: Vec<UserId>,
    pub created_at: DateTime<Utc>,
}

impl ChatInfo {
    fn for_viewer(state: &AppState, chat: &Chat, viewer: UserId) -> Self {
        Self {
            id: chat.id,
            kind: chat.kind,
            name: state.index.title(chat, viewer),
            owner_id: chat.owner_id,
            participant_ids: chat.participant_ids.iter().copied().collect(),
            created_at: chat.created_at,
        }
    }
}

// ============================================
// Endpoints
// ============================================

/// GET /api/chats
/// The caller's chats, most recent activity first
#[get("/api/chats")]
pub async fn list_chats(
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let chats: Vec<ChatListItem> = state
        .index
        .list_chats(user.id, &state.store, &state.cursors)
        .await?
        .into_iter()
        .map(ChatListItem::from)
        .collect();

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "chats": chats,
    })))
}

/// POST /api/chat/create_dialog
/// Returns the existing dialog when one already exists for the pair
#[post("/api/chat/create_dialog")]
pub async fn create_dialog(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<CreateDialogRequest>,
) -> Result<HttpResponse, AppError> {
    let (chat, created) = state.store.create_dialog(user.id, body.user_id).await?;
    let info = ChatInfo::for_viewer(&state, &chat, user.id);

    let mut response = if created {
        HttpResponse::Created()
    } else {
        HttpResponse::Ok()
    };
    Ok(response.json(serde_json::json!({
        "success": true,
        "created": created,
        "chat": info,
    })))
}

/// POST /api/chat/create_group
#[post("/api/chat/create_group")]
pub async fn create_group(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<CreateGroupRequest>,
) -> Result<HttpResponse, AppError> {
    let chat = state
        .store
        .create_group(user.id, &body.name, &body.member_ids)
        .await?;
    let info = ChatInfo::for_viewer(&state, &chat, user.id);

    Ok(HttpResponse::Created().json(serde_json::json!({
        "success": true,
        "chat": info,
    })))
}

/// DELETE /api/chat/{id}
///
/// Authorization: group owner, or either side of a dialog
#[delete("/api/chat/{id}")]
pub async fn delete_chat(
    state: web::Data<AppState>,
    user: User,
    chat_id: web::Path<ChatId>,
) -> Result<HttpResponse, AppError> {
    let chat_id = chat_id.into_inner();
    state.store.delete_chat(user.id, chat_id).await?;
    state.cursors.forget_chat(chat_id);
    state.dispatcher.notify_deleted(chat_id);

    Ok(HttpResponse::Ok().json(serde_json::json!({ "success": true })))
}
