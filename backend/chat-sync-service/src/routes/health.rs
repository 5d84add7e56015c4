use crate::state::AppState;
use actix_web::{get, web, HttpResponse};

#[get("/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

/// Session keep-alive used by the web client
#[get("/api/ping")]
pub async fn ping(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "chats": state.store.chat_count(),
        "connections": state.dispatcher.connection_count(),
    }))
}
