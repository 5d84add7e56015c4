//! Serves uploaded media by key

use crate::{error::AppError, state::AppState};
use actix_web::{get, http::header, web, HttpResponse};

/// GET /media/{key}
#[get("/media/{key}")]
pub async fn get_media(
    state: web::Data<AppState>,
    key: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    match state.media.get(&key).await? {
        Some(object) => Ok(HttpResponse::Ok()
            .content_type(object.content_type)
            .insert_header((header::CACHE_CONTROL, "private, max-age=86400"))
            .body(object.bytes)),
        None => Ok(HttpResponse::NotFound().json(serde_json::json!({
            "success": false,
            "error": "media_not_found",
            "message": "media not found",
        }))),
    }
}
