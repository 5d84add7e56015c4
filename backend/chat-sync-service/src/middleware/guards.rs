//! Request guards built on the identity set by `actix_middleware::Identity`.
//! Handlers that take a [`User`] cannot run without an authenticated caller.

use std::future::{ready, Ready};

use crate::error::AppError;
use crate::models::UserId as ChatUserId;
use crate::state::AppState;
use actix_middleware::{DisplayName, UserId};
use actix_web::{web, Error, FromRequest, HttpMessage, HttpRequest};

/// Authenticated caller
#[derive(Debug, Clone)]
pub struct User {
    pub id: ChatUserId,
    pub name: Option<String>,
}

impl FromRequest for User {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        let extensions = req.extensions();
        let Some(user_id) = extensions.get::<UserId>().map(|u| u.0) else {
            return ready(Err(AppError::Unauthorized.into()));
        };
        let name = extensions.get::<DisplayName>().map(|n| n.0.clone());

        // Keep the directory used for dialog titles current
        if let (Some(name), Some(state)) = (&name, req.app_data::<web::Data<AppState>>()) {
            state.index.remember_name(user_id, name);
        }

        ready(Ok(User { id: user_id, name }))
    }
}
