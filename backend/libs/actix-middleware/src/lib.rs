//! # Actix Middleware Library
//!
//! Middleware shared by the chat services.
//!
//! ## Modules
//! - `identity`: resolves the acting user from headers set by the auth gateway
//! - `request_id`: `x-request-id` propagation
//! - `logging`: structured request/response logging

pub mod identity;
pub mod logging;
pub mod request_id;

pub use identity::{DisplayName, Identity, UserId, USER_ID_HEADER, USER_NAME_HEADER};
pub use logging::Logging;
pub use request_id::{RequestId, RequestIdValue, REQUEST_ID_HEADER};
