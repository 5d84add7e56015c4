//! Identity middleware
//!
//! Session handling lives in the upstream auth gateway, which forwards the
//! authenticated user as `x-user-id` (and optionally `x-user-name`). This
//! middleware only parses those headers into request extensions; handlers that
//! need a user reject requests without one.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use futures::future::LocalBoxFuture;
use std::future::{ready, Ready};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";

/// Authenticated user id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserId(pub u64);

/// Display name forwarded with the user id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayName(pub String);

#[derive(Clone, Default)]
pub struct Identity;

impl<S, B> Transform<S, ServiceRequest> for Identity
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = IdentityService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(IdentityService { service }))
    }
}

pub struct IdentityService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for IdentityService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let user_id = req
            .headers()
            .get(USER_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|id| *id > 0);

        if let Some(id) = user_id {
            let name = req
                .headers()
                .get(USER_NAME_HEADER)
                .and_then(|h| h.to_str().ok())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string());

            let mut ext = req.extensions_mut();
            ext.insert(UserId(id));
            if let Some(name) = name {
                ext.insert(DisplayName(name));
            }
        } else if req.headers().contains_key(USER_ID_HEADER) {
            tracing::warn!(path = %req.path(), "ignoring malformed x-user-id header");
        }

        let fut = self.service.call(req);
        Box::pin(fut)
    }
}
