use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::api::error::ApiError;
use crate::{Error, OwnerId};

/// Header in which the gateway passes the authenticated owner.
pub const OWNER_HEADER: &str = "x-owner-id";

/// Owner ids end up in file paths and batch scripts, so only `[A-Za-z0-9._-]` is accepted.
pub fn is_valid_owner_id(owner: &str) -> bool {
    !owner.is_empty()
        && owner.len() <= 128
        && owner
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Identity of the caller. Requests without it are rejected as unauthenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner(pub OwnerId);

impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let owner = parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| is_valid_owner_id(value));
        match owner {
            Some(owner) => Ok(Owner(owner.to_string())),
            None => Err(ApiError(Error::Unauthenticated)),
        }
    }
}
