pub mod flows;
pub mod steps;
pub mod tasks;

use std::convert::Infallible;

use axum::async_trait;
use axum::body::Bytes;
use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::http::request::Parts;
use axum::Json;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::ApiError;

pub const ACTOR_HEADER: &str = "x-user";

/// The calling user, taken from the `x-user` header. Authentication is
/// handled upstream; requests without the header act as `anonymous`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let name = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("anonymous");
        Ok(Actor(name.to_owned()))
    }
}

/// A JSON body that may be left out entirely.
///
/// An empty body yields `T::default()`. A body that is present but does not
/// decode into `T` is rejected with 422 instead of being treated as absent.
#[derive(Debug, Clone, Default)]
pub struct OptionalJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for OptionalJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Default,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self(T::default()));
        }
        serde_json::from_slice(&bytes)
            .map(Self)
            .map_err(|err| ApiError::InvalidBody(err.to_string()))
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
