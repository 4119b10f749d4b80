//! Request extraction accepting either JSON or form-encoded payloads, and
//! query strings, with rejections rendered through [`AppError`].

use crate::error::AppError;
use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequest, FromRequestParts, Request},
    http::{header::CONTENT_TYPE, request::Parts},
    Json,
};
use serde::de::DeserializeOwned;

/// Deserializes the body as JSON when the content type says so, otherwise as
/// `application/x-www-form-urlencoded`.
#[derive(Debug, Clone)]
pub struct RequestBody<T>(pub T);

fn is_json(req: &Request) -> bool {
    req.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.trim_start().starts_with("application/json"))
        .unwrap_or(false)
}

#[async_trait]
impl<S, T> FromRequest<S> for RequestBody<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        if is_json(&req) {
            let Json(value) = Json::<T>::from_request(req, state).await.map_err(|e| {
                AppError::BadRequest(anyhow::anyhow!("Invalid JSON body: {}", e.body_text()))
            })?;
            return Ok(Self(value));
        }

        let bytes = Bytes::from_request(req, state).await.map_err(|e| {
            AppError::BadRequest(anyhow::anyhow!("Failed to read body: {}", e.body_text()))
        })?;
        let value = serde_urlencoded::from_bytes(&bytes)
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Invalid form body: {}", e)))?;

        Ok(Self(value))
    }
}

/// Query-string parameters, deserialized with `serde_urlencoded`.
#[derive(Debug, Clone)]
pub struct QueryParams<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for QueryParams<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let query = parts.uri.query().unwrap_or_default();
        let value = serde_urlencoded::from_str(query)
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Invalid query string: {}", e)))?;
        Ok(Self(value))
    }
}
