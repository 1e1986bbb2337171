//! Shared-secret bearer guards for admin and cron routes.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};

use super::AppState;
use crate::{FulfillmentError, Result};

pub async fn require_admin(State(s): State<AppState>, req: Request, next: Next) -> Result<Response> {
    authorize("admin", s.admin_api_key.as_deref(), req.headers())?;
    Ok(next.run(req).await)
}

pub async fn require_cron(State(s): State<AppState>, req: Request, next: Next) -> Result<Response> {
    authorize("cron", s.cron_secret.as_deref(), req.headers())?;
    Ok(next.run(req).await)
}

/// Accepts `Authorization: Bearer <secret>`. An unset secret denies every request.
fn authorize(scope: &str, secret: Option<&str>, headers: &HeaderMap) -> Result<()> {
    let Some(secret) = secret else {
        tracing::warn!(scope, "request denied: no secret configured");
        return Err(FulfillmentError::Unauthorized);
    };
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim);
    match presented {
        Some(token) if token == secret => Ok(()),
        _ => Err(FulfillmentError::Unauthorized),
    }
}
