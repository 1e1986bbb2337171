//! Customer-facing endpoints.

use axum::{
    extract::{Multipart, Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{client_ip, user_agent, AppState};
use crate::appeals::AppealSubmission;
use crate::getcid::{Caller, CidRequest, CidResponse};
use crate::{FulfillmentError, Result};

const APPEAL_RECEIVED: &str = "Your early delivery appeal has been submitted successfully! Our team will review it within 24 hours and notify you via email and WhatsApp.";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    #[serde(default)]
    pub order_id: String,
}

pub async fn check_redemption(State(s): State<AppState>, Json(req): Json<OrderRequest>) -> Result<Json<Value>> {
    let decision = s.redemption.check(&req.order_id).await?;
    Ok(Json(json!({ "orderId": req.order_id.trim(), "decision": decision })))
}

pub async fn redeem(State(s): State<AppState>, Json(req): Json<OrderRequest>) -> Result<Json<Value>> {
    let (outcome, effects) = s.redemption.redeem(&req.order_id).await?;
    s.effects.run(effects).await;
    Ok(Json(json!({ "success": true, "redemption": outcome })))
}

pub async fn submit_appeal(State(s): State<AppState>, multipart: Multipart) -> Result<Json<Value>> {
    let submission = read_submission(multipart).await?;
    let (appeal, effects) = s.appeals.submit(submission).await?;
    s.effects.run(effects).await;
    Ok(Json(json!({ "success": true, "message": APPEAL_RECEIVED, "appealId": appeal.id })))
}

async fn read_submission(mut multipart: Multipart) -> Result<AppealSubmission> {
    let bad_form = |e: axum::extract::multipart::MultipartError| {
        tracing::debug!(error = %e, "unreadable appeal form");
        FulfillmentError::validation("Invalid form data")
    };
    let mut sub = AppealSubmission {
        order_id: String::new(),
        email: String::new(),
        whatsapp: String::new(),
        file_name: String::new(),
        content_type: String::new(),
        bytes: Vec::new(),
    };
    while let Some(field) = multipart.next_field().await.map_err(bad_form)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("orderId") => sub.order_id = field.text().await.map_err(bad_form)?,
            Some("email") => sub.email = field.text().await.map_err(bad_form)?,
            Some("whatsapp") => sub.whatsapp = field.text().await.map_err(bad_form)?,
            Some("proofImage") => {
                sub.file_name = field.file_name().unwrap_or_default().to_string();
                sub.content_type = field.content_type().unwrap_or("application/octet-stream").to_string();
                sub.bytes = field.bytes().await.map_err(bad_form)?.to_vec();
            }
            _ => {}
        }
    }
    Ok(sub)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppealQuery {
    pub order_id: Option<String>,
}

pub async fn appeal_status(State(s): State<AppState>, Query(q): Query<AppealQuery>) -> Result<Json<Value>> {
    let order_id = q.order_id.filter(|id| !id.trim().is_empty()).ok_or_else(|| FulfillmentError::validation("Order ID is required"))?;
    let body = match s.appeals.latest_for_order(&order_id).await? {
        Some(appeal) => json!({
            "success": true,
            "hasAppeal": true,
            "appeal": {
                "id": appeal.id,
                "status": appeal.status,
                "createdAt": appeal.created_at,
                "reviewedAt": appeal.reviewed_at,
                "rejectionReason": appeal.rejection_reason,
            }
        }),
        None => json!({ "success": true, "hasAppeal": false }),
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCidBody {
    pub identifier: Option<String>,
    pub identifier_type: Option<String>,
    pub installation_id: Option<String>,
}

pub async fn generate_cid(State(s): State<AppState>, headers: HeaderMap, Json(body): Json<GetCidBody>) -> Result<Json<Value>> {
    let (Some(identifier), Some(installation_id)) = (non_empty(body.identifier), non_empty(body.installation_id)) else {
        return Err(FulfillmentError::validation("Missing required fields"));
    };
    match body.identifier_type.as_deref() {
        None | Some("order_id") => {}
        Some(other) => return Err(FulfillmentError::validation(format!("Unsupported identifier type: {other}"))),
    }
    let req = CidRequest {
        caller: Caller::Customer { order_id: identifier },
        installation_id,
        ip_address: client_ip(&headers),
        user_agent: user_agent(&headers),
    };
    let (resp, effects) = s.tokens.generate(req).await?;
    s.effects.run(effects).await;
    Ok(Json(cid_body(&resp)))
}

pub(super) fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Success carries the confirmation id; failures carry the message and a retry hint.
pub(super) fn cid_body(resp: &CidResponse) -> Value {
    if resp.success {
        json!({
            "success": true,
            "confirmationId": resp.confirmation_id,
            "message": resp.message,
            "remainingUses": resp.remaining_uses,
        })
    } else {
        json!({ "success": false, "error": resp.message, "status": resp.status, "canRetry": resp.can_retry })
    }
}
