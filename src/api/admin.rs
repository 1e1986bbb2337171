//! Admin endpoints, behind the admin bearer guard.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::customer::{cid_body, non_empty};
use super::{client_ip, user_agent, AppState};
use crate::appeals::ResolveAppeal;
use crate::domain::aggregates::{AppealStatus, MultiItemStatus};
use crate::getcid::{AddToken, Caller, CidRequest, TokenList, UpdateToken};
use crate::state_delays::{CreateStateDelay, UpdateStateDelay};
use crate::sync::ProcessMultiItem;
use crate::{FulfillmentError, Result};

// ---- state delays ----

pub async fn list_state_delays(State(s): State<AppState>) -> Result<Json<Value>> {
    Ok(Json(json!({ "success": true, "data": s.delays.list().await? })))
}

pub async fn create_state_delay(State(s): State<AppState>, Json(req): Json<CreateStateDelay>) -> Result<(StatusCode, Json<Value>)> {
    let entry = s.delays.create(req).await?;
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "data": entry }))))
}

pub async fn update_state_delay(State(s): State<AppState>, Path(id): Path<Uuid>, Json(req): Json<UpdateStateDelay>) -> Result<Json<Value>> {
    Ok(Json(json!({ "success": true, "data": s.delays.update(id, req).await? })))
}

pub async fn delete_state_delay(State(s): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>> {
    s.delays.delete(id).await?;
    Ok(Json(json!({ "success": true })))
}

// ---- appeals ----

#[derive(Debug, Deserialize)]
pub struct AppealListParams {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_appeals(State(s): State<AppState>, Query(p): Query<AppealListParams>) -> Result<Json<Value>> {
    let status = match p.status.as_deref().map(str::trim) {
        None | Some("") | Some("ALL") => None,
        Some(raw) => match AppealStatus::from_db(Some(raw)) {
            AppealStatus::None => return Err(FulfillmentError::validation(format!("Unknown appeal status: {raw}"))),
            status => Some(status),
        },
    };
    let page = s.appeals.list(status, p.limit.unwrap_or(50), p.offset.unwrap_or(0)).await?;
    Ok(Json(json!({ "success": true, "appeals": page.data, "total": page.total, "limit": page.limit, "offset": page.offset })))
}

pub async fn resolve_appeal(State(s): State<AppState>, Path(id): Path<Uuid>, Json(req): Json<ResolveAppeal>) -> Result<Json<Value>> {
    let (appeal, effects) = s.appeals.resolve(id, req).await?;
    s.effects.run(effects).await;
    let message = format!("Appeal {} successfully", appeal.status.label());
    Ok(Json(json!({ "success": true, "message": message, "appeal": appeal })))
}

// ---- GetCID tokens ----

pub async fn list_tokens(State(s): State<AppState>) -> Result<Json<TokenList>> {
    Ok(Json(s.tokens.list().await?))
}

pub async fn add_token(State(s): State<AppState>, Json(req): Json<AddToken>) -> Result<(StatusCode, Json<Value>)> {
    let token = s.tokens.add(req).await?;
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "token": token, "message": "Token added successfully" }))))
}

pub async fn update_token(State(s): State<AppState>, Path(id): Path<Uuid>, Json(req): Json<UpdateToken>) -> Result<Json<Value>> {
    Ok(Json(json!({ "success": true, "token": s.tokens.update(id, req).await? })))
}

pub async fn resync_token(State(s): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>> {
    Ok(Json(json!({ "success": true, "token": s.tokens.resync(id).await? })))
}

pub async fn delete_token(State(s): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>> {
    s.tokens.remove(id).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalCidBody {
    pub installation_id: Option<String>,
}

/// Support fallback: no order quota applies.
pub async fn internal_cid(State(s): State<AppState>, headers: HeaderMap, Json(body): Json<InternalCidBody>) -> Result<Json<Value>> {
    let installation_id = non_empty(body.installation_id).ok_or_else(|| FulfillmentError::validation("Missing Installation ID"))?;
    let req = CidRequest {
        caller: Caller::Internal { label: "internal".into() },
        installation_id,
        ip_address: client_ip(&headers),
        user_agent: user_agent(&headers),
    };
    let (resp, effects) = s.tokens.generate(req).await?;
    s.effects.run(effects).await;
    Ok(Json(cid_body(&resp)))
}

// ---- multi-item orders ----

#[derive(Debug, Deserialize)]
pub struct MultiItemListParams {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Lists queued orders; pending only unless `status` says otherwise.
pub async fn list_multi_item_orders(State(s): State<AppState>, Query(p): Query<MultiItemListParams>) -> Result<Json<Value>> {
    let status = match p.status.as_deref().map(str::trim) {
        None | Some("") => Some(MultiItemStatus::Pending),
        Some(raw) if raw.eq_ignore_ascii_case("ALL") => None,
        Some(raw) => match MultiItemStatus::from_db(raw) {
            Some(status) => Some(status),
            None => return Err(FulfillmentError::validation(format!("Unknown multi-item status: {raw}"))),
        },
    };
    let page = s.multi_items.list(status, p.limit.unwrap_or(50), p.offset.unwrap_or(0)).await?;
    Ok(Json(json!({ "success": true, "orders": page.data, "total": page.total, "limit": page.limit, "offset": page.offset })))
}

pub async fn process_multi_item_order(
    State(s): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ProcessMultiItem>,
) -> Result<Json<Value>> {
    let order = s.multi_items.process(id, req).await?;
    Ok(Json(json!({ "success": true, "order": order })))
}
