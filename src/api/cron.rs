//! Cron-triggered jobs, behind the cron bearer guard.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use super::AppState;
use crate::domain::aggregates::FulfillmentChannel;
use crate::sync::OrderSync;
use crate::{FulfillmentError, Result};

pub async fn sync_fba(State(s): State<AppState>) -> Result<Json<Value>> {
    run_sync(&s, FulfillmentChannel::Marketplace).await
}

pub async fn sync_mfn(State(s): State<AppState>) -> Result<Json<Value>> {
    run_sync(&s, FulfillmentChannel::Merchant).await
}

pub async fn sync_refunds(State(s): State<AppState>) -> Result<Json<Value>> {
    let sync = configured(&s)?;
    let (report, effects) = sync.run_refunds().await?;
    s.effects.run(effects).await;
    Ok(Json(json!({ "success": true, "report": report })))
}

fn configured(s: &AppState) -> Result<&OrderSync> {
    s.sync.as_deref().ok_or_else(|| FulfillmentError::Unavailable("Order sync is not configured".into()))
}

async fn run_sync(s: &AppState, channel: FulfillmentChannel) -> Result<Json<Value>> {
    let sync = configured(s)?;
    let (report, effects) = sync.run(channel).await?;
    s.effects.run(effects).await;
    Ok(Json(json!({ "success": true, "channel": channel, "report": report })))
}
