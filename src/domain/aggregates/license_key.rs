//! License Key

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LicenseKey {
    pub id: Uuid,
    pub license_key: String,
    pub sku: String,
    pub order_id: Option<String>,
    pub is_assigned: bool,
    pub assigned_at: Option<DateTime<Utc>>,
}
