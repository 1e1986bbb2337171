//! Persistence contracts.
//!
//! Every component talks to storage through the traits below. `PgStore`
//! backs the running service; `MemoryStore` backs tests and local runs. The
//! counter and appeal operations are atomic in both implementations.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::aggregates::{
    AppealStatus, EarlyAppeal, GetCidToken, LicenseKey, MultiItemOrder, MultiItemStatus, Order, StateDelayEntry,
    TokenUsage,
};
use crate::domain::value_objects::{DelayHours, RegionKey};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Clone, Debug, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Fields of an already stored order that the sync job may refresh.
#[derive(Clone, Debug)]
pub struct ExistingOrder {
    pub order_id: String,
    pub fulfillment_status: Option<String>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub state: Option<String>,
}

/// Non-identity fields refreshed on an existing order.
#[derive(Clone, Debug)]
pub struct FulfillmentUpdate {
    pub order_id: String,
    pub fulfillment_status: String,
    pub shipped_at: Option<DateTime<Utc>>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct AppealFilter {
    pub status: Option<AppealStatus>,
    pub limit: i64,
    pub offset: i64,
}

/// One row of the append-only confirmation-id audit log.
#[derive(Clone, Debug, Serialize)]
pub struct GetCidUsage {
    pub id: Uuid,
    pub identifier: String,
    pub identifier_type: &'static str,
    pub installation_id: String,
    pub confirmation_id: Option<String>,
    pub api_response: String,
    pub api_status: String,
    pub token_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RedemptionRecord {
    pub id: Uuid,
    pub order_id: String,
    pub license_key_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub enum KeyClaim {
    Claimed(LicenseKey),
    AlreadyLinked(LicenseKey),
    PoolEmpty,
}

#[derive(Clone, Debug, Serialize)]
pub struct CronRun {
    pub id: Uuid,
    pub job_name: String,
    pub status: &'static str,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub records_processed: i64,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_order(&self, order_id: &str) -> StoreResult<Option<Order>>;

    async fn existing_orders(&self, order_ids: &[String]) -> StoreResult<Vec<ExistingOrder>>;

    /// Inserts new orders, skipping any whose `order_id` is already stored.
    /// Returns how many rows were written.
    async fn insert_orders(&self, orders: &[Order]) -> StoreResult<usize>;

    async fn refresh_fulfillment(&self, update: &FulfillmentUpdate) -> StoreResult<bool>;

    /// Takes one confirmation-id slot if `getcid_used_count < cap`, returning
    /// the new count. `None` means the quota is already used up.
    async fn reserve_getcid_slot(&self, order_id: &str, cap: i32) -> StoreResult<Option<i32>>;

    /// Gives back a slot taken by `reserve_getcid_slot`.
    async fn release_getcid_slot(&self, order_id: &str, cap: i32) -> StoreResult<()>;

    /// Flags stored orders as refunded. Returns the ids that were not flagged
    /// before; unknown ids are ignored.
    async fn mark_refunded(&self, order_ids: &[String], at: DateTime<Utc>) -> StoreResult<Vec<String>>;
}

#[async_trait]
pub trait MultiItemStore: Send + Sync {
    /// Queues orders for manual handling, skipping order ids already queued.
    async fn record_multi_item_orders(&self, orders: &[MultiItemOrder]) -> StoreResult<usize>;

    /// Newest first.
    async fn list_multi_item_orders(
        &self,
        status: Option<MultiItemStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Page<MultiItemOrder>>;

    /// Marks a pending entry processed. `Conflict` if it was processed already.
    async fn process_multi_item_order(
        &self,
        id: Uuid,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<MultiItemOrder>>;
}

#[async_trait]
pub trait AppealStore: Send + Sync {
    async fn find_appeal(&self, id: Uuid) -> StoreResult<Option<EarlyAppeal>>;

    /// Pending or approved appeal records for the order.
    async fn open_appeals_for_order(&self, order_id: &str) -> StoreResult<Vec<EarlyAppeal>>;

    async fn latest_appeal(&self, order_id: &str) -> StoreResult<Option<EarlyAppeal>>;

    async fn list_appeals(&self, filter: &AppealFilter) -> StoreResult<Page<EarlyAppeal>>;

    /// Inserts a pending appeal and marks the order pending as one unit.
    /// Fails with `Conflict` if the order already has an open appeal.
    async fn open_appeal(&self, appeal: &EarlyAppeal) -> StoreResult<()>;

    /// Stores a resolved appeal and mirrors its status onto the order, only if
    /// the stored appeal is still pending. Fails with `Conflict` otherwise.
    async fn record_resolution(&self, appeal: &EarlyAppeal) -> StoreResult<()>;
}

#[async_trait]
pub trait StateDelayStore: Send + Sync {
    async fn list_state_delays(&self) -> StoreResult<Vec<StateDelayEntry>>;

    /// `Conflict` when the region already exists.
    async fn insert_state_delay(&self, entry: &StateDelayEntry) -> StoreResult<()>;

    /// `Conflict` when a rename collides with another region.
    async fn update_state_delay(
        &self,
        id: Uuid,
        state_name: Option<&RegionKey>,
        delay_hours: DelayHours,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<StateDelayEntry>>;

    async fn delete_state_delay(&self, id: Uuid) -> StoreResult<bool>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Ordered by priority, highest first.
    async fn list_tokens(&self) -> StoreResult<Vec<GetCidToken>>;

    async fn find_token(&self, id: Uuid) -> StoreResult<Option<GetCidToken>>;

    async fn max_priority(&self) -> StoreResult<Option<i32>>;

    /// Inserts the token, or refreshes counters, priority and active flag of
    /// an existing row with the same token string.
    async fn upsert_token(&self, token: &GetCidToken) -> StoreResult<GetCidToken>;

    async fn update_token_settings(
        &self,
        id: Uuid,
        is_active: Option<bool>,
        priority: Option<i32>,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<GetCidToken>>;

    async fn overwrite_usage(&self, id: Uuid, usage: &TokenUsage, at: DateTime<Utc>) -> StoreResult<Option<GetCidToken>>;

    /// Selects the best token and takes one unit of its capacity in a single
    /// atomic step. `None` when no active token has capacity left.
    async fn reserve_token(&self) -> StoreResult<Option<GetCidToken>>;

    async fn release_token(&self, id: Uuid) -> StoreResult<()>;

    async fn delete_token(&self, id: Uuid) -> StoreResult<bool>;
}

#[async_trait]
pub trait UsageLog: Send + Sync {
    async fn append_usage(&self, usage: &GetCidUsage) -> StoreResult<()>;
}

#[async_trait]
pub trait LicenseKeyStore: Send + Sync {
    async fn find_key(&self, id: Uuid) -> StoreResult<Option<LicenseKey>>;

    /// Assigns a free key for `sku` to the order and links it on the order row,
    /// only while the order has no key linked. If another claim linked one
    /// first, the fresh claim is undone and the linked key is returned.
    async fn claim_key(&self, sku: &str, order_id: &str, at: DateTime<Utc>) -> StoreResult<KeyClaim>;

    async fn append_redemption(&self, record: &RedemptionRecord) -> StoreResult<()>;
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// ASIN to catalog identifier for the given ASINs that have a mapping.
    async fn asin_mappings(&self, asins: &[String]) -> StoreResult<HashMap<String, String>>;
}

#[async_trait]
pub trait CronLog: Send + Sync {
    async fn record_cron_run(&self, run: &CronRun) -> StoreResult<()>;
}

/// Everything the service needs from one backing store.
pub trait FulfillmentStore:
    OrderStore
    + AppealStore
    + StateDelayStore
    + TokenStore
    + UsageLog
    + LicenseKeyStore
    + CatalogStore
    + CronLog
    + MultiItemStore
{
}

impl<T> FulfillmentStore for T where
    T: OrderStore
        + AppealStore
        + StateDelayStore
        + TokenStore
        + UsageLog
        + LicenseKeyStore
        + CatalogStore
        + CronLog
        + MultiItemStore
{
}
