//! Cron-driven sync from the Selling Partner API.
//!
//! An order run pulls orders created inside the channel's lookback window
//! for every configured seller account, inserts the ones not stored yet and
//! refreshes the shipment fields of stored orders whose status moved on.
//! Identity fields of stored orders are never rewritten, so a run can be
//! repeated on any schedule. Orders with more than one line item are queued
//! for manual handling.
//!
//! A refund run reads refund transactions from the Finances API and flags
//! the matching orders refunded, which closes the redemption gate for them.
//!
//! One failing account does not stop the others; a run only fails when
//! every account failed.

pub mod queue;
pub mod sp_api;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::aggregates::{AppealStatus, FulfillmentChannel, MultiItemOrder, MultiItemStatus, Order, OrderLine};
use crate::domain::events::{DomainEvent, SyncEvent};
use crate::domain::value_objects::MarketplaceOrderId;
use crate::effects::Effect;
use crate::store::{CatalogStore, CronLog, CronRun, ExistingOrder, FulfillmentUpdate, MultiItemStore, OrderStore};
use crate::{FulfillmentError, Result};

pub use queue::{MultiItemQueue, ProcessMultiItem};
pub use sp_api::{SpApiClient, SpApiCredentials};

pub const REFUND_JOB: &str = "sync-refunds";
const REFUND_LOOKBACK_DAYS: i64 = 60;
const REFUND_DETAIL_LIMIT: usize = 20;
const ACCOUNT_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum MarketplaceError {
    #[error("marketplace API timed out")]
    Timeout,
    #[error("marketplace authentication failed with HTTP {0}")]
    Auth(u16),
    #[error("marketplace API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("marketplace request failed: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for MarketplaceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() { Self::Timeout } else { Self::Transport(e.to_string()) }
    }
}

impl From<MarketplaceError> for FulfillmentError {
    fn from(e: MarketplaceError) -> Self {
        match e {
            MarketplaceError::Timeout => Self::Timeout("marketplace API".into()),
            other => Self::Upstream(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MarketplaceOrder {
    pub amazon_order_id: String,
    pub order_status: Option<String>,
    pub purchase_date: Option<DateTime<Utc>>,
    pub last_update_date: Option<DateTime<Utc>>,
    pub order_total: Option<Money>,
    pub buyer_info: Option<BuyerInfo>,
    pub shipping_address: Option<ShippingAddress>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Money {
    pub amount: String,
    pub currency_code: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BuyerInfo {
    pub buyer_email: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShippingAddress {
    pub city: Option<String>,
    pub state_or_region: Option<String>,
    pub postal_code: Option<String>,
    pub country_code: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderItem {
    #[serde(rename = "ASIN")]
    pub asin: Option<String>,
    #[serde(rename = "SellerSKU")]
    pub seller_sku: Option<String>,
    pub title: Option<String>,
    pub quantity_ordered: Option<i32>,
    pub item_price: Option<Money>,
}

/// A refund posted against a marketplace order.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundEvent {
    pub order_id: String,
    pub refund_id: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub amount: Option<Decimal>,
}

#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    async fn access_token(&self) -> std::result::Result<String, MarketplaceError>;

    /// All orders created after `created_after`, following pagination.
    async fn list_orders(
        &self,
        channel: FulfillmentChannel,
        created_after: DateTime<Utc>,
    ) -> std::result::Result<Vec<MarketplaceOrder>, MarketplaceError>;

    async fn order_items(&self, order_id: &str) -> std::result::Result<Vec<OrderItem>, MarketplaceError>;

    /// Refund transactions posted after `posted_after`, following pagination.
    async fn refund_events(&self, posted_after: DateTime<Utc>) -> std::result::Result<Vec<RefundEvent>, MarketplaceError>;
}

/// One seller account and the API client holding its credentials.
#[derive(Clone)]
pub struct SellerAccount {
    pub name: String,
    pub api: Arc<dyn MarketplaceApi>,
}

impl SellerAccount {
    pub fn new(name: impl Into<String>, api: Arc<dyn MarketplaceApi>) -> Self {
        Self { name: name.into(), api }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountReport {
    pub account: String,
    pub fetched: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub multi_item_orders: Vec<String>,
    pub accounts: Vec<AccountReport>,
    pub duration_ms: i64,
}

impl SyncReport {
    fn absorb(&mut self, other: SyncReport) {
        self.fetched += other.fetched;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.multi_item_orders.extend(other.multi_item_orders);
    }
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundReport {
    pub refund_events: usize,
    pub unique_orders: usize,
    pub orders_refunded: usize,
    /// First refunds that changed an order, for the response body.
    pub refunded: Vec<RefundEvent>,
    pub accounts: Vec<AccountReport>,
    pub duration_ms: i64,
}

pub struct OrderSync {
    accounts: Vec<SellerAccount>,
    orders: Arc<dyn OrderStore>,
    catalog: Arc<dyn CatalogStore>,
    multi_items: Arc<dyn MultiItemStore>,
    cron: Arc<dyn CronLog>,
    clock: Arc<dyn Clock>,
}

impl OrderSync {
    pub fn new(
        accounts: Vec<SellerAccount>,
        orders: Arc<dyn OrderStore>,
        catalog: Arc<dyn CatalogStore>,
        multi_items: Arc<dyn MultiItemStore>,
        cron: Arc<dyn CronLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { accounts, orders, catalog, multi_items, cron, clock }
    }

    /// Runs one order sync pass for a channel and records it in the cron log.
    pub async fn run(&self, channel: FulfillmentChannel) -> Result<(SyncReport, Vec<Effect>)> {
        let started_at = self.clock.now();
        let timer = std::time::Instant::now();
        let result = self.sync_all(channel, started_at).await;
        let duration_ms = timer.elapsed().as_millis() as i64;
        let logged = result.as_ref().map(|r| ((r.inserted + r.updated) as i64, r.accounts.as_slice()));
        self.log_run(job_name(channel), started_at, duration_ms, logged).await;

        let mut report = result.map_err(|e| {
            tracing::error!(channel = channel.as_str(), error = %e, "order sync failed");
            e
        })?;
        report.duration_ms = duration_ms;
        tracing::info!(
            channel = channel.as_str(),
            accounts = report.accounts.len(),
            fetched = report.fetched,
            inserted = report.inserted,
            updated = report.updated,
            duration_ms,
            "order sync finished"
        );
        let event = DomainEvent::Sync(SyncEvent::OrdersSynced { channel, inserted: report.inserted, updated: report.updated });
        Ok((report, vec![Effect::Publish(event)]))
    }

    /// Flags orders refunded from the Finances API and records the run.
    pub async fn run_refunds(&self) -> Result<(RefundReport, Vec<Effect>)> {
        let started_at = self.clock.now();
        let timer = std::time::Instant::now();
        let result = self.sync_refunds(started_at).await;
        let duration_ms = timer.elapsed().as_millis() as i64;
        let logged = result.as_ref().map(|r| (r.orders_refunded as i64, r.accounts.as_slice()));
        self.log_run(REFUND_JOB, started_at, duration_ms, logged).await;

        let mut report = result.map_err(|e| {
            tracing::error!(error = %e, "refund sync failed");
            e
        })?;
        report.duration_ms = duration_ms;
        tracing::info!(
            refund_events = report.refund_events,
            unique_orders = report.unique_orders,
            orders_refunded = report.orders_refunded,
            duration_ms,
            "refund sync finished"
        );
        let event = DomainEvent::Sync(SyncEvent::RefundsSynced { orders_refunded: report.orders_refunded });
        Ok((report, vec![Effect::Publish(event)]))
    }

    async fn log_run(
        &self,
        job_name: &str,
        started_at: DateTime<Utc>,
        duration_ms: i64,
        outcome: std::result::Result<(i64, &[AccountReport]), &FulfillmentError>,
    ) {
        let (status, records_processed, error_message) = match outcome {
            Ok((records, accounts)) => {
                let failed: Vec<String> = accounts
                    .iter()
                    .filter_map(|a| a.error.as_ref().map(|e| format!("{}: {e}", a.account)))
                    .collect();
                ("success", records, (!failed.is_empty()).then(|| failed.join("; ")))
            }
            Err(e) => ("error", 0, Some(e.to_string())),
        };
        let run = CronRun {
            id: Uuid::now_v7(),
            job_name: job_name.to_string(),
            status,
            started_at,
            duration_ms,
            records_processed,
            error_message,
        };
        if let Err(e) = self.cron.record_cron_run(&run).await {
            tracing::error!(job = %run.job_name, error = %e, "cron log write failed");
        }
    }

    async fn sync_all(&self, channel: FulfillmentChannel, now: DateTime<Utc>) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut first_error = None;
        for (i, account) in self.accounts.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(ACCOUNT_PAUSE).await;
            }
            match self.sync_account(account, channel, now).await {
                Ok(partial) => {
                    report.accounts.push(AccountReport { account: account.name.clone(), fetched: partial.fetched, error: None });
                    report.absorb(partial);
                }
                Err(e) => {
                    tracing::error!(account = %account.name, channel = channel.as_str(), error = %e, "seller account sync failed");
                    report.accounts.push(AccountReport { account: account.name.clone(), fetched: 0, error: Some(e.to_string()) });
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if report.accounts.iter().all(|a| a.error.is_some()) => Err(e),
            _ => Ok(report),
        }
    }

    async fn sync_account(&self, account: &SellerAccount, channel: FulfillmentChannel, now: DateTime<Utc>) -> Result<SyncReport> {
        let fetched = account.api.list_orders(channel, now - channel.lookback()).await?;
        let mut report = SyncReport { fetched: fetched.len(), ..SyncReport::default() };

        let mut seen = HashSet::new();
        let batch: Vec<MarketplaceOrder> = fetched
            .into_iter()
            .filter(|o| match MarketplaceOrderId::new(o.amazon_order_id.as_str()) {
                Ok(_) => seen.insert(o.amazon_order_id.trim().to_string()),
                Err(e) => {
                    tracing::warn!(order_id = %o.amazon_order_id, error = %e, "skipping order with unrecognised id");
                    false
                }
            })
            .collect();
        if batch.is_empty() {
            return Ok(report);
        }

        let ids: Vec<String> = batch.iter().map(|o| o.amazon_order_id.trim().to_string()).collect();
        let existing: HashMap<String, ExistingOrder> =
            self.orders.existing_orders(&ids).await?.into_iter().map(|e| (e.order_id.clone(), e)).collect();

        let mut fresh = Vec::new();
        for order in &batch {
            match existing.get(order.amazon_order_id.trim()) {
                Some(stored) => match refresh_for(stored, order, now) {
                    Some(update) => {
                        if self.orders.refresh_fulfillment(&update).await? {
                            report.updated += 1;
                        }
                    }
                    None => report.skipped += 1,
                },
                None => fresh.push(order),
            }
        }

        let mut items_by_order = Vec::with_capacity(fresh.len());
        let mut asins = Vec::new();
        for order in fresh {
            let items = match account.api.order_items(order.amazon_order_id.trim()).await {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(order_id = %order.amazon_order_id, error = %e, "order items unavailable");
                    Vec::new()
                }
            };
            if items.len() > 1 {
                tracing::info!(order_id = %order.amazon_order_id, items = items.len(), "multi-item order needs manual handling");
                report.multi_item_orders.push(order.amazon_order_id.trim().to_string());
            }
            asins.extend(items.iter().filter_map(|i| i.asin.clone()));
            items_by_order.push((order, items));
        }

        let mapping = self.catalog.asin_mappings(&asins).await?;
        let queued: Vec<MultiItemOrder> = items_by_order
            .iter()
            .filter(|(_, items)| items.len() > 1)
            .map(|(order, items)| multi_item_order(order, items, &mapping, &account.name, channel, now))
            .collect();
        if !queued.is_empty() {
            self.multi_items.record_multi_item_orders(&queued).await?;
        }

        let rows = items_by_order
            .into_iter()
            .map(|(order, items)| new_order(order, items.first(), &mapping, channel, now))
            .collect::<Result<Vec<_>>>()?;
        report.inserted = self.orders.insert_orders(&rows).await?;
        Ok(report)
    }

    async fn sync_refunds(&self, now: DateTime<Utc>) -> Result<RefundReport> {
        let since = now - chrono::Duration::days(REFUND_LOOKBACK_DAYS);
        let mut report = RefundReport::default();
        let mut events = Vec::new();
        let mut first_error = None;
        for (i, account) in self.accounts.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(ACCOUNT_PAUSE).await;
            }
            match account.api.refund_events(since).await {
                Ok(found) => {
                    report.accounts.push(AccountReport { account: account.name.clone(), fetched: found.len(), error: None });
                    events.extend(found);
                }
                Err(e) => {
                    tracing::error!(account = %account.name, error = %e, "refund fetch failed");
                    report.accounts.push(AccountReport { account: account.name.clone(), fetched: 0, error: Some(e.to_string()) });
                    first_error.get_or_insert(FulfillmentError::from(e));
                }
            }
        }
        if let Some(e) = first_error {
            if report.accounts.iter().all(|a| a.error.is_some()) {
                return Err(e);
            }
        }

        report.refund_events = events.len();
        let mut seen = HashSet::new();
        let ids: Vec<String> = events
            .iter()
            .map(|e| e.order_id.trim().to_string())
            .filter(|id| MarketplaceOrderId::new(id.as_str()).is_ok() && seen.insert(id.clone()))
            .collect();
        report.unique_orders = ids.len();
        if ids.is_empty() {
            return Ok(report);
        }

        let marked = self.orders.mark_refunded(&ids, now).await?;
        for id in &marked {
            tracing::info!(order_id = %id, "order marked refunded");
        }
        report.orders_refunded = marked.len();
        report.refunded = marked
            .iter()
            .filter_map(|id| events.iter().find(|e| e.order_id.trim() == id.as_str()))
            .take(REFUND_DETAIL_LIMIT)
            .cloned()
            .collect();
        Ok(report)
    }
}

pub fn job_name(channel: FulfillmentChannel) -> &'static str {
    match channel { FulfillmentChannel::Merchant => "sync-mfn", FulfillmentChannel::Marketplace => "sync-fba" }
}

fn shipped_at(order: &MarketplaceOrder, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    (order.order_status.as_deref() == Some("Shipped")).then(|| order.last_update_date.unwrap_or(now))
}

/// Update for a stored order whose upstream state moved on, if any.
fn refresh_for(stored: &ExistingOrder, upstream: &MarketplaceOrder, now: DateTime<Utc>) -> Option<FulfillmentUpdate> {
    let status = upstream.order_status.as_deref().unwrap_or("Pending");
    let stored_pending = stored.fulfillment_status.as_deref().map_or(true, |s| s == "Pending");
    let address = upstream.shipping_address.as_ref();
    let upstream_state = address.and_then(|a| a.state_or_region.clone());

    let status_moved = stored_pending && status != "Pending";
    let needs_shipped_at = status == "Shipped" && stored.shipped_at.is_none();
    let needs_state = stored.state.is_none() && upstream_state.is_some();
    if !(status_moved || needs_shipped_at || needs_state) {
        return None;
    }
    Some(FulfillmentUpdate {
        order_id: stored.order_id.clone(),
        fulfillment_status: status.to_string(),
        shipped_at: shipped_at(upstream, now),
        city: address.and_then(|a| a.city.clone()),
        state: upstream_state,
        postal_code: address.and_then(|a| a.postal_code.clone()),
        updated_at: now,
    })
}

/// Catalog identifier for a line: the ASIN mapping, else the seller SKU.
fn item_fsn(item: &OrderItem, mapping: &HashMap<String, String>) -> Option<String> {
    item.asin.as_ref().and_then(|asin| mapping.get(asin).cloned()).or_else(|| item.seller_sku.clone())
}

fn order_total(order: &MarketplaceOrder) -> (Option<Decimal>, String) {
    let amount = order.order_total.as_ref().and_then(|t| Decimal::from_str(&t.amount).ok());
    let currency = order.order_total.as_ref().and_then(|t| t.currency_code.clone()).unwrap_or_else(|| "INR".into());
    (amount, currency)
}

fn multi_item_order(
    order: &MarketplaceOrder,
    items: &[OrderItem],
    mapping: &HashMap<String, String>,
    account: &str,
    channel: FulfillmentChannel,
    now: DateTime<Utc>,
) -> MultiItemOrder {
    let lines = items
        .iter()
        .map(|item| OrderLine {
            asin: item.asin.clone(),
            sku: item.seller_sku.clone(),
            fsn: item_fsn(item, mapping),
            title: item.title.clone(),
            quantity: item.quantity_ordered,
            price: item.item_price.as_ref().map(|p| p.amount.clone()),
        })
        .collect();
    let (total_amount, currency) = order_total(order);
    MultiItemOrder {
        id: Uuid::now_v7(),
        order_id: order.amazon_order_id.trim().to_string(),
        seller_account: account.to_string(),
        order_date: order.purchase_date,
        buyer_email: order.buyer_info.as_ref().and_then(|b| b.buyer_email.clone()),
        items: lines,
        item_count: i32::try_from(items.len()).unwrap_or(i32::MAX),
        total_amount,
        currency,
        fulfillment_channel: channel,
        status: MultiItemStatus::Pending,
        admin_notes: None,
        processed_at: None,
        created_at: now,
    }
}

fn new_order(
    order: &MarketplaceOrder,
    first_item: Option<&OrderItem>,
    mapping: &HashMap<String, String>,
    channel: FulfillmentChannel,
    now: DateTime<Utc>,
) -> Result<Order> {
    let fsn = first_item.and_then(|item| item_fsn(item, mapping));
    let address = order.shipping_address.clone().unwrap_or_default();
    let (order_total, currency) = order_total(order);
    Ok(Order {
        id: Uuid::now_v7(),
        order_id: MarketplaceOrderId::new(order.amazon_order_id.as_str())?,
        fulfillment_channel: channel,
        fulfillment_status: Some(order.order_status.clone().unwrap_or_else(|| "Pending".into())),
        fsn,
        quantity: first_item.and_then(|i| i.quantity_ordered).unwrap_or(1).max(1),
        order_total,
        currency,
        buyer_email: order.buyer_info.as_ref().and_then(|b| b.buyer_email.clone()),
        city: address.city,
        state: address.state_or_region,
        postal_code: address.postal_code,
        country: Some(address.country_code.unwrap_or_else(|| "IN".into())),
        order_date: order.purchase_date,
        synced_at: Some(now),
        shipped_at: shipped_at(order, now),
        early_appeal_status: AppealStatus::None,
        early_appeal_at: None,
        is_refunded: false,
        license_key_id: None,
        getcid_used_count: 0,
        getcid_used: false,
        warranty_status: "PENDING".into(),
        created_at: now,
        updated_at: now,
    })
}
