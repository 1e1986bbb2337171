//! In-memory store, used by tests and local development.
//!
//! All collections sit behind one lock so every trait method is atomic with
//! respect to every other, which mirrors the transactional guarantees of the
//! Postgres implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::*;
use crate::domain::aggregates::select_token;

#[derive(Debug, Default)]
struct Inner {
    orders: HashMap<String, Order>,
    appeals: Vec<EarlyAppeal>,
    delays: Vec<StateDelayEntry>,
    tokens: Vec<GetCidToken>,
    usage: Vec<GetCidUsage>,
    keys: Vec<LicenseKey>,
    redemptions: Vec<RedemptionRecord>,
    asin_map: HashMap<String, String>,
    cron_runs: Vec<CronRun>,
    multi_items: Vec<MultiItemOrder>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_audit_writes: AtomicBool,
    delay_reads: std::sync::atomic::AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub async fn seed_order(&self, order: Order) {
        self.inner.lock().await.orders.insert(order.order_id.to_string(), order);
    }

    pub async fn seed_key(&self, key: LicenseKey) { self.inner.lock().await.keys.push(key); }

    pub async fn free_keys(&self, sku: &str) -> usize {
        self.inner.lock().await.keys.iter().filter(|k| !k.is_assigned && k.sku == sku).count()
    }

    pub async fn seed_asin(&self, asin: &str, fsn: &str) {
        self.inner.lock().await.asin_map.insert(asin.to_string(), fsn.to_string());
    }

    pub async fn order_count(&self) -> usize { self.inner.lock().await.orders.len() }

    pub async fn usage_log(&self) -> Vec<GetCidUsage> { self.inner.lock().await.usage.clone() }

    pub async fn redemptions(&self) -> Vec<RedemptionRecord> { self.inner.lock().await.redemptions.clone() }

    pub async fn cron_runs(&self) -> Vec<CronRun> { self.inner.lock().await.cron_runs.clone() }

    pub async fn multi_item_orders(&self) -> Vec<MultiItemOrder> { self.inner.lock().await.multi_items.clone() }

    pub async fn appeals_for(&self, order_id: &str) -> Vec<EarlyAppeal> {
        self.inner.lock().await.appeals.iter().filter(|a| a.order_id.as_str() == order_id).cloned().collect()
    }

    /// Makes audit-style appends (usage log, redemption log) fail.
    pub fn fail_audit_writes(&self, fail: bool) { self.fail_audit_writes.store(fail, Ordering::SeqCst); }

    /// Number of full state-delay table reads served so far.
    pub fn state_delay_reads(&self) -> usize { self.delay_reads.load(Ordering::SeqCst) }

    fn check_audit(&self) -> StoreResult<()> {
        if self.fail_audit_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("audit writes disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn find_order(&self, order_id: &str) -> StoreResult<Option<Order>> {
        Ok(self.inner.lock().await.orders.get(order_id.trim()).cloned())
    }

    async fn existing_orders(&self, order_ids: &[String]) -> StoreResult<Vec<ExistingOrder>> {
        let inner = self.inner.lock().await;
        Ok(order_ids
            .iter()
            .filter_map(|id| inner.orders.get(id))
            .map(|o| ExistingOrder {
                order_id: o.order_id.to_string(),
                fulfillment_status: o.fulfillment_status.clone(),
                shipped_at: o.shipped_at,
                state: o.state.clone(),
            })
            .collect())
    }

    async fn insert_orders(&self, orders: &[Order]) -> StoreResult<usize> {
        let mut inner = self.inner.lock().await;
        let mut inserted = 0;
        for order in orders {
            let key = order.order_id.to_string();
            if !inner.orders.contains_key(&key) {
                inner.orders.insert(key, order.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn refresh_fulfillment(&self, update: &FulfillmentUpdate) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(order) = inner.orders.get_mut(&update.order_id) else { return Ok(false) };
        order.fulfillment_status = Some(update.fulfillment_status.clone());
        if update.shipped_at.is_some() { order.shipped_at = update.shipped_at; }
        if update.state.is_some() {
            order.city = update.city.clone();
            order.state = update.state.clone();
            order.postal_code = update.postal_code.clone();
        }
        order.updated_at = update.updated_at;
        Ok(true)
    }

    async fn reserve_getcid_slot(&self, order_id: &str, cap: i32) -> StoreResult<Option<i32>> {
        let mut inner = self.inner.lock().await;
        let Some(order) = inner.orders.get_mut(order_id) else { return Ok(None) };
        if order.getcid_used_count >= cap { return Ok(None); }
        order.getcid_used_count += 1;
        order.getcid_used = order.getcid_used_count >= cap;
        Ok(Some(order.getcid_used_count))
    }

    async fn release_getcid_slot(&self, order_id: &str, cap: i32) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(order) = inner.orders.get_mut(order_id) {
            order.getcid_used_count = (order.getcid_used_count - 1).max(0);
            order.getcid_used = order.getcid_used_count >= cap;
        }
        Ok(())
    }

    async fn mark_refunded(&self, order_ids: &[String], at: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let mut marked = Vec::new();
        for id in order_ids {
            if let Some(order) = inner.orders.get_mut(id) {
                if !order.is_refunded {
                    order.is_refunded = true;
                    order.updated_at = at;
                    marked.push(id.clone());
                }
            }
        }
        Ok(marked)
    }
}

#[async_trait]
impl MultiItemStore for MemoryStore {
    async fn record_multi_item_orders(&self, orders: &[MultiItemOrder]) -> StoreResult<usize> {
        let mut inner = self.inner.lock().await;
        let mut recorded = 0;
        for order in orders {
            if !inner.multi_items.iter().any(|m| m.order_id == order.order_id) {
                inner.multi_items.push(order.clone());
                recorded += 1;
            }
        }
        Ok(recorded)
    }

    async fn list_multi_item_orders(
        &self,
        status: Option<MultiItemStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Page<MultiItemOrder>> {
        let inner = self.inner.lock().await;
        let mut matching: Vec<MultiItemOrder> =
            inner.multi_items.iter().filter(|m| status.map_or(true, |s| m.status == s)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = matching.len() as i64;
        let data = matching.into_iter().skip(offset.max(0) as usize).take(limit.max(0) as usize).collect();
        Ok(Page { data, total, limit, offset })
    }

    async fn process_multi_item_order(
        &self,
        id: Uuid,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<MultiItemOrder>> {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.multi_items.iter_mut().find(|m| m.id == id) else { return Ok(None) };
        if !entry.process(notes, at) {
            return Err(StoreError::Conflict(format!("multi-item order {id} is already processed")));
        }
        Ok(Some(entry.clone()))
    }
}

#[async_trait]
impl AppealStore for MemoryStore {
    async fn find_appeal(&self, id: Uuid) -> StoreResult<Option<EarlyAppeal>> {
        Ok(self.inner.lock().await.appeals.iter().find(|a| a.id == id).cloned())
    }

    async fn open_appeals_for_order(&self, order_id: &str) -> StoreResult<Vec<EarlyAppeal>> {
        let inner = self.inner.lock().await;
        Ok(inner.appeals.iter().filter(|a| a.order_id.as_str() == order_id && a.status.is_open()).cloned().collect())
    }

    async fn latest_appeal(&self, order_id: &str) -> StoreResult<Option<EarlyAppeal>> {
        let inner = self.inner.lock().await;
        Ok(inner.appeals.iter().filter(|a| a.order_id.as_str() == order_id).max_by_key(|a| (a.created_at, a.id)).cloned())
    }

    async fn list_appeals(&self, filter: &AppealFilter) -> StoreResult<Page<EarlyAppeal>> {
        let inner = self.inner.lock().await;
        let mut matching: Vec<EarlyAppeal> = inner
            .appeals
            .iter()
            .filter(|a| filter.status.map_or(true, |s| a.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = matching.len() as i64;
        let data = matching.into_iter().skip(filter.offset.max(0) as usize).take(filter.limit.max(0) as usize).collect();
        Ok(Page { data, total, limit: filter.limit, offset: filter.offset })
    }

    async fn open_appeal(&self, appeal: &EarlyAppeal) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let key = appeal.order_id.as_str();
        if inner.appeals.iter().any(|a| a.order_id.as_str() == key && a.status.is_open()) {
            return Err(StoreError::Conflict(format!("order {key} already has an open appeal")));
        }
        let order = inner
            .orders
            .get_mut(key)
            .ok_or_else(|| StoreError::Conflict(format!("order {key} does not exist")))?;
        if order.early_appeal_status.is_open() {
            return Err(StoreError::Conflict(format!("order {key} already has an open appeal")));
        }
        order.early_appeal_status = AppealStatus::Pending;
        order.early_appeal_at = Some(appeal.created_at);
        inner.appeals.push(appeal.clone());
        Ok(())
    }

    async fn record_resolution(&self, appeal: &EarlyAppeal) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .appeals
            .iter_mut()
            .find(|a| a.id == appeal.id && a.status == AppealStatus::Pending)
            .ok_or_else(|| StoreError::Conflict(format!("appeal {} is no longer pending", appeal.id)))?;
        *stored = appeal.clone();
        if let Some(order) = inner.orders.get_mut(appeal.order_id.as_str()) {
            order.early_appeal_status = appeal.status;
        }
        Ok(())
    }
}

#[async_trait]
impl StateDelayStore for MemoryStore {
    async fn list_state_delays(&self) -> StoreResult<Vec<StateDelayEntry>> {
        self.delay_reads.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.inner.lock().await.delays.clone();
        rows.sort_by(|a, b| a.state_name.as_str().cmp(b.state_name.as_str()));
        Ok(rows)
    }

    async fn insert_state_delay(&self, entry: &StateDelayEntry) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.delays.iter().any(|d| d.state_name == entry.state_name) {
            return Err(StoreError::Conflict(format!("state {} already exists", entry.state_name)));
        }
        inner.delays.push(entry.clone());
        Ok(())
    }

    async fn update_state_delay(
        &self,
        id: Uuid,
        state_name: Option<&RegionKey>,
        delay_hours: DelayHours,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<StateDelayEntry>> {
        let mut inner = self.inner.lock().await;
        if let Some(name) = state_name {
            if inner.delays.iter().any(|d| d.id != id && &d.state_name == name) {
                return Err(StoreError::Conflict(format!("state {name} already exists")));
            }
        }
        let Some(entry) = inner.delays.iter_mut().find(|d| d.id == id) else { return Ok(None) };
        if let Some(name) = state_name { entry.state_name = name.clone(); }
        entry.delay_hours = delay_hours;
        entry.updated_at = at;
        Ok(Some(entry.clone()))
    }

    async fn delete_state_delay(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.delays.len();
        inner.delays.retain(|d| d.id != id);
        Ok(inner.delays.len() != before)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn list_tokens(&self) -> StoreResult<Vec<GetCidToken>> {
        let mut tokens = self.inner.lock().await.tokens.clone();
        tokens.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(tokens)
    }

    async fn find_token(&self, id: Uuid) -> StoreResult<Option<GetCidToken>> {
        Ok(self.inner.lock().await.tokens.iter().find(|t| t.id == id).cloned())
    }

    async fn max_priority(&self) -> StoreResult<Option<i32>> {
        Ok(self.inner.lock().await.tokens.iter().map(|t| t.priority).max())
    }

    async fn upsert_token(&self, token: &GetCidToken) -> StoreResult<GetCidToken> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.tokens.iter_mut().find(|t| t.token == token.token) {
            existing.email = token.email.clone();
            existing.count_used = token.count_used;
            existing.total_available = token.total_available;
            existing.priority = token.priority;
            existing.is_active = token.is_active;
            existing.last_verified_at = token.last_verified_at;
            existing.updated_at = token.updated_at;
            return Ok(existing.clone());
        }
        inner.tokens.push(token.clone());
        Ok(token.clone())
    }

    async fn update_token_settings(
        &self,
        id: Uuid,
        is_active: Option<bool>,
        priority: Option<i32>,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<GetCidToken>> {
        let mut inner = self.inner.lock().await;
        let Some(token) = inner.tokens.iter_mut().find(|t| t.id == id) else { return Ok(None) };
        if let Some(active) = is_active { token.is_active = active; }
        if let Some(priority) = priority { token.priority = priority; }
        token.updated_at = at;
        Ok(Some(token.clone()))
    }

    async fn overwrite_usage(&self, id: Uuid, usage: &TokenUsage, at: DateTime<Utc>) -> StoreResult<Option<GetCidToken>> {
        let mut inner = self.inner.lock().await;
        let Some(token) = inner.tokens.iter_mut().find(|t| t.id == id) else { return Ok(None) };
        token.count_used = usage.count_used;
        token.total_available = usage.total_available;
        if usage.email.is_some() { token.email = usage.email.clone(); }
        token.last_verified_at = Some(at);
        token.updated_at = at;
        Ok(Some(token.clone()))
    }

    async fn reserve_token(&self) -> StoreResult<Option<GetCidToken>> {
        let mut inner = self.inner.lock().await;
        let Some(id) = select_token(&inner.tokens).map(|t| t.id) else { return Ok(None) };
        let token = inner
            .tokens
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| StoreError::Corrupt(format!("token {id} vanished")))?;
        token.count_used += 1;
        Ok(Some(token.clone()))
    }

    async fn release_token(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(token) = inner.tokens.iter_mut().find(|t| t.id == id) {
            token.count_used = (token.count_used - 1).max(0);
        }
        Ok(())
    }

    async fn delete_token(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.tokens.len();
        inner.tokens.retain(|t| t.id != id);
        Ok(inner.tokens.len() != before)
    }
}

#[async_trait]
impl UsageLog for MemoryStore {
    async fn append_usage(&self, usage: &GetCidUsage) -> StoreResult<()> {
        self.check_audit()?;
        self.inner.lock().await.usage.push(usage.clone());
        Ok(())
    }
}

#[async_trait]
impl LicenseKeyStore for MemoryStore {
    async fn find_key(&self, id: Uuid) -> StoreResult<Option<LicenseKey>> {
        Ok(self.inner.lock().await.keys.iter().find(|k| k.id == id).cloned())
    }

    async fn claim_key(&self, sku: &str, order_id: &str, at: DateTime<Utc>) -> StoreResult<KeyClaim> {
        let mut inner = self.inner.lock().await;
        let linked = inner
            .orders
            .get(order_id)
            .ok_or_else(|| StoreError::Conflict(format!("order {order_id} does not exist")))?
            .license_key_id;
        if let Some(key_id) = linked {
            let key = inner
                .keys
                .iter()
                .find(|k| k.id == key_id)
                .cloned()
                .ok_or_else(|| StoreError::Corrupt(format!("order {order_id} links missing key {key_id}")))?;
            return Ok(KeyClaim::AlreadyLinked(key));
        }
        let Some(key) = inner.keys.iter_mut().find(|k| !k.is_assigned && k.order_id.is_none() && k.sku == sku) else {
            return Ok(KeyClaim::PoolEmpty);
        };
        key.is_assigned = true;
        key.order_id = Some(order_id.to_string());
        key.assigned_at = Some(at);
        let claimed = key.clone();
        if let Some(order) = inner.orders.get_mut(order_id) {
            order.license_key_id = Some(claimed.id);
        }
        Ok(KeyClaim::Claimed(claimed))
    }

    async fn append_redemption(&self, record: &RedemptionRecord) -> StoreResult<()> {
        self.check_audit()?;
        self.inner.lock().await.redemptions.push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn asin_mappings(&self, asins: &[String]) -> StoreResult<HashMap<String, String>> {
        let inner = self.inner.lock().await;
        Ok(asins.iter().filter_map(|a| inner.asin_map.get(a).map(|f| (a.clone(), f.clone()))).collect())
    }
}

#[async_trait]
impl CronLog for MemoryStore {
    async fn record_cron_run(&self, run: &CronRun) -> StoreResult<()> {
        self.inner.lock().await.cron_runs.push(run.clone());
        Ok(())
    }
}
