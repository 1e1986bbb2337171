//! PostgreSQL store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use super::*;
use crate::domain::aggregates::{FulfillmentChannel, OrderLine};
use crate::domain::value_objects::MarketplaceOrderId;

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct PgStore { pool: PgPool }

impl PgStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }
    pub fn pool(&self) -> &PgPool { &self.pool }
}

fn conflict_on_unique(e: sqlx::Error, what: impl FnOnce() -> String) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => StoreError::Conflict(what()),
        _ => StoreError::Database(e),
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    order_id: String,
    fulfillment_type: String,
    fulfillment_status: Option<String>,
    fsn: Option<String>,
    quantity: i32,
    order_total: Option<Decimal>,
    currency: String,
    buyer_email: Option<String>,
    city: Option<String>,
    state: Option<String>,
    postal_code: Option<String>,
    country: Option<String>,
    order_date: Option<DateTime<Utc>>,
    synced_at: Option<DateTime<Utc>>,
    shipped_at: Option<DateTime<Utc>>,
    early_appeal_status: Option<String>,
    early_appeal_at: Option<DateTime<Utc>>,
    is_refunded: bool,
    license_key_id: Option<Uuid>,
    getcid_used_count: i32,
    getcid_used: bool,
    warranty_status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;
    fn try_from(r: OrderRow) -> Result<Self, Self::Error> {
        let order_id = MarketplaceOrderId::new(&r.order_id)
            .map_err(|e| StoreError::Corrupt(format!("order {}: {e}", r.order_id)))?;
        let fulfillment_channel = FulfillmentChannel::parse(&r.fulfillment_type)
            .ok_or_else(|| StoreError::Corrupt(format!("order {}: fulfillment_type {}", r.order_id, r.fulfillment_type)))?;
        Ok(Order {
            id: r.id, order_id, fulfillment_channel, fulfillment_status: r.fulfillment_status, fsn: r.fsn,
            quantity: r.quantity, order_total: r.order_total, currency: r.currency, buyer_email: r.buyer_email,
            city: r.city, state: r.state, postal_code: r.postal_code, country: r.country,
            order_date: r.order_date, synced_at: r.synced_at, shipped_at: r.shipped_at,
            early_appeal_status: AppealStatus::from_db(r.early_appeal_status.as_deref()),
            early_appeal_at: r.early_appeal_at, is_refunded: r.is_refunded, license_key_id: r.license_key_id,
            getcid_used_count: r.getcid_used_count, getcid_used: r.getcid_used,
            warranty_status: r.warranty_status, created_at: r.created_at, updated_at: r.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AppealRow {
    id: Uuid,
    order_id: String,
    customer_email: String,
    customer_whatsapp: String,
    proof_image_url: String,
    status: String,
    rejection_reason: Option<String>,
    admin_notes: Option<String>,
    reviewed_by: Option<String>,
    reviewed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AppealRow> for EarlyAppeal {
    type Error = StoreError;
    fn try_from(r: AppealRow) -> Result<Self, Self::Error> {
        let order_id = MarketplaceOrderId::new(&r.order_id)
            .map_err(|e| StoreError::Corrupt(format!("appeal {}: {e}", r.id)))?;
        let status = AppealStatus::from_db(Some(&r.status));
        if status == AppealStatus::None {
            return Err(StoreError::Corrupt(format!("appeal {}: status {}", r.id, r.status)));
        }
        Ok(EarlyAppeal {
            id: r.id, order_id, customer_email: r.customer_email, customer_whatsapp: r.customer_whatsapp,
            proof_image_url: r.proof_image_url, status, rejection_reason: r.rejection_reason,
            admin_notes: r.admin_notes, reviewed_by: r.reviewed_by, reviewed_at: r.reviewed_at, created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MultiItemRow {
    id: Uuid,
    order_id: String,
    seller_account: String,
    order_date: Option<DateTime<Utc>>,
    buyer_email: Option<String>,
    items: Json<Vec<OrderLine>>,
    item_count: i32,
    total_amount: Option<Decimal>,
    currency: String,
    fulfillment_type: String,
    status: String,
    admin_notes: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MultiItemRow> for MultiItemOrder {
    type Error = StoreError;
    fn try_from(r: MultiItemRow) -> Result<Self, Self::Error> {
        let fulfillment_channel = FulfillmentChannel::parse(&r.fulfillment_type)
            .ok_or_else(|| StoreError::Corrupt(format!("multi-item order {}: fulfillment_type {}", r.id, r.fulfillment_type)))?;
        let status = MultiItemStatus::from_db(&r.status)
            .ok_or_else(|| StoreError::Corrupt(format!("multi-item order {}: status {}", r.id, r.status)))?;
        Ok(MultiItemOrder {
            id: r.id, order_id: r.order_id, seller_account: r.seller_account, order_date: r.order_date,
            buyer_email: r.buyer_email, items: r.items.0, item_count: r.item_count, total_amount: r.total_amount,
            currency: r.currency, fulfillment_channel, status, admin_notes: r.admin_notes,
            processed_at: r.processed_at, created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StateDelayRow { id: Uuid, state_name: String, delay_hours: i32, created_at: DateTime<Utc>, updated_at: DateTime<Utc> }

impl TryFrom<StateDelayRow> for StateDelayEntry {
    type Error = StoreError;
    fn try_from(r: StateDelayRow) -> Result<Self, Self::Error> {
        let state_name = RegionKey::normalize(Some(&r.state_name))
            .ok_or_else(|| StoreError::Corrupt(format!("state delay {}: blank name", r.id)))?;
        Ok(StateDelayEntry {
            id: r.id, state_name, delay_hours: DelayHours::from_stored(r.delay_hours),
            created_at: r.created_at, updated_at: r.updated_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>> where T: TryFrom<R, Error = StoreError> {
    rows.into_iter().map(T::try_from).collect()
}

#[async_trait]
impl OrderStore for PgStore {
    async fn find_order(&self, order_id: &str) -> StoreResult<Option<Order>> {
        sqlx::query_as::<_, OrderRow>("SELECT * FROM amazon_orders WHERE order_id = $1")
            .bind(order_id.trim())
            .fetch_optional(&self.pool)
            .await?
            .map(Order::try_from)
            .transpose()
    }

    async fn existing_orders(&self, order_ids: &[String]) -> StoreResult<Vec<ExistingOrder>> {
        let rows: Vec<(String, Option<String>, Option<DateTime<Utc>>, Option<String>)> = sqlx::query_as(
            "SELECT order_id, fulfillment_status, shipped_at, state FROM amazon_orders WHERE order_id = ANY($1)",
        )
        .bind(order_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(order_id, fulfillment_status, shipped_at, state)| ExistingOrder { order_id, fulfillment_status, shipped_at, state })
            .collect())
    }

    async fn insert_orders(&self, orders: &[Order]) -> StoreResult<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for o in orders {
            let result = sqlx::query(
                "INSERT INTO amazon_orders (id, order_id, fulfillment_type, fulfillment_status, fsn, quantity, order_total, currency, \
                 buyer_email, city, state, postal_code, country, order_date, synced_at, shipped_at, is_refunded, \
                 getcid_used_count, getcid_used, warranty_status, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22) \
                 ON CONFLICT (order_id) DO NOTHING",
            )
            .bind(o.id).bind(o.order_id.as_str()).bind(o.fulfillment_channel.as_str()).bind(&o.fulfillment_status)
            .bind(&o.fsn).bind(o.quantity).bind(o.order_total).bind(&o.currency).bind(&o.buyer_email)
            .bind(&o.city).bind(&o.state).bind(&o.postal_code).bind(&o.country).bind(o.order_date)
            .bind(o.synced_at).bind(o.shipped_at).bind(o.is_refunded).bind(o.getcid_used_count).bind(o.getcid_used)
            .bind(&o.warranty_status).bind(o.created_at).bind(o.updated_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn refresh_fulfillment(&self, u: &FulfillmentUpdate) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE amazon_orders SET fulfillment_status = $2, shipped_at = COALESCE($3, shipped_at), \
             city = COALESCE($4, city), state = COALESCE($5, state), postal_code = COALESCE($6, postal_code), \
             updated_at = $7 WHERE order_id = $1",
        )
        .bind(&u.order_id).bind(&u.fulfillment_status).bind(u.shipped_at).bind(&u.city).bind(&u.state)
        .bind(&u.postal_code).bind(u.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reserve_getcid_slot(&self, order_id: &str, cap: i32) -> StoreResult<Option<i32>> {
        let row: Option<(i32,)> = sqlx::query_as(
            "UPDATE amazon_orders SET getcid_used_count = getcid_used_count + 1, \
             getcid_used = (getcid_used_count + 1 >= $2), updated_at = NOW() \
             WHERE order_id = $1 AND getcid_used_count < $2 RETURNING getcid_used_count",
        )
        .bind(order_id).bind(cap)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(count,)| count))
    }

    async fn release_getcid_slot(&self, order_id: &str, cap: i32) -> StoreResult<()> {
        sqlx::query(
            "UPDATE amazon_orders SET getcid_used_count = GREATEST(getcid_used_count - 1, 0), \
             getcid_used = (GREATEST(getcid_used_count - 1, 0) >= $2), updated_at = NOW() WHERE order_id = $1",
        )
        .bind(order_id).bind(cap)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_refunded(&self, order_ids: &[String], at: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "UPDATE amazon_orders SET is_refunded = TRUE, updated_at = $2 \
             WHERE order_id = ANY($1) AND NOT is_refunded RETURNING order_id",
        )
        .bind(order_ids).bind(at)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl MultiItemStore for PgStore {
    async fn record_multi_item_orders(&self, orders: &[MultiItemOrder]) -> StoreResult<usize> {
        let mut tx = self.pool.begin().await?;
        let mut recorded = 0usize;
        for m in orders {
            let result = sqlx::query(
                "INSERT INTO multi_fsn_orders (id, order_id, seller_account, order_date, buyer_email, items, item_count, \
                 total_amount, currency, fulfillment_type, status, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) ON CONFLICT (order_id) DO NOTHING",
            )
            .bind(m.id).bind(&m.order_id).bind(&m.seller_account).bind(m.order_date).bind(&m.buyer_email)
            .bind(Json(&m.items)).bind(m.item_count).bind(m.total_amount).bind(&m.currency)
            .bind(m.fulfillment_channel.as_str()).bind(m.status.as_db()).bind(m.created_at)
            .execute(&mut *tx)
            .await?;
            recorded += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(recorded)
    }

    async fn list_multi_item_orders(
        &self,
        status: Option<MultiItemStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Page<MultiItemOrder>> {
        let status = status.map(|s| s.as_db());
        let rows = sqlx::query_as::<_, MultiItemRow>(
            "SELECT * FROM multi_fsn_orders WHERE ($1::text IS NULL OR status = $1) \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3",
        )
        .bind(status).bind(limit).bind(offset)
        .fetch_all(&self.pool)
        .await?;
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM multi_fsn_orders WHERE ($1::text IS NULL OR status = $1)")
            .bind(status)
            .fetch_one(&self.pool)
            .await?;
        Ok(Page { data: convert_all(rows)?, total: total.0, limit, offset })
    }

    async fn process_multi_item_order(
        &self,
        id: Uuid,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<MultiItemOrder>> {
        let updated = sqlx::query_as::<_, MultiItemRow>(
            "UPDATE multi_fsn_orders SET status = 'PROCESSED', admin_notes = $2, processed_at = $3 \
             WHERE id = $1 AND status = 'PENDING' RETURNING *",
        )
        .bind(id).bind(&notes).bind(at)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = updated {
            return MultiItemOrder::try_from(row).map(Some);
        }
        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM multi_fsn_orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Err(StoreError::Conflict(format!("multi-item order {id} is already processed"))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl AppealStore for PgStore {
    async fn find_appeal(&self, id: Uuid) -> StoreResult<Option<EarlyAppeal>> {
        sqlx::query_as::<_, AppealRow>("SELECT * FROM fba_early_appeals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(EarlyAppeal::try_from)
            .transpose()
    }

    async fn open_appeals_for_order(&self, order_id: &str) -> StoreResult<Vec<EarlyAppeal>> {
        let rows = sqlx::query_as::<_, AppealRow>(
            "SELECT * FROM fba_early_appeals WHERE order_id = $1 AND status IN ('PENDING', 'APPROVED')",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn latest_appeal(&self, order_id: &str) -> StoreResult<Option<EarlyAppeal>> {
        sqlx::query_as::<_, AppealRow>(
            "SELECT * FROM fba_early_appeals WHERE order_id = $1 ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?
        .map(EarlyAppeal::try_from)
        .transpose()
    }

    async fn list_appeals(&self, filter: &AppealFilter) -> StoreResult<Page<EarlyAppeal>> {
        let status = filter.status.and_then(|s| s.as_db());
        let rows = sqlx::query_as::<_, AppealRow>(
            "SELECT * FROM fba_early_appeals WHERE ($1::text IS NULL OR status = $1) \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3",
        )
        .bind(status).bind(filter.limit).bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM fba_early_appeals WHERE ($1::text IS NULL OR status = $1)")
            .bind(status)
            .fetch_one(&self.pool)
            .await?;
        Ok(Page { data: convert_all(rows)?, total: total.0, limit: filter.limit, offset: filter.offset })
    }

    async fn open_appeal(&self, a: &EarlyAppeal) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let stamped: Option<(Uuid,)> = sqlx::query_as(
            "UPDATE amazon_orders SET early_appeal_status = 'PENDING', early_appeal_at = $2, updated_at = NOW() \
             WHERE order_id = $1 AND (early_appeal_status IS NULL OR early_appeal_status = 'REJECTED') RETURNING id",
        )
        .bind(a.order_id.as_str()).bind(a.created_at)
        .fetch_optional(&mut *tx)
        .await?;
        if stamped.is_none() {
            return Err(StoreError::Conflict(format!("order {} already has an open appeal", a.order_id)));
        }
        sqlx::query(
            "INSERT INTO fba_early_appeals (id, order_id, customer_email, customer_whatsapp, proof_image_url, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, 'PENDING', $6)",
        )
        .bind(a.id).bind(a.order_id.as_str()).bind(&a.customer_email).bind(&a.customer_whatsapp)
        .bind(&a.proof_image_url).bind(a.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| conflict_on_unique(e, || format!("order {} already has an open appeal", a.order_id)))?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_resolution(&self, a: &EarlyAppeal) -> StoreResult<()> {
        let status = a.status.as_db().ok_or_else(|| StoreError::Corrupt(format!("appeal {} has no status", a.id)))?;
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE fba_early_appeals SET status = $2, rejection_reason = $3, admin_notes = $4, reviewed_by = $5, reviewed_at = $6 \
             WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(a.id).bind(status).bind(&a.rejection_reason).bind(&a.admin_notes).bind(&a.reviewed_by).bind(a.reviewed_at)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("appeal {} is no longer pending", a.id)));
        }
        sqlx::query("UPDATE amazon_orders SET early_appeal_status = $2, updated_at = NOW() WHERE order_id = $1")
            .bind(a.order_id.as_str()).bind(status)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl StateDelayStore for PgStore {
    async fn list_state_delays(&self) -> StoreResult<Vec<StateDelayEntry>> {
        let rows = sqlx::query_as::<_, StateDelayRow>("SELECT * FROM fba_state_delays ORDER BY state_name ASC")
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn insert_state_delay(&self, e: &StateDelayEntry) -> StoreResult<()> {
        sqlx::query("INSERT INTO fba_state_delays (id, state_name, delay_hours, created_at, updated_at) VALUES ($1, $2, $3, $4, $5)")
            .bind(e.id).bind(e.state_name.as_str()).bind(e.delay_hours.value()).bind(e.created_at).bind(e.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|err| conflict_on_unique(err, || format!("state {} already exists", e.state_name)))?;
        Ok(())
    }

    async fn update_state_delay(
        &self,
        id: Uuid,
        state_name: Option<&RegionKey>,
        delay_hours: DelayHours,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<StateDelayEntry>> {
        sqlx::query_as::<_, StateDelayRow>(
            "UPDATE fba_state_delays SET state_name = COALESCE($2, state_name), delay_hours = $3, updated_at = $4 \
             WHERE id = $1 RETURNING *",
        )
        .bind(id).bind(state_name.map(RegionKey::as_str)).bind(delay_hours.value()).bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| conflict_on_unique(err, || "state already exists".to_string()))?
        .map(StateDelayEntry::try_from)
        .transpose()
    }

    async fn delete_state_delay(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM fba_state_delays WHERE id = $1").bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn list_tokens(&self) -> StoreResult<Vec<GetCidToken>> {
        Ok(sqlx::query_as::<_, GetCidToken>("SELECT * FROM getcid_tokens ORDER BY priority DESC")
            .fetch_all(&self.pool)
            .await?)
    }

    async fn find_token(&self, id: Uuid) -> StoreResult<Option<GetCidToken>> {
        Ok(sqlx::query_as::<_, GetCidToken>("SELECT * FROM getcid_tokens WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn max_priority(&self) -> StoreResult<Option<i32>> {
        let row: (Option<i32>,) = sqlx::query_as("SELECT MAX(priority) FROM getcid_tokens").fetch_one(&self.pool).await?;
        Ok(row.0)
    }

    async fn upsert_token(&self, t: &GetCidToken) -> StoreResult<GetCidToken> {
        Ok(sqlx::query_as::<_, GetCidToken>(
            "INSERT INTO getcid_tokens (id, token, email, count_used, total_available, priority, is_active, last_verified_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (token) DO UPDATE SET email = EXCLUDED.email, count_used = EXCLUDED.count_used, \
             total_available = EXCLUDED.total_available, priority = EXCLUDED.priority, is_active = EXCLUDED.is_active, \
             last_verified_at = EXCLUDED.last_verified_at, updated_at = EXCLUDED.updated_at \
             RETURNING *",
        )
        .bind(t.id).bind(&t.token).bind(&t.email).bind(t.count_used).bind(t.total_available).bind(t.priority)
        .bind(t.is_active).bind(t.last_verified_at).bind(t.created_at).bind(t.updated_at)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn update_token_settings(
        &self,
        id: Uuid,
        is_active: Option<bool>,
        priority: Option<i32>,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<GetCidToken>> {
        Ok(sqlx::query_as::<_, GetCidToken>(
            "UPDATE getcid_tokens SET is_active = COALESCE($2, is_active), priority = COALESCE($3, priority), updated_at = $4 \
             WHERE id = $1 RETURNING *",
        )
        .bind(id).bind(is_active).bind(priority).bind(at)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn overwrite_usage(&self, id: Uuid, usage: &TokenUsage, at: DateTime<Utc>) -> StoreResult<Option<GetCidToken>> {
        Ok(sqlx::query_as::<_, GetCidToken>(
            "UPDATE getcid_tokens SET count_used = $2, total_available = $3, email = COALESCE($4, email), \
             last_verified_at = $5, updated_at = $5 WHERE id = $1 RETURNING *",
        )
        .bind(id).bind(usage.count_used).bind(usage.total_available).bind(&usage.email).bind(at)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn reserve_token(&self) -> StoreResult<Option<GetCidToken>> {
        Ok(sqlx::query_as::<_, GetCidToken>(
            "UPDATE getcid_tokens SET count_used = count_used + 1, updated_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM getcid_tokens \
                 WHERE is_active AND count_used < total_available \
                 ORDER BY priority DESC, (total_available - count_used) DESC, id ASC \
                 LIMIT 1 FOR UPDATE \
             ) AND is_active AND count_used < total_available \
             RETURNING *",
        )
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn release_token(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE getcid_tokens SET count_used = GREATEST(count_used - 1, 0), updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_token(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM getcid_tokens WHERE id = $1").bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl UsageLog for PgStore {
    async fn append_usage(&self, u: &GetCidUsage) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO getcid_usage (id, identifier, identifier_type, installation_id, confirmation_id, api_response, \
             api_status, token_id, ip_address, user_agent, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(u.id).bind(&u.identifier).bind(u.identifier_type).bind(&u.installation_id).bind(&u.confirmation_id)
        .bind(&u.api_response).bind(&u.api_status).bind(u.token_id).bind(&u.ip_address).bind(&u.user_agent).bind(u.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LicenseKeyStore for PgStore {
    async fn find_key(&self, id: Uuid) -> StoreResult<Option<LicenseKey>> {
        Ok(sqlx::query_as::<_, LicenseKey>("SELECT * FROM amazon_activation_license_keys WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn claim_key(&self, sku: &str, order_id: &str, at: DateTime<Utc>) -> StoreResult<KeyClaim> {
        let mut tx = self.pool.begin().await?;
        let key = sqlx::query_as::<_, LicenseKey>(
            "UPDATE amazon_activation_license_keys SET order_id = $2, is_assigned = TRUE, assigned_at = $3 \
             WHERE id = ( \
                 SELECT id FROM amazon_activation_license_keys \
                 WHERE sku = $1 AND NOT is_assigned AND order_id IS NULL \
                 LIMIT 1 FOR UPDATE SKIP LOCKED \
             ) RETURNING *",
        )
        .bind(sku).bind(order_id).bind(at)
        .fetch_optional(&mut *tx)
        .await?;
        let linked = match key {
            Some(key) => {
                let result = sqlx::query(
                    "UPDATE amazon_orders SET license_key_id = $2, updated_at = NOW() \
                     WHERE order_id = $1 AND license_key_id IS NULL",
                )
                .bind(order_id).bind(key.id)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() == 1 {
                    tx.commit().await?;
                    return Ok(KeyClaim::Claimed(key));
                }
                tx.rollback().await?;
                true
            }
            None => {
                tx.rollback().await?;
                false
            }
        };
        let existing = sqlx::query_as::<_, LicenseKey>(
            "SELECT k.* FROM amazon_activation_license_keys k \
             JOIN amazon_orders o ON o.license_key_id = k.id WHERE o.order_id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        match (existing, linked) {
            (Some(key), _) => Ok(KeyClaim::AlreadyLinked(key)),
            (None, true) => Err(StoreError::Conflict(format!("order {order_id} could not be linked to a key"))),
            (None, false) => Ok(KeyClaim::PoolEmpty),
        }
    }

    async fn append_redemption(&self, r: &RedemptionRecord) -> StoreResult<()> {
        sqlx::query("INSERT INTO redemption_log (id, order_id, license_key_id, created_at) VALUES ($1, $2, $3, $4)")
            .bind(r.id).bind(&r.order_id).bind(r.license_key_id).bind(r.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn asin_mappings(&self, asins: &[String]) -> StoreResult<HashMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT asin, fsn FROM amazon_asin_mapping WHERE asin = ANY($1)")
            .bind(asins)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }
}

#[async_trait]
impl CronLog for PgStore {
    async fn record_cron_run(&self, run: &CronRun) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO cron_job_logs (id, job_name, status, started_at, duration_ms, records_processed, error_message) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(run.id).bind(&run.job_name).bind(run.status).bind(run.started_at).bind(run.duration_ms)
        .bind(run.records_processed).bind(&run.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
