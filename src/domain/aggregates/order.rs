//! Marketplace Order Aggregate

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;
use crate::domain::aggregates::appeal::AppealStatus;
use crate::domain::value_objects::MarketplaceOrderId;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub order_id: MarketplaceOrderId,
    pub fulfillment_channel: FulfillmentChannel,
    pub fulfillment_status: Option<String>,
    /// Catalog identifier of the first line item.
    pub fsn: Option<String>,
    pub quantity: i32,
    pub order_total: Option<Decimal>,
    pub currency: String,
    pub buyer_email: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub order_date: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub early_appeal_status: AppealStatus,
    pub early_appeal_at: Option<DateTime<Utc>>,
    pub is_refunded: bool,
    pub license_key_id: Option<Uuid>,
    pub getcid_used_count: i32,
    pub getcid_used: bool,
    pub warranty_status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FulfillmentChannel {
    /// Merchant-fulfilled (MFN): shipped by the seller, never gated.
    #[serde(rename = "amazon_mfn")]
    Merchant,
    /// Marketplace-fulfilled (AFN/FBA): shipped by Amazon, gated on delivery.
    #[serde(rename = "amazon_fba")]
    Marketplace,
}

impl FulfillmentChannel {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Merchant => "amazon_mfn", Self::Marketplace => "amazon_fba" }
    }
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "amazon_mfn" => Some(Self::Merchant),
            "amazon_fba" => Some(Self::Marketplace),
            _ => None,
        }
    }
    /// Channel code used by the Selling Partner Orders API.
    pub fn api_code(&self) -> &'static str {
        match self { Self::Merchant => "MFN", Self::Marketplace => "AFN" }
    }
    /// How far back each sync run looks for new orders.
    pub fn lookback(&self) -> chrono::Duration {
        match self { Self::Merchant => chrono::Duration::days(7), Self::Marketplace => chrono::Duration::days(30) }
    }
}

impl Order {
    pub fn is_marketplace_fulfilled(&self) -> bool { self.fulfillment_channel == FulfillmentChannel::Marketplace }

    pub fn is_cancelled(&self) -> bool {
        self.status_is(&["canceled", "cancelled"])
    }

    /// The shipment has not left the warehouse yet.
    pub fn is_awaiting_shipment(&self) -> bool {
        self.status_is(&["pending", "unshipped"])
    }

    fn status_is(&self, values: &[&str]) -> bool {
        self.fulfillment_status
            .as_deref()
            .map(|s| values.iter().any(|v| s.trim().eq_ignore_ascii_case(v)))
            .unwrap_or(false)
    }

    /// Start of the delivery delay: the sync time, else the marketplace purchase time.
    pub fn clock_start(&self) -> Option<DateTime<Utc>> { self.synced_at.or(self.order_date) }

    /// Confirmation-id generations this order is entitled to.
    pub fn getcid_cap(&self, combos: &ComboCatalog) -> i32 {
        self.quantity.max(1).saturating_mul(combos.items_per_order(self.fsn.as_deref()))
    }

    pub fn getcid_quota_exhausted(&self, combos: &ComboCatalog) -> bool {
        self.getcid_used_count >= self.getcid_cap(combos)
    }
}

/// Product identifiers that bundle two activations in one unit.
#[derive(Clone, Debug, Default)]
pub struct ComboCatalog(HashSet<String>);

impl ComboCatalog {
    pub fn new<I, S>(ids: I) -> Self where I: IntoIterator<Item = S>, S: Into<String> {
        Self(ids.into_iter().map(|s| s.into().trim().to_uppercase()).filter(|s| !s.is_empty()).collect())
    }

    /// Parses a comma separated list, as found in configuration.
    pub fn from_csv(raw: &str) -> Self { Self::new(raw.split(',')) }

    pub fn is_combo(&self, product_id: &str) -> bool { self.0.contains(&product_id.trim().to_uppercase()) }

    pub fn items_per_order(&self, product_id: Option<&str>) -> i32 {
        match product_id {
            Some(id) if self.is_combo(id) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_order(order_id: &str) -> Order {
    let now = Utc::now();
    Order {
        id: Uuid::now_v7(),
        order_id: MarketplaceOrderId::new(order_id).expect("valid order id"),
        fulfillment_channel: FulfillmentChannel::Marketplace,
        fulfillment_status: Some("Shipped".into()),
        fsn: Some("WIN11PRO".into()),
        quantity: 1,
        order_total: None,
        currency: "INR".into(),
        buyer_email: None,
        city: None,
        state: Some("DELHI".into()),
        postal_code: None,
        country: Some("IN".into()),
        order_date: None,
        synced_at: Some(now),
        shipped_at: None,
        early_appeal_status: AppealStatus::None,
        early_appeal_at: None,
        is_refunded: false,
        license_key_id: None,
        getcid_used_count: 0,
        getcid_used: false,
        warranty_status: "PENDING".into(),
        created_at: now,
        updated_at: now,
    }
}
