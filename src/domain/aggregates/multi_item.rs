//! Multi-item Order
//!
//! Only the first line item of an order is activated automatically. Orders
//! with more lines are queued here for an admin to handle by hand.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::domain::aggregates::order::FulfillmentChannel;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MultiItemStatus {
    #[default]
    Pending,
    Processed,
}

impl MultiItemStatus {
    pub fn as_db(&self) -> &'static str {
        match self { Self::Pending => "PENDING", Self::Processed => "PROCESSED" }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value.trim() {
            v if v.eq_ignore_ascii_case("PENDING") => Some(Self::Pending),
            v if v.eq_ignore_ascii_case("PROCESSED") => Some(Self::Processed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub asin: Option<String>,
    pub sku: Option<String>,
    pub fsn: Option<String>,
    pub title: Option<String>,
    pub quantity: Option<i32>,
    pub price: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiItemOrder {
    pub id: Uuid,
    pub order_id: String,
    pub seller_account: String,
    pub order_date: Option<DateTime<Utc>>,
    pub buyer_email: Option<String>,
    pub items: Vec<OrderLine>,
    pub item_count: i32,
    pub total_amount: Option<Decimal>,
    pub currency: String,
    pub fulfillment_channel: FulfillmentChannel,
    pub status: MultiItemStatus,
    pub admin_notes: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl MultiItemOrder {
    /// Marks the order handled. Already processed orders stay as they are.
    pub fn process(&mut self, notes: Option<String>, now: DateTime<Utc>) -> bool {
        if self.status == MultiItemStatus::Processed {
            return false;
        }
        self.status = MultiItemStatus::Processed;
        self.admin_notes = notes;
        self.processed_at = Some(now);
        true
    }
}
