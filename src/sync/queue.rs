//! Admin queue of multi-item orders awaiting manual handling.

use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::clock::Clock;
use crate::domain::aggregates::{MultiItemOrder, MultiItemStatus};
use crate::store::{MultiItemStore, Page};
use crate::{FulfillmentError, Result};

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMultiItem {
    #[validate(length(max = 2000))]
    pub admin_notes: Option<String>,
}

pub struct MultiItemQueue {
    store: Arc<dyn MultiItemStore>,
    clock: Arc<dyn Clock>,
}

impl MultiItemQueue {
    pub fn new(store: Arc<dyn MultiItemStore>, clock: Arc<dyn Clock>) -> Self { Self { store, clock } }

    pub async fn list(&self, status: Option<MultiItemStatus>, limit: i64, offset: i64) -> Result<Page<MultiItemOrder>> {
        Ok(self.store.list_multi_item_orders(status, limit.clamp(1, 100), offset.max(0)).await?)
    }

    pub async fn process(&self, id: Uuid, req: ProcessMultiItem) -> Result<MultiItemOrder> {
        req.validate()?;
        let notes = req.admin_notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        let order = self
            .store
            .process_multi_item_order(id, notes, self.clock.now())
            .await?
            .ok_or_else(|| FulfillmentError::NotFound("Multi-item order not found".into()))?;
        tracing::info!(order_id = %order.order_id, "multi-item order processed");
        Ok(order)
    }
}
