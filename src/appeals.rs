//! Early-delivery appeals.
//!
//! A customer whose marketplace order is still inside its delivery window
//! can upload proof of delivery. An admin approves or rejects it; approval
//! unblocks redemption for good, rejection restores the time-based block and
//! allows a fresh submission.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::blob::BlobStore;
use crate::clock::Clock;
use crate::domain::aggregates::{AppealAction, AppealDecision, AppealStatus, EarlyAppeal, Order};
use crate::domain::events::{AppealEvent, DomainEvent};
use crate::domain::value_objects::{MarketplaceOrderId, WhatsAppNumber};
use crate::effects::Effect;
use crate::notify::Notification;
use crate::redemption::{BlockKind, RedemptionChecker};
use crate::store::{AppealFilter, AppealStore, OrderStore, Page, StoreError};
use crate::{FulfillmentError, Result};

pub const PROOF_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "heic"];
pub const PROOF_PREFIX: &str = "fba-appeals";

const MISSING_FIELDS: &str = "All fields are required: Order ID, Email, WhatsApp number, and Proof image";
const PENDING_EXISTS: &str = "You already have a pending appeal for this order. Please wait for our team to review it.";
const ALREADY_APPROVED: &str = "Your order is already approved for activation. Please try activating again.";
const ALREADY_REDEEMABLE: &str = "Your order is already available for activation. Please try activating again.";
const NOT_MARKETPLACE: &str = "Early delivery appeals are only applicable for physical delivery orders.";

/// Customer upload, as received from the multipart form.
#[derive(Debug, Validate)]
pub struct AppealSubmission {
    pub order_id: String,
    #[validate(email(message = "Please enter a valid email address"))]
    pub email: String,
    pub whatsapp: String,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveAppeal {
    pub action: AppealAction,
    pub rejection_reason: Option<String>,
    pub admin_notes: Option<String>,
    pub reviewed_by: Option<String>,
}

impl ResolveAppeal {
    fn decision(&self) -> Result<AppealDecision> {
        match self.action {
            AppealAction::Approve => Ok(AppealDecision::Approve),
            AppealAction::Reject => Ok(AppealDecision::Reject { reason: non_blank(self.rejection_reason.as_deref()) }),
            AppealAction::Submit => Err(FulfillmentError::validation("Action must be APPROVE or REJECT")),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn proof_extension(file_name: &str) -> Option<String> {
    let ext = file_name.rsplit_once('.').map(|(_, ext)| ext.to_lowercase())?;
    PROOF_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// Blob path for a proof image; the timestamp keeps resubmissions apart.
pub fn proof_path(order_id: &MarketplaceOrderId, at: DateTime<Utc>, ext: &str) -> String {
    format!("{PROOF_PREFIX}/{}_{}.{ext}", order_id, at.timestamp_millis())
}

pub struct AppealWorkflow {
    orders: Arc<dyn OrderStore>,
    appeals: Arc<dyn AppealStore>,
    blobs: Option<Arc<dyn BlobStore>>,
    checker: Arc<RedemptionChecker>,
    clock: Arc<dyn Clock>,
    app_url: String,
}

impl AppealWorkflow {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        appeals: Arc<dyn AppealStore>,
        blobs: Option<Arc<dyn BlobStore>>,
        checker: Arc<RedemptionChecker>,
        clock: Arc<dyn Clock>,
        app_url: impl Into<String>,
    ) -> Self {
        Self { orders, appeals, blobs, checker, clock, app_url: app_url.into() }
    }

    pub async fn submit(&self, sub: AppealSubmission) -> Result<(EarlyAppeal, Vec<Effect>)> {
        if [&sub.order_id, &sub.email, &sub.whatsapp].iter().any(|f| f.trim().is_empty()) || sub.bytes.is_empty() {
            return Err(FulfillmentError::validation(MISSING_FIELDS));
        }
        sub.validate()?;
        let whatsapp = WhatsAppNumber::parse(&sub.whatsapp)
            .ok_or_else(|| FulfillmentError::validation("Please enter a valid WhatsApp number"))?;
        let ext = proof_extension(&sub.file_name)
            .ok_or_else(|| FulfillmentError::validation("Please upload an image file (JPG, PNG, WebP, or HEIC)"))?;
        let order_id = MarketplaceOrderId::new(&sub.order_id)?;

        let order = self
            .orders
            .find_order(order_id.as_str())
            .await?
            .ok_or_else(|| FulfillmentError::not_found("Order not found. Please check your order ID."))?;
        ensure_no_open_appeal(order.early_appeal_status)?;
        for open in self.appeals.open_appeals_for_order(order_id.as_str()).await? {
            ensure_no_open_appeal(open.status)?;
        }
        self.ensure_in_transit(&order).await?;
        order.early_appeal_status.transition(AppealAction::Submit)?;

        let blobs = self
            .blobs
            .as_ref()
            .ok_or_else(|| FulfillmentError::Unavailable("Proof uploads are not available right now.".into()))?;
        let now = self.clock.now();
        let path = proof_path(&order_id, now, &ext);
        let url = blobs.upload(&path, sub.bytes, &sub.content_type).await.map_err(|e| {
            tracing::error!(order_id = %order_id, %path, error = %e, "proof upload failed");
            FulfillmentError::from(e)
        })?;

        let appeal = EarlyAppeal::submit(order_id, sub.email.trim(), whatsapp.as_str(), url, now);
        self.appeals.open_appeal(&appeal).await.map_err(|e| match e {
            StoreError::Conflict(_) => FulfillmentError::policy(PENDING_EXISTS),
            other => other.into(),
        })?;
        tracing::info!(appeal_id = %appeal.id, order_id = %appeal.order_id, "early appeal submitted");

        let event = DomainEvent::Appeal(AppealEvent::Submitted { appeal_id: appeal.id, order_id: appeal.order_id.to_string() });
        Ok((appeal, vec![Effect::Publish(event)]))
    }

    async fn ensure_in_transit(&self, order: &Order) -> Result<()> {
        if !order.is_marketplace_fulfilled() {
            return Err(FulfillmentError::policy(NOT_MARKETPLACE));
        }
        let decision = self.checker.check(order).await?;
        match decision.block {
            Some(BlockKind::InTransit) => Ok(()),
            None => Err(FulfillmentError::policy(ALREADY_REDEEMABLE)),
            Some(_) => Err(FulfillmentError::Policy(decision.reason.unwrap_or_else(|| NOT_MARKETPLACE.to_string()))),
        }
    }

    pub async fn resolve(&self, appeal_id: Uuid, req: ResolveAppeal) -> Result<(EarlyAppeal, Vec<Effect>)> {
        let decision = req.decision()?;
        let mut appeal = self
            .appeals
            .find_appeal(appeal_id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found("Appeal not found"))?;
        if appeal.status != AppealStatus::Pending {
            return Err(FulfillmentError::validation(format!("Appeal has already been {}", appeal.status.label())));
        }

        appeal.resolve(&decision, self.clock.now())?;
        appeal.admin_notes = non_blank(req.admin_notes.as_deref());
        appeal.reviewed_by = Some(non_blank(req.reviewed_by.as_deref()).unwrap_or_else(|| "Admin".to_string()));
        self.appeals.record_resolution(&appeal).await.map_err(|e| match e {
            StoreError::Conflict(_) => FulfillmentError::validation("Appeal has already been resolved"),
            other => other.into(),
        })?;
        tracing::info!(%appeal_id, order_id = %appeal.order_id, status = appeal.status.label(), "early appeal resolved");

        let notification = match appeal.status {
            AppealStatus::Approved => Notification::appeal_approved(&appeal, &self.app_url),
            _ => Notification::appeal_rejected(&appeal),
        };
        let event = DomainEvent::Appeal(AppealEvent::Resolved {
            appeal_id,
            order_id: appeal.order_id.to_string(),
            status: appeal.status,
            reviewed_by: appeal.reviewed_by.clone().unwrap_or_default(),
        });
        Ok((appeal, vec![Effect::Notify(notification), Effect::Publish(event)]))
    }

    /// Most recent appeal for an order, for the customer status page.
    pub async fn latest_for_order(&self, order_id: &str) -> Result<Option<EarlyAppeal>> {
        let order_id = MarketplaceOrderId::new(order_id)?;
        Ok(self.appeals.latest_appeal(order_id.as_str()).await?)
    }

    pub async fn list(&self, status: Option<AppealStatus>, limit: i64, offset: i64) -> Result<Page<EarlyAppeal>> {
        let filter = AppealFilter { status, limit: limit.clamp(1, 100), offset: offset.max(0) };
        Ok(self.appeals.list_appeals(&filter).await?)
    }
}

fn ensure_no_open_appeal(status: AppealStatus) -> Result<()> {
    match status {
        AppealStatus::Pending => Err(FulfillmentError::policy(PENDING_EXISTS)),
        AppealStatus::Approved => Err(FulfillmentError::policy(ALREADY_APPROVED)),
        AppealStatus::None | AppealStatus::Rejected => Ok(()),
    }
}
