//! Domain events
use serde::Serialize;
use uuid::Uuid;
use crate::domain::aggregates::{AppealStatus, FulfillmentChannel};

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Appeal(AppealEvent),
    Activation(ActivationEvent),
    Sync(SyncEvent),
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AppealEvent {
    Submitted { appeal_id: Uuid, order_id: String },
    Resolved { appeal_id: Uuid, order_id: String, status: AppealStatus, reviewed_by: String },
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ActivationEvent {
    ConfirmationIssued { identifier: String, token_id: Uuid },
    KeyAssigned { order_id: String, license_key_id: Uuid },
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    OrdersSynced { channel: FulfillmentChannel, inserted: usize, updated: usize },
    RefundsSynced { orders_refunded: usize },
}

impl DomainEvent {
    /// NATS subject the event is published on.
    pub fn subject(&self) -> &'static str {
        match self {
            Self::Appeal(AppealEvent::Submitted { .. }) => "fulfillment.appeal.submitted",
            Self::Appeal(AppealEvent::Resolved { .. }) => "fulfillment.appeal.resolved",
            Self::Activation(ActivationEvent::ConfirmationIssued { .. }) => "fulfillment.getcid.issued",
            Self::Activation(ActivationEvent::KeyAssigned { .. }) => "fulfillment.key.assigned",
            Self::Sync(SyncEvent::OrdersSynced { .. }) => "fulfillment.orders.synced",
            Self::Sync(SyncEvent::RefundsSynced { .. }) => "fulfillment.refunds.synced",
        }
    }
}
