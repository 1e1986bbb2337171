//! Redemption gate for marketplace-fulfilled orders.
//!
//! Amazon ships these orders, so a license key handed out before delivery
//! can end up with whoever intercepts the parcel. Redemption is held back
//! until the per-region delivery delay has elapsed or an early appeal has
//! been approved. Rules are evaluated in order and the first match wins:
//!
//! 1. merchant-fulfilled orders are never gated
//! 2. an approved appeal always unblocks
//! 3. cancelled orders are blocked for good
//! 4. refunded orders are blocked for good
//! 5. orders not yet shipped are blocked without an appeal option
//! 6. the clock starts at `synced_at`, else `order_date`; no clock means allowed
//! 7. allowed once `now >= clock + delay`
//! 8. otherwise blocked in transit, with time remaining and an appeal hint

pub mod keys;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::clock::Clock;
use crate::domain::aggregates::{AppealStatus, Order};
use crate::domain::value_objects::DelayHours;
use crate::state_delays::StateDelays;
use crate::Result;

pub use keys::{RedeemOutcome, RedemptionService};

const MS_PER_HOUR: i64 = 60 * 60 * 1000;
const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;

const CANCELLED_REASON: &str = "This order has been cancelled. Please contact Amazon support for assistance.";
const REFUNDED_REASON: &str = "This order has been refunded. Activation is not available for refunded orders.";
const AWAITING_SHIPMENT_REASON: &str = "Your order is being prepared for shipment. You will be able to activate your product once it has been shipped and the delivery period has passed.";
const APPEAL_UNDER_REVIEW_REASON: &str = "Your early delivery appeal is being reviewed by our team. We will notify you once it is processed.";

/// Why redemption is currently blocked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Cancelled,
    Refunded,
    AwaitingShipment,
    InTransit,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionDecision {
    pub can_redeem: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeemable_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_remaining: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hours_remaining: Option<i64>,
    pub can_appeal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appeal_status: Option<AppealStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockKind>,
}

impl RedemptionDecision {
    fn allowed() -> Self {
        Self {
            can_redeem: true,
            reason: None,
            redeemable_at: None,
            days_remaining: None,
            hours_remaining: None,
            can_appeal: false,
            appeal_status: None,
            block: None,
        }
    }

    fn blocked(block: BlockKind, reason: &str) -> Self {
        Self { can_redeem: false, reason: Some(reason.to_string()), block: Some(block), ..Self::allowed() }
    }

    pub fn is_in_transit(&self) -> bool { self.block == Some(BlockKind::InTransit) }
}

/// Evaluates the gate for `order` at `now` with the order's regional delay.
///
/// Only elapsed time or an approved appeal opens a marketplace-fulfilled
/// order. A carrier `DELIVERED` shipment status does not: customers who
/// already hold the package go through an early appeal instead.
pub fn decide(order: &Order, now: DateTime<Utc>, delay: DelayHours) -> RedemptionDecision {
    if !order.is_marketplace_fulfilled() {
        return RedemptionDecision::allowed();
    }
    if order.early_appeal_status == AppealStatus::Approved {
        return RedemptionDecision::allowed();
    }
    if order.is_cancelled() {
        return RedemptionDecision::blocked(BlockKind::Cancelled, CANCELLED_REASON);
    }
    if order.is_refunded {
        return RedemptionDecision::blocked(BlockKind::Refunded, REFUNDED_REASON);
    }
    if order.is_awaiting_shipment() {
        return RedemptionDecision::blocked(BlockKind::AwaitingShipment, AWAITING_SHIPMENT_REASON);
    }
    let Some(start) = order.clock_start() else {
        return RedemptionDecision::allowed();
    };
    let redeemable_at = start + delay.as_duration();
    if now >= redeemable_at {
        return RedemptionDecision::allowed();
    }

    let remaining_ms = (redeemable_at - now).num_milliseconds().max(1);
    let days_remaining = ceil_div(remaining_ms, MS_PER_DAY);
    let hours_remaining = ceil_div(remaining_ms, MS_PER_HOUR);
    let appeal = order.early_appeal_status;
    let pending = appeal == AppealStatus::Pending;

    let reason = if pending {
        APPEAL_UNDER_REVIEW_REASON.to_string()
    } else if hours_remaining <= 24 {
        format!(
            "Your order is still on the way. Activation opens in about {hours_remaining} {}. \
             If you have already received your package, you can submit proof of delivery to activate early.",
            plural(hours_remaining, "hour"),
        )
    } else {
        format!(
            "Your order is still on the way. Activation opens in about {days_remaining} {}. \
             If you have already received your package, you can submit proof of delivery to activate early.\n\n\
             This security measure helps protect your purchase from unauthorized access.",
            plural(days_remaining, "day"),
        )
    };

    RedemptionDecision {
        can_redeem: false,
        reason: Some(reason),
        redeemable_at: Some(redeemable_at),
        days_remaining: Some(days_remaining),
        hours_remaining: Some(hours_remaining),
        can_appeal: !pending && appeal != AppealStatus::Rejected,
        appeal_status: (appeal != AppealStatus::None).then_some(appeal),
        block: Some(BlockKind::InTransit),
    }
}

fn ceil_div(n: i64, d: i64) -> i64 { (n + d - 1) / d }

fn plural(n: i64, unit: &str) -> String {
    if n == 1 { unit.to_string() } else { format!("{unit}s") }
}

/// Side-effect free redemption checks backed by the state delay table.
pub struct RedemptionChecker {
    delays: Arc<StateDelays>,
    clock: Arc<dyn Clock>,
}

impl RedemptionChecker {
    pub fn new(delays: Arc<StateDelays>, clock: Arc<dyn Clock>) -> Self { Self { delays, clock } }

    pub async fn check(&self, order: &Order) -> Result<RedemptionDecision> {
        let delay = self.delays.delay_for(order.state.as_deref()).await?;
        Ok(decide(order, self.clock.now(), delay))
    }

    /// Same rules using only cached delays; never touches the store.
    pub fn check_cached(&self, order: &Order) -> RedemptionDecision {
        decide(order, self.clock.now(), self.delays.delay_for_cached(order.state.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::order::sample_order;
    use crate::domain::aggregates::FulfillmentChannel;
    use chrono::Duration;

    fn hours(h: i32) -> DelayHours { DelayHours::new(h).unwrap() }

    fn in_transit(synced_ago: Duration) -> (Order, DateTime<Utc>) {
        let now = Utc::now();
        let mut order = sample_order("408-1234567-1234567");
        order.synced_at = Some(now - synced_ago);
        (order, now)
    }

    #[test]
    fn test_blocked_until_delay_elapses() {
        let (order, now) = in_transit(Duration::hours(10));
        let d = decide(&order, now, hours(96));
        assert!(!d.can_redeem);
        assert_eq!(d.redeemable_at, Some(order.synced_at.unwrap() + Duration::hours(96)));
        assert_eq!(d.block, Some(BlockKind::InTransit));
        assert!(d.can_appeal);
        assert_eq!(d.days_remaining, Some(4));
        assert_eq!(d.hours_remaining, Some(86));
    }

    #[test]
    fn test_allowed_at_boundary() {
        let (order, _) = in_transit(Duration::zero());
        let at = order.synced_at.unwrap() + Duration::hours(48);
        assert!(decide(&order, at, hours(48)).can_redeem);
        assert!(!decide(&order, at - Duration::seconds(1), hours(48)).can_redeem);
    }

    #[test]
    fn test_merchant_orders_short_circuit() {
        let (mut order, now) = in_transit(Duration::zero());
        order.fulfillment_channel = FulfillmentChannel::Merchant;
        order.is_refunded = true;
        order.fulfillment_status = Some("Cancelled".into());
        assert!(decide(&order, now, hours(336)).can_redeem);
    }

    #[test]
    fn test_approved_appeal_beats_the_clock() {
        let (mut order, now) = in_transit(Duration::zero());
        order.early_appeal_status = AppealStatus::Approved;
        order.is_refunded = true;
        assert!(decide(&order, now, hours(336)).can_redeem);
    }

    #[test]
    fn test_cancelled_and_refunded_are_final() {
        let (mut order, _) = in_transit(Duration::days(30));
        let later = Utc::now() + Duration::days(365);
        order.fulfillment_status = Some("Canceled".into());
        let d = decide(&order, later, hours(1));
        assert_eq!((d.can_redeem, d.can_appeal, d.block), (false, false, Some(BlockKind::Cancelled)));

        order.fulfillment_status = Some("Shipped".into());
        order.is_refunded = true;
        for _ in 0..3 {
            let d = decide(&order, later, hours(1));
            assert_eq!((d.can_redeem, d.can_appeal, d.block), (false, false, Some(BlockKind::Refunded)));
        }
    }

    #[test]
    fn test_unshipped_orders_cannot_appeal() {
        let (mut order, now) = in_transit(Duration::days(30));
        order.fulfillment_status = Some("Unshipped".into());
        let d = decide(&order, now, hours(1));
        assert_eq!((d.can_redeem, d.can_appeal, d.block), (false, false, Some(BlockKind::AwaitingShipment)));
    }

    #[test]
    fn test_delivered_status_does_not_open_early() {
        let (mut order, now) = in_transit(Duration::hours(10));
        order.fulfillment_status = Some("Delivered".into());
        let d = decide(&order, now, hours(96));
        assert!(!d.can_redeem);
        assert!(d.can_appeal);
    }

    #[test]
    fn test_missing_clock_start_is_redeemable() {
        let (mut order, now) = in_transit(Duration::zero());
        order.synced_at = None;
        order.order_date = None;
        assert!(decide(&order, now, hours(336)).can_redeem);
    }

    #[test]
    fn test_reason_wording() {
        let (mut order, now) = in_transit(Duration::hours(30));
        let d = decide(&order, now, hours(48));
        assert!(d.reason.unwrap().contains("about 18 hours"));

        let d = decide(&order, now, hours(96));
        assert!(d.reason.unwrap().contains("about 3 days"));

        order.early_appeal_status = AppealStatus::Pending;
        let d = decide(&order, now, hours(96));
        assert_eq!(d.reason.as_deref(), Some(APPEAL_UNDER_REVIEW_REASON));
        assert!(!d.can_appeal);
        assert_eq!(d.appeal_status, Some(AppealStatus::Pending));

        order.early_appeal_status = AppealStatus::Rejected;
        assert!(!decide(&order, now, hours(96)).can_appeal);
    }
}
