//! License key claim behind the redemption gate.

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::{RedemptionChecker, RedemptionDecision};
use crate::clock::Clock;
use crate::domain::aggregates::{LicenseKey, Order};
use crate::domain::events::{ActivationEvent, DomainEvent};
use crate::domain::value_objects::MarketplaceOrderId;
use crate::effects::Effect;
use crate::store::{KeyClaim, LicenseKeyStore, OrderStore, RedemptionRecord};
use crate::{FulfillmentError, Result};

const NO_KEYS: &str = "No license keys available. Please contact support.";

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemOutcome {
    pub already_redeemed: bool,
    pub license_key: String,
    pub sku: String,
}

pub struct RedemptionService {
    orders: Arc<dyn OrderStore>,
    keys: Arc<dyn LicenseKeyStore>,
    checker: Arc<RedemptionChecker>,
    clock: Arc<dyn Clock>,
}

impl RedemptionService {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        keys: Arc<dyn LicenseKeyStore>,
        checker: Arc<RedemptionChecker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { orders, keys, checker, clock }
    }

    pub async fn find_order(&self, order_id: &str) -> Result<Order> {
        let order_id = MarketplaceOrderId::new(order_id)?;
        self.orders
            .find_order(order_id.as_str())
            .await?
            .ok_or_else(|| FulfillmentError::not_found("Order ID not found"))
    }

    /// Read-only gate check for an order id.
    pub async fn check(&self, order_id: &str) -> Result<RedemptionDecision> {
        let order = self.find_order(order_id).await?;
        self.checker.check(&order).await
    }

    /// Hands out the order's license key, claiming one if the gate is open.
    ///
    /// Repeated calls return the key already linked to the order. The
    /// redemption log write is advisory: if it fails the key is still returned.
    pub async fn redeem(&self, order_id: &str) -> Result<(RedeemOutcome, Vec<Effect>)> {
        let order = self.find_order(order_id).await?;

        if let Some(key_id) = order.license_key_id {
            if let Some(key) = self.keys.find_key(key_id).await? {
                return Ok((outcome(key, true), Vec::new()));
            }
            tracing::warn!(order_id = %order.order_id, %key_id, "order links a missing license key");
        }

        let decision = self.checker.check(&order).await?;
        if !decision.can_redeem {
            let reason = decision.reason.unwrap_or_else(|| "Redemption is not available yet.".to_string());
            return Err(FulfillmentError::Policy(reason));
        }

        let sku = order.fsn.as_deref().ok_or_else(|| FulfillmentError::Unavailable(NO_KEYS.into()))?;
        let now = self.clock.now();
        let key = match self.keys.claim_key(sku, order.order_id.as_str(), now).await? {
            KeyClaim::Claimed(key) => key,
            KeyClaim::AlreadyLinked(key) => {
                tracing::info!(order_id = %order.order_id, key_id = %key.id, "concurrent redemption already linked a key");
                return Ok((outcome(key, true), Vec::new()));
            }
            KeyClaim::PoolEmpty => {
                tracing::warn!(order_id = %order.order_id, sku, "license key pool empty");
                return Err(FulfillmentError::Unavailable(NO_KEYS.into()));
            }
        };

        let record = RedemptionRecord { id: Uuid::now_v7(), order_id: order.order_id.to_string(), license_key_id: key.id, created_at: now };
        if let Err(e) = self.keys.append_redemption(&record).await {
            tracing::error!(order_id = %order.order_id, key_id = %key.id, error = %e, "redemption log write failed");
        }
        tracing::info!(order_id = %order.order_id, key_id = %key.id, sku, "license key assigned");

        let event = DomainEvent::Activation(ActivationEvent::KeyAssigned { order_id: order.order_id.to_string(), license_key_id: key.id });
        Ok((outcome(key, false), vec![Effect::Publish(event)]))
    }
}

fn outcome(key: LicenseKey, already_redeemed: bool) -> RedeemOutcome {
    RedeemOutcome { already_redeemed, license_key: key.license_key, sku: key.sku }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::aggregates::order::sample_order;
    use crate::domain::aggregates::AppealStatus;
    use crate::domain::value_objects::DelayHours;
    use crate::state_delays::StateDelays;
    use crate::store::MemoryStore;
    use chrono::{Duration, Utc};

    const ORDER: &str = "408-1234567-1234567";

    fn free_key(value: &str) -> LicenseKey {
        LicenseKey {
            id: Uuid::now_v7(),
            license_key: value.into(),
            sku: "WIN11PRO".into(),
            order_id: None,
            is_assigned: false,
            assigned_at: None,
        }
    }

    async fn setup(order: Order) -> (Arc<MemoryStore>, RedemptionService) {
        let store = Arc::new(MemoryStore::new());
        store.seed_order(order).await;
        store.seed_key(free_key("XXXXX-XXXXX-XXXXX-XXXXX-AAAAA")).await;
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let delays = Arc::new(StateDelays::new(store.clone(), clock.clone(), Duration::minutes(5), DelayHours::from_stored(96)));
        let checker = Arc::new(RedemptionChecker::new(delays, clock.clone()));
        (store.clone(), RedemptionService::new(store.clone(), store, checker, clock))
    }

    #[tokio::test]
    async fn test_redeem_is_idempotent() {
        let mut order = sample_order(ORDER);
        order.early_appeal_status = AppealStatus::Approved;
        let (store, service) = setup(order).await;

        let (first, effects) = service.redeem(ORDER).await.unwrap();
        assert!(!first.already_redeemed);
        assert_eq!(effects.len(), 1);
        let (second, _) = service.redeem(ORDER).await.unwrap();
        assert!(second.already_redeemed);
        assert_eq!(first.license_key, second.license_key);
        assert_eq!(store.redemptions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_gate_blocks_claim() {
        let (_, service) = setup(sample_order(ORDER)).await;
        assert!(matches!(service.redeem(ORDER).await, Err(FulfillmentError::Policy(_))));
    }

    #[tokio::test]
    async fn test_log_failure_still_delivers_key() {
        let mut order = sample_order(ORDER);
        order.synced_at = Some(Utc::now() - Duration::days(10));
        let (store, service) = setup(order).await;
        store.fail_audit_writes(true);

        let (outcome, _) = service.redeem(ORDER).await.unwrap();
        assert_eq!(outcome.sku, "WIN11PRO");
        assert!(store.find_order(ORDER).await.unwrap().unwrap().license_key_id.is_some());
        assert!(store.redemptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_pool_is_unavailable() {
        let mut order = sample_order(ORDER);
        order.fsn = Some("OFFICE2021".into());
        order.early_appeal_status = AppealStatus::Approved;
        let (_, service) = setup(order).await;
        assert!(matches!(service.redeem(ORDER).await, Err(FulfillmentError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_unknown_order() {
        let (_, service) = setup(sample_order(ORDER)).await;
        assert!(matches!(service.check("171-0000000-0000000").await, Err(FulfillmentError::NotFound(_))));
        assert!(matches!(service.check("nope").await, Err(FulfillmentError::Validation(_))));
    }

    #[tokio::test]
    async fn test_claim_keeps_the_key_already_linked() {
        let mut order = sample_order(ORDER);
        order.early_appeal_status = AppealStatus::Approved;
        let (store, _) = setup(order).await;
        store.seed_key(free_key("XXXXX-XXXXX-XXXXX-XXXXX-BBBBB")).await;

        let first = match store.claim_key("WIN11PRO", ORDER, Utc::now()).await.unwrap() {
            KeyClaim::Claimed(key) => key,
            other => panic!("expected a fresh claim, got {other:?}"),
        };
        match store.claim_key("WIN11PRO", ORDER, Utc::now()).await.unwrap() {
            KeyClaim::AlreadyLinked(key) => assert_eq!(key.id, first.id),
            other => panic!("expected the linked key, got {other:?}"),
        }
        assert_eq!(store.free_keys("WIN11PRO").await, 1);
        assert_eq!(store.find_order(ORDER).await.unwrap().unwrap().license_key_id, Some(first.id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_redeems_claim_one_key() {
        let mut order = sample_order(ORDER);
        order.early_appeal_status = AppealStatus::Approved;
        let (store, service) = setup(order).await;
        for suffix in ["BBBBB", "CCCCC", "DDDDD"] {
            store.seed_key(free_key(&format!("XXXXX-XXXXX-XXXXX-XXXXX-{suffix}"))).await;
        }
        let service = Arc::new(service);

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let service = service.clone();
            set.spawn(async move { service.redeem(ORDER).await });
        }
        let mut keys = std::collections::HashSet::new();
        let mut fresh = 0;
        while let Some(result) = set.join_next().await {
            let (outcome, _) = result.unwrap().unwrap();
            if !outcome.already_redeemed {
                fresh += 1;
            }
            keys.insert(outcome.license_key);
        }
        assert_eq!(fresh, 1);
        assert_eq!(keys.len(), 1);
        assert_eq!(store.free_keys("WIN11PRO").await, 3);
        assert_eq!(store.redemptions().await.len(), 1);
    }
}
