//! GetCID confirmation-id token pool.
//!
//! Each request takes one unit from the per-order quota (customer requests
//! only) and one unit from the best token before the provider is called.
//! Both are given back unless the provider answers with a confirmation id,
//! so counters move by exactly one per success and never pass capacity.

pub mod classify;
pub mod client;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::clock::Clock;
use crate::domain::aggregates::{ComboCatalog, GetCidToken, TokenSummary};
use crate::domain::events::{ActivationEvent, DomainEvent};
use crate::domain::value_objects::{InstallationId, MarketplaceOrderId};
use crate::effects::Effect;
use crate::store::{GetCidUsage, OrderStore, TokenStore, UsageLog};
use crate::{FulfillmentError, Result};

pub use classify::{CidOutcome, GetCidGrammar, ResponseClassifier};
pub use client::{CidProvider, GetCidClient, ProviderError};

const QUOTA_EXHAUSTED: &str = "This code has already been used for Confirmation ID generation. Please contact support if you need assistance.";
const POOL_EMPTY: &str = "Confirmation ID service is temporarily unavailable. Please try again later.";

/// Who is asking for a confirmation id.
#[derive(Clone, Debug)]
pub enum Caller {
    /// A customer activating a marketplace order; subject to the order quota.
    Customer { order_id: String },
    /// Support staff; no order quota.
    Internal { label: String },
}

impl Caller {
    fn identifier(&self) -> &str {
        match self { Self::Customer { order_id } => order_id, Self::Internal { label } => label }
    }
    fn identifier_type(&self) -> &'static str {
        match self { Self::Customer { .. } => "order_id", Self::Internal { .. } => "internal" }
    }
}

#[derive(Clone, Debug)]
pub struct CidRequest {
    pub caller: Caller,
    pub installation_id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CidResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_id: Option<String>,
    pub message: String,
    pub status: CidOutcome,
    pub can_retry: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_uses: Option<i32>,
}

impl CidResponse {
    fn from_outcome(outcome: CidOutcome, confirmation_id: Option<String>, remaining_uses: Option<i32>) -> Self {
        Self {
            success: outcome.is_success(),
            confirmation_id,
            message: outcome.message().to_string(),
            status: outcome,
            can_retry: outcome.is_retryable(),
            remaining_uses,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TokenList {
    pub tokens: Vec<GetCidToken>,
    pub summary: TokenSummary,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddToken {
    #[validate(length(min = 8, max = 128, message = "Invalid token"))]
    pub token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateToken {
    #[serde(alias = "is_active")]
    pub is_active: Option<bool>,
    pub priority: Option<i32>,
}

/// Order slot taken for the duration of one provider call.
struct SlotHold {
    order_id: String,
    cap: i32,
    used: i32,
}

pub struct TokenPool {
    tokens: Arc<dyn TokenStore>,
    orders: Arc<dyn OrderStore>,
    usage: Arc<dyn UsageLog>,
    provider: Arc<dyn CidProvider>,
    classifier: Arc<dyn ResponseClassifier>,
    combos: ComboCatalog,
    clock: Arc<dyn Clock>,
}

impl TokenPool {
    pub fn new(
        tokens: Arc<dyn TokenStore>,
        orders: Arc<dyn OrderStore>,
        usage: Arc<dyn UsageLog>,
        provider: Arc<dyn CidProvider>,
        combos: ComboCatalog,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { tokens, orders, usage, provider, classifier: Arc::new(GetCidGrammar), combos, clock }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ResponseClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub async fn generate(&self, req: CidRequest) -> Result<(CidResponse, Vec<Effect>)> {
        let iid = InstallationId::parse(&req.installation_id)?;
        let slot = match &req.caller {
            Caller::Customer { order_id } => Some(self.reserve_order_slot(order_id).await?),
            Caller::Internal { .. } => None,
        };

        let token = match self.tokens.reserve_token().await {
            Ok(Some(token)) => token,
            Ok(None) => {
                tracing::warn!(caller = req.caller.identifier(), "no GetCID token with capacity left");
                self.release(None, slot.as_ref()).await;
                return Err(FulfillmentError::Unavailable(POOL_EMPTY.into()));
            }
            Err(e) => {
                self.release(None, slot.as_ref()).await;
                return Err(e.into());
            }
        };

        let started = std::time::Instant::now();
        let answer = self.provider.confirmation_id(&iid, &token.token).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (outcome, raw) = match &answer {
            Ok(raw) => (Some(self.classifier.classify(raw)), raw.clone()),
            Err(e) => (None, e.to_string()),
        };
        let api_status = match (&outcome, &answer) {
            (Some(o), _) => o.as_str().to_string(),
            (None, Err(ProviderError::Timeout)) => "timeout".to_string(),
            (None, _) => "upstream_error".to_string(),
        };
        let success = outcome.map_or(false, |o| o.is_success());
        tracing::info!(
            caller = req.caller.identifier(),
            token = %token.redacted(),
            status = %api_status,
            elapsed_ms,
            "GetCID request finished"
        );

        self.append_usage(&req, &iid, &raw, &api_status, success, token.id).await;

        if !success {
            self.release(Some(&token), slot.as_ref()).await;
        }

        match (outcome, answer) {
            (Some(o), Ok(raw)) if o.is_success() => {
                let remaining = slot.as_ref().map(|s| (s.cap - s.used).max(0));
                let event = DomainEvent::Activation(ActivationEvent::ConfirmationIssued {
                    identifier: req.caller.identifier().to_string(),
                    token_id: token.id,
                });
                Ok((CidResponse::from_outcome(o, Some(raw), remaining), vec![Effect::Publish(event)]))
            }
            (Some(o), _) => {
                if o == CidOutcome::TokenError {
                    tracing::warn!(token = %token.redacted(), "provider rejected token");
                }
                Ok((CidResponse::from_outcome(o, None, None), Vec::new()))
            }
            (None, Err(e)) => Err(e.into()),
            (None, Ok(_)) => Err(FulfillmentError::Upstream("unclassified provider answer".into())),
        }
    }

    async fn reserve_order_slot(&self, order_id: &str) -> Result<SlotHold> {
        let order_id = MarketplaceOrderId::new(order_id)?;
        let order = self
            .orders
            .find_order(order_id.as_str())
            .await?
            .ok_or_else(|| FulfillmentError::not_found("Invalid order ID"))?;
        let cap = order.getcid_cap(&self.combos);
        if order.getcid_quota_exhausted(&self.combos) {
            return Err(FulfillmentError::policy(QUOTA_EXHAUSTED));
        }
        let used = self
            .orders
            .reserve_getcid_slot(order_id.as_str(), cap)
            .await?
            .ok_or_else(|| FulfillmentError::policy(QUOTA_EXHAUSTED))?;
        Ok(SlotHold { order_id: order_id.to_string(), cap, used })
    }

    /// Gives back reservations after a call that produced no confirmation id.
    async fn release(&self, token: Option<&GetCidToken>, slot: Option<&SlotHold>) {
        if let Some(token) = token {
            if let Err(e) = self.tokens.release_token(token.id).await {
                tracing::error!(token_id = %token.id, error = %e, "token release failed");
            }
        }
        if let Some(slot) = slot {
            if let Err(e) = self.orders.release_getcid_slot(&slot.order_id, slot.cap).await {
                tracing::error!(order_id = %slot.order_id, error = %e, "order quota release failed");
            }
        }
    }

    async fn append_usage(&self, req: &CidRequest, iid: &InstallationId, raw: &str, api_status: &str, success: bool, token_id: Uuid) {
        let row = GetCidUsage {
            id: Uuid::now_v7(),
            identifier: req.caller.identifier().to_string(),
            identifier_type: req.caller.identifier_type(),
            installation_id: iid.to_string(),
            confirmation_id: success.then(|| raw.trim().to_string()),
            api_response: raw.to_string(),
            api_status: api_status.to_string(),
            token_id: Some(token_id),
            ip_address: req.ip_address.clone(),
            user_agent: req.user_agent.clone(),
            created_at: self.clock.now(),
        };
        if let Err(e) = self.usage.append_usage(&row).await {
            tracing::error!(identifier = %row.identifier, status = api_status, error = %e, "GetCID usage log write failed");
        }
    }

    // ---- admin ----

    pub async fn list(&self) -> Result<TokenList> {
        let tokens = self.tokens.list_tokens().await?;
        let summary = TokenSummary::of(&tokens);
        Ok(TokenList { tokens, summary })
    }

    /// Verifies a new token with the provider and adds it at the top priority.
    pub async fn add(&self, req: AddToken) -> Result<GetCidToken> {
        req.validate()?;
        let usage = self.provider.verify_token(req.token.trim()).await?;
        let priority = self.tokens.max_priority().await?.unwrap_or(0) + 1;
        let token = GetCidToken::new(&req.token, usage, priority, self.clock.now());
        let stored = self.tokens.upsert_token(&token).await?;
        tracing::info!(token_id = %stored.id, token = %stored.redacted(), priority, "GetCID token added");
        Ok(stored)
    }

    pub async fn update(&self, id: Uuid, req: UpdateToken) -> Result<GetCidToken> {
        let token = self
            .tokens
            .update_token_settings(id, req.is_active, req.priority, self.clock.now())
            .await?
            .ok_or_else(|| FulfillmentError::not_found("Token not found"))?;
        tracing::info!(token_id = %id, active = token.is_active, priority = token.priority, "GetCID token updated");
        Ok(token)
    }

    /// Overwrites local counters with the provider's ledger.
    pub async fn resync(&self, id: Uuid) -> Result<GetCidToken> {
        let token = self.tokens.find_token(id).await?.ok_or_else(|| FulfillmentError::not_found("Token not found"))?;
        let usage = self.provider.verify_token(&token.token).await?;
        let updated = self
            .tokens
            .overwrite_usage(id, &usage, self.clock.now())
            .await?
            .ok_or_else(|| FulfillmentError::not_found("Token not found"))?;
        if updated.count_used != token.count_used {
            tracing::info!(token_id = %id, local = token.count_used, provider = updated.count_used, "GetCID token drift corrected");
        }
        Ok(updated)
    }

    pub async fn remove(&self, id: Uuid) -> Result<()> {
        if !self.tokens.delete_token(id).await? {
            return Err(FulfillmentError::not_found("Token not found"));
        }
        tracing::info!(token_id = %id, "GetCID token removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::client::testing::ScriptedProvider;
    use super::*;
    use crate::clock::SystemClock;
    use crate::domain::aggregates::order::sample_order;
    use crate::domain::aggregates::token::sample_token;
    use crate::domain::aggregates::TokenUsage;
    use crate::store::MemoryStore;

    const ORDER: &str = "408-1234567-1234567";
    const CID: &str = "123456789012345678901234567890123456789012345678";

    fn iid() -> String { "1234567 ".repeat(9).trim().to_string() }

    fn pool(store: &Arc<MemoryStore>, provider: Arc<ScriptedProvider>) -> TokenPool {
        TokenPool::new(
            store.clone(),
            store.clone(),
            store.clone(),
            provider,
            ComboCatalog::from_csv("WIN11-PP2021_COMBO"),
            Arc::new(SystemClock),
        )
    }

    fn customer() -> CidRequest {
        CidRequest {
            caller: Caller::Customer { order_id: ORDER.into() },
            installation_id: iid(),
            ip_address: Some("203.0.113.7".into()),
            user_agent: Some("test".into()),
        }
    }

    fn internal() -> CidRequest {
        CidRequest { caller: Caller::Internal { label: "support".into() }, ..customer() }
    }

    async fn seed_token(store: &MemoryStore, used: i32, capacity: i32) -> GetCidToken {
        store.upsert_token(&sample_token("tok-primary", used, capacity, 5)).await.unwrap()
    }

    #[tokio::test]
    async fn test_success_consumes_one_unit_each() {
        let store = Arc::new(MemoryStore::new());
        store.seed_order(sample_order(ORDER)).await;
        let token = seed_token(&store, 0, 10).await;
        let provider = Arc::new(ScriptedProvider::always(CID));

        let (resp, effects) = pool(&store, provider).generate(customer()).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.confirmation_id.as_deref(), Some(CID));
        assert_eq!(resp.remaining_uses, Some(0));
        assert_eq!(effects.len(), 1);

        assert_eq!(store.find_token(token.id).await.unwrap().unwrap().count_used, 1);
        let order = store.find_order(ORDER).await.unwrap().unwrap();
        assert_eq!((order.getcid_used_count, order.getcid_used), (1, true));
        let log = store.usage_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!((log[0].api_status.as_str(), log[0].identifier_type), ("success", "order_id"));
    }

    #[tokio::test]
    async fn test_failure_releases_reservations() {
        let store = Arc::new(MemoryStore::new());
        store.seed_order(sample_order(ORDER)).await;
        let token = seed_token(&store, 0, 10).await;
        let provider = Arc::new(ScriptedProvider::always("Server too busy"));

        let (resp, effects) = pool(&store, provider).generate(customer()).await.unwrap();
        assert!(!resp.success && resp.can_retry);
        assert_eq!(resp.message, CidOutcome::ServerBusy.message());
        assert!(effects.is_empty());

        assert_eq!(store.find_token(token.id).await.unwrap().unwrap().count_used, 0);
        assert_eq!(store.find_order(ORDER).await.unwrap().unwrap().getcid_used_count, 0);
        assert_eq!(store.usage_log().await[0].api_status, "server_busy");
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_and_logged() {
        let store = Arc::new(MemoryStore::new());
        store.seed_order(sample_order(ORDER)).await;
        let token = seed_token(&store, 0, 10).await;
        let provider = Arc::new(ScriptedProvider::default().then(Err(ProviderError::Timeout)));

        let err = pool(&store, provider).generate(customer()).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Timeout(_)));
        assert_eq!(store.find_token(token.id).await.unwrap().unwrap().count_used, 0);
        assert_eq!(store.usage_log().await[0].api_status, "timeout");
    }

    #[tokio::test]
    async fn test_order_quota_blocks_before_provider() {
        for (qty, fsn) in [(2, "WIN11PRO"), (1, "WIN11-PP2021_COMBO")] {
            let store = Arc::new(MemoryStore::new());
            let mut order = sample_order(ORDER);
            order.quantity = qty;
            order.fsn = Some(fsn.into());
            store.seed_order(order).await;
            seed_token(&store, 0, 10).await;
            let provider = Arc::new(ScriptedProvider::always(CID));
            let pool = pool(&store, provider.clone());

            assert!(pool.generate(customer()).await.unwrap().0.success);
            assert!(pool.generate(customer()).await.unwrap().0.success);
            let third = pool.generate(customer()).await.unwrap_err();
            assert!(matches!(third, FulfillmentError::Policy(m) if m == QUOTA_EXHAUSTED));
            assert_eq!(provider.calls(), 2);
        }
    }

    #[tokio::test]
    async fn test_bad_iid_consumes_nothing() {
        let store = Arc::new(MemoryStore::new());
        store.seed_order(sample_order(ORDER)).await;
        let token = seed_token(&store, 0, 10).await;
        let provider = Arc::new(ScriptedProvider::always(CID));
        let mut req = customer();
        req.installation_id = "12345".into();

        assert!(matches!(pool(&store, provider.clone()).generate(req).await, Err(FulfillmentError::Validation(_))));
        assert_eq!(provider.calls(), 0);
        assert_eq!(store.find_token(token.id).await.unwrap().unwrap().count_used, 0);
        assert!(store.usage_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_requests_never_exceed_capacity() {
        let store = Arc::new(MemoryStore::new());
        let token = seed_token(&store, 0, 3).await;
        let provider = Arc::new(ScriptedProvider::always(CID));
        let pool = Arc::new(pool(&store, provider));

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..10 {
            let pool = pool.clone();
            set.spawn(async move { pool.generate(internal()).await });
        }
        let (mut ok, mut unavailable) = (0, 0);
        while let Some(result) = set.join_next().await {
            match result.unwrap() {
                Ok((resp, _)) if resp.success => ok += 1,
                Err(FulfillmentError::Unavailable(_)) => unavailable += 1,
                other => panic!("unexpected result: {other:?}"),
            }
        }
        assert_eq!((ok, unavailable), (3, 7));
        assert_eq!(store.find_token(token.id).await.unwrap().unwrap().count_used, 3);
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_request() {
        let store = Arc::new(MemoryStore::new());
        seed_token(&store, 0, 5).await;
        store.fail_audit_writes(true);
        let provider = Arc::new(ScriptedProvider::always(CID));
        assert!(pool(&store, provider).generate(internal()).await.unwrap().0.success);
    }

    #[tokio::test]
    async fn test_admin_add_and_resync() {
        let store = Arc::new(MemoryStore::new());
        seed_token(&store, 0, 10).await;
        let usage = TokenUsage { email: Some("ops@example.in".into()), count_used: 4, total_available: 50 };
        let provider = Arc::new(ScriptedProvider::default().with_usage(usage));
        let pool = pool(&store, provider);

        let added = pool.add(AddToken { token: "NEWTOKEN123".into() }).await.unwrap();
        assert_eq!((added.token.as_str(), added.priority, added.count_used), ("newtoken123", 6, 4));
        assert!(matches!(pool.add(AddToken { token: "short".into() }).await, Err(FulfillmentError::Validation(_))));

        store.overwrite_usage(added.id, &TokenUsage { email: None, count_used: 1, total_available: 50 }, chrono::Utc::now()).await.unwrap();
        assert_eq!(pool.resync(added.id).await.unwrap().count_used, 4);

        let list = pool.list().await.unwrap();
        assert_eq!(list.summary.total_tokens, 2);
        assert_eq!(list.tokens[0].id, added.id);

        let off = pool.update(added.id, UpdateToken { is_active: Some(false), priority: None }).await.unwrap();
        assert!(!off.is_active);
        pool.remove(added.id).await.unwrap();
        assert!(matches!(pool.remove(added.id).await, Err(FulfillmentError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rejected_token_is_not_added() {
        let store = Arc::new(MemoryStore::new());
        let pool = pool(&store, Arc::new(ScriptedProvider::default()));
        let err = pool.add(AddToken { token: "bogus-token".into() }).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Validation(m) if m == "Invalid token - verification failed"));
        assert!(pool.list().await.unwrap().tokens.is_empty());
    }
}
