//! HTTP surface: router, shared state and request plumbing.

pub mod admin;
pub mod auth;
pub mod cron;
pub mod customer;
pub mod error;

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderMap,
    middleware,
    routing::{get, patch, post, put},
    Json, Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::appeals::AppealWorkflow;
use crate::blob::BlobStore;
use crate::clock::Clock;
use crate::config::Config;
use crate::effects::EffectRunner;
use crate::getcid::{CidProvider, TokenPool};
use crate::notify::Notifier;
use crate::redemption::{RedemptionChecker, RedemptionService};
use crate::state_delays::StateDelays;
use crate::store::FulfillmentStore;
use crate::sync::{MultiItemQueue, OrderSync, SellerAccount};

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub delays: Arc<StateDelays>,
    pub redemption: Arc<RedemptionService>,
    pub appeals: Arc<AppealWorkflow>,
    pub tokens: Arc<TokenPool>,
    pub sync: Option<Arc<OrderSync>>,
    pub multi_items: Arc<MultiItemQueue>,
    pub effects: EffectRunner,
    pub admin_api_key: Option<String>,
    pub cron_secret: Option<String>,
}

/// Outbound collaborators, built by `main` from configuration or by tests.
pub struct Integrations {
    pub provider: Arc<dyn CidProvider>,
    pub blobs: Option<Arc<dyn BlobStore>>,
    pub notifier: Arc<dyn Notifier>,
    /// Seller accounts to sync; empty disables the sync jobs.
    pub marketplaces: Vec<SellerAccount>,
    pub nats: Option<async_nats::Client>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn assemble<S: FulfillmentStore + 'static>(store: Arc<S>, deps: Integrations, config: &Config) -> Self {
        let clock = deps.clock;
        let delays = Arc::new(StateDelays::new(store.clone(), clock.clone(), config.state_delay_cache_ttl, config.default_delay));
        let checker = Arc::new(RedemptionChecker::new(delays.clone(), clock.clone()));
        let redemption = Arc::new(RedemptionService::new(store.clone(), store.clone(), checker.clone(), clock.clone()));
        let appeals = Arc::new(AppealWorkflow::new(
            store.clone(),
            store.clone(),
            deps.blobs,
            checker,
            clock.clone(),
            config.app_url.clone(),
        ));
        let tokens = Arc::new(TokenPool::new(
            store.clone(),
            store.clone(),
            store.clone(),
            deps.provider,
            config.combo_products.clone(),
            clock.clone(),
        ));
        let sync = (!deps.marketplaces.is_empty()).then(|| {
            Arc::new(OrderSync::new(deps.marketplaces, store.clone(), store.clone(), store.clone(), store.clone(), clock.clone()))
        });
        let multi_items = Arc::new(MultiItemQueue::new(store.clone(), clock.clone()));
        Self {
            delays,
            redemption,
            appeals,
            tokens,
            sync,
            multi_items,
            effects: EffectRunner::new(deps.notifier, deps.nats),
            admin_api_key: config.admin_api_key.clone(),
            cron_secret: config.cron_secret.clone(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/state-delays", get(admin::list_state_delays).post(admin::create_state_delay))
        .route("/state-delays/:id", put(admin::update_state_delay).delete(admin::delete_state_delay))
        .route("/early-appeals", get(admin::list_appeals))
        .route("/early-appeals/:id", put(admin::resolve_appeal))
        .route("/getcid-tokens", get(admin::list_tokens).post(admin::add_token))
        .route("/getcid-tokens/:id", patch(admin::update_token).delete(admin::delete_token))
        .route("/getcid-tokens/:id/resync", post(admin::resync_token))
        .route("/getcid/internal", post(admin::internal_cid))
        .route("/multi-item-orders", get(admin::list_multi_item_orders))
        .route("/multi-item-orders/:id", put(admin::process_multi_item_order))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_admin));

    let cron = Router::new()
        .route("/sync-fba", get(cron::sync_fba))
        .route("/sync-mfn", get(cron::sync_mfn))
        .route("/sync-refunds", get(cron::sync_refunds))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_cron));

    Router::new()
        .route("/health", get(|| async { Json(serde_json::json!({"status": "healthy", "service": "opensase-fulfillment"})) }))
        .route("/api/v1/redemption/check", post(customer::check_redemption))
        .route("/api/v1/redemption/redeem", post(customer::redeem))
        .route("/api/v1/early-appeals", post(customer::submit_appeal).get(customer::appeal_status))
        .route("/api/v1/getcid", post(customer::generate_cid))
        .nest("/api/v1/admin", admin)
        .nest("/api/v1/cron", cron)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()).with_state(state)
}

/// First `x-forwarded-for` hop, else `x-real-ip`.
pub(crate) fn client_ip(headers: &HeaderMap) -> Option<String> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .or_else(|| header("x-real-ip"))
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

pub(crate) fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers.get(axum::http::header::USER_AGENT).and_then(|v| v.to_str().ok()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::clock::ManualClock;
    use crate::domain::aggregates::order::sample_order;
    use crate::domain::aggregates::token::sample_token;
    use crate::getcid::client::testing::ScriptedProvider;
    use crate::notify::testing::RecordingNotifier;
    use crate::store::{MemoryStore, TokenStore};
    use crate::sync::testing::{item, upstream_order, ScriptedMarketplace};
    use crate::sync::REFUND_JOB;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{Duration, Utc};
    use serde_json::Value;
    use tower::ServiceExt;

    const ORDER: &str = "408-1234567-1234567";
    const ADMIN: &str = "Bearer admin-secret";
    const BOUNDARY: &str = "X-FULFILLMENT-BOUNDARY";

    struct Harness {
        app: Router,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        clock: Arc<ManualClock>,
    }

    fn harness(provider: ScriptedProvider) -> Harness { build(provider, Vec::new(), None) }

    fn build(provider: ScriptedProvider, marketplaces: Vec<SellerAccount>, cron_secret: Option<&'static str>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = Config::from_lookup(|key| match key {
            "DATABASE_URL" => Some("postgres://unused".into()),
            "ADMIN_API_KEY" => Some("admin-secret".into()),
            "CRON_SECRET" => cron_secret.map(str::to_string),
            _ => None,
        })
        .unwrap();
        let deps = Integrations {
            provider: Arc::new(provider),
            blobs: Some(Arc::new(MemoryBlobStore::new())),
            notifier: notifier.clone(),
            marketplaces,
            nats: None,
            clock: clock.clone(),
        };
        let state = AppState::assemble(store.clone(), deps, &config);
        Harness { app: router(state), store, notifier, clock }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, body)
    }

    fn json_req(method: &str, uri: &str, auth: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri).header("content-type", "application/json");
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_req(uri: &str, auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn appeal_form(order_id: &str) -> Request<Body> {
        let mut body = Vec::new();
        for (name, value) in [("orderId", order_id), ("email", "buyer@example.in"), ("whatsapp", "+91 98765 43210")] {
            body.extend(format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes());
        }
        body.extend(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"proofImage\"; filename=\"proof.png\"\r\nContent-Type: image/png\r\n\r\n")
                .as_bytes(),
        );
        body.extend([0x89, b'P', b'N', b'G']);
        body.extend(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri("/api/v1/early-appeals")
            .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness(ScriptedProvider::default());
        let (status, body) = send(&h.app, get_req("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "opensase-fulfillment");
    }

    #[tokio::test]
    async fn test_admin_and_cron_require_bearer() {
        let h = harness(ScriptedProvider::default());
        let (status, _) = send(&h.app, get_req("/api/v1/admin/state-delays", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(&h.app, get_req("/api/v1/admin/state-delays", Some("Bearer wrong"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(&h.app, get_req("/api/v1/admin/state-delays", Some(ADMIN))).await;
        assert_eq!(status, StatusCode::OK);
        // No CRON_SECRET configured: cron routes are closed.
        let (status, _) = send(&h.app, get_req("/api/v1/cron/sync-fba", Some("Bearer anything"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_early_appeal_unblocks_redemption() {
        let h = harness(ScriptedProvider::default());
        let mut order = sample_order(ORDER);
        order.state = Some("DELHI".into());
        order.synced_at = Some(h.clock.now() - Duration::days(1));
        h.store.seed_order(order).await;

        let (status, _) = send(
            &h.app,
            json_req("POST", "/api/v1/admin/state-delays", Some(ADMIN), serde_json::json!({"state_name": "delhi", "delay_hours": 48})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let check = || json_req("POST", "/api/v1/redemption/check", None, serde_json::json!({"orderId": ORDER}));
        let (status, body) = send(&h.app, check()).await;
        assert_eq!(status, StatusCode::OK);
        let decision = &body["decision"];
        assert_eq!(decision["canRedeem"], false);
        assert_eq!(decision["canAppeal"], true);
        assert_eq!(decision["daysRemaining"], 1);

        let (status, body) = send(&h.app, appeal_form(ORDER)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let appeal_id = body["appealId"].as_str().unwrap().to_string();

        let (_, body) = send(&h.app, get_req(&format!("/api/v1/early-appeals?orderId={ORDER}"), None)).await;
        assert_eq!(body["appeal"]["status"], "PENDING");
        let (status, _) = send(&h.app, appeal_form(ORDER)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(
            &h.app,
            json_req("PUT", &format!("/api/v1/admin/early-appeals/{appeal_id}"), Some(ADMIN), serde_json::json!({"action": "APPROVE"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Appeal approved successfully");
        assert_eq!(h.notifier.sent().len(), 1);

        let (_, body) = send(&h.app, check()).await;
        assert_eq!(body["decision"]["canRedeem"], true);
    }

    #[tokio::test]
    async fn test_getcid_quota_over_http() {
        let h = harness(ScriptedProvider::always("123456789012345678901234567890123456789012345678"));
        h.store.seed_order(sample_order(ORDER)).await;
        h.store.upsert_token(&sample_token("tok-primary", 0, 10, 1)).await.unwrap();
        let iid = "1234567".repeat(9);
        let req = || {
            json_req(
                "POST",
                "/api/v1/getcid",
                None,
                serde_json::json!({"identifier": ORDER, "identifierType": "order_id", "installationId": iid}),
            )
        };

        let (status, body) = send(&h.app, req()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Confirmation ID generated successfully!");

        let (status, body) = send(&h.app, req()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["error"].as_str().unwrap().starts_with("This code has already been used"));

        let (status, body) = send(&h.app, json_req("POST", "/api/v1/getcid", None, serde_json::json!({"identifier": ORDER}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing required fields");
    }

    #[tokio::test]
    async fn test_provider_failure_is_reported_in_body() {
        let h = harness(ScriptedProvider::always("Wrong IID"));
        h.store.upsert_token(&sample_token("tok-primary", 0, 10, 1)).await.unwrap();
        let (status, body) = send(
            &h.app,
            json_req("POST", "/api/v1/admin/getcid/internal", Some(ADMIN), serde_json::json!({"installationId": "1234567".repeat(9)})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["canRetry"], true);
        assert_eq!(body["error"], "Invalid Installation ID. Please check and try again.");
    }

    #[tokio::test]
    async fn test_synced_refund_closes_redemption_and_appeals() {
        let api = Arc::new(ScriptedMarketplace::default().with_refund(ORDER));
        let h = build(ScriptedProvider::default(), vec![SellerAccount::new("default", api)], Some("cron"));
        let mut order = sample_order(ORDER);
        order.synced_at = Some(h.clock.now() - Duration::hours(10));
        h.store.seed_order(order).await;

        let check = || json_req("POST", "/api/v1/redemption/check", None, serde_json::json!({"orderId": ORDER}));
        let (_, body) = send(&h.app, check()).await;
        assert_eq!(body["decision"]["canAppeal"], true);

        let (status, _) = send(&h.app, get_req("/api/v1/cron/sync-refunds", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, body) = send(&h.app, get_req("/api/v1/cron/sync-refunds", Some("Bearer cron"))).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["report"]["ordersRefunded"], 1);

        let (_, body) = send(&h.app, check()).await;
        let decision = &body["decision"];
        assert_eq!(decision["canRedeem"], false);
        assert_eq!(decision["canAppeal"], false);
        assert_eq!(decision["block"], "refunded");

        let (status, body) = send(&h.app, appeal_form(ORDER)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.to_string().contains("refunded"));

        let runs = h.store.cron_runs().await;
        assert_eq!((runs[0].job_name.as_str(), runs[0].status), (REFUND_JOB, "success"));
    }

    #[tokio::test]
    async fn test_multi_item_queue_over_http() {
        let api = Arc::new(ScriptedMarketplace::default().with_order(
            upstream_order(ORDER, "Shipped", None),
            vec![item("B0WIN11", "SKU-WIN"), item("B0OFF", "SKU-OFF")],
        ));
        let h = build(ScriptedProvider::default(), vec![SellerAccount::new("default", api)], Some("cron"));
        let (status, _) = send(&h.app, get_req("/api/v1/cron/sync-mfn", Some("Bearer cron"))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&h.app, get_req("/api/v1/admin/multi-item-orders", Some(ADMIN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["orders"][0]["orderId"], ORDER);
        assert_eq!(body["orders"][0]["itemCount"], 2);
        let id = body["orders"][0]["id"].as_str().unwrap().to_string();

        let uri = format!("/api/v1/admin/multi-item-orders/{id}");
        let (status, body) = send(&h.app, json_req("PUT", &uri, Some(ADMIN), serde_json::json!({"adminNotes": "sent by email"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["order"]["status"], "PROCESSED");
        let (status, _) = send(&h.app, json_req("PUT", &uri, Some(ADMIN), serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) = send(&h.app, get_req("/api/v1/admin/multi-item-orders", Some(ADMIN))).await;
        assert_eq!(body["total"], 0);
        let (_, body) = send(&h.app, get_req("/api/v1/admin/multi-item-orders?status=ALL", Some(ADMIN))).await;
        assert_eq!(body["total"], 1);
        let (status, _) = send(&h.app, get_req("/api/v1/admin/multi-item-orders?status=DONE", Some(ADMIN))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sync_without_marketplace_is_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let config = Config::from_lookup(|key| match key {
            "DATABASE_URL" => Some("postgres://unused".into()),
            "CRON_SECRET" => Some("cron".into()),
            _ => None,
        })
        .unwrap();
        let deps = Integrations {
            provider: Arc::new(ScriptedProvider::default()),
            blobs: None,
            notifier: Arc::new(RecordingNotifier::default()),
            marketplaces: Vec::new(),
            nats: None,
            clock: Arc::new(ManualClock::new(Utc::now())),
        };
        let app = router(AppState::assemble(store, deps, &config));
        let (status, _) = send(&app, get_req("/api/v1/cron/sync-mfn", Some("Bearer cron"))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "10.0.0.9".parse().unwrap());
        assert_eq!(client_ip(&headers).as_deref(), Some("10.0.0.9"));
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers).as_deref(), Some("203.0.113.7"));
    }
}
