//! OpenSASE Fulfillment - marketplace redemption gate, appeals and GetCID service

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opensase_fulfillment::api::{self, AppState, Integrations};
use opensase_fulfillment::blob::{BlobStore, HttpBlobStore};
use opensase_fulfillment::clock::SystemClock;
use opensase_fulfillment::config::Config;
use opensase_fulfillment::getcid::GetCidClient;
use opensase_fulfillment::notify::{LogNotifier, Notifier, ResendNotifier};
use opensase_fulfillment::store::PgStore;
use opensase_fulfillment::sync::{SellerAccount, SpApiClient};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).with(tracing_subscriber::fmt::layer()).init();
    let config = Config::from_env()?;
    let db = PgPoolOptions::new().max_connections(10).connect(&config.database_url).await?;
    sqlx::migrate!("./migrations").run(&db).await?;

    let nats = match config.nats_url.as_deref() {
        Some(url) => match async_nats::connect(url).await {
            Ok(client) => Some(client),
            Err(e) => { tracing::warn!(error = %e, "NATS unavailable, events will not be published"); None }
        },
        None => None,
    };

    let timeout = config.upstream_timeout;
    let blobs: Option<Arc<dyn BlobStore>> = match &config.storage {
        Some(s) => Some(Arc::new(HttpBlobStore::new(&s.url, s.service_key.clone(), s.bucket.clone(), timeout)?)),
        None => { tracing::warn!("storage not configured, appeal uploads disabled"); None }
    };
    let notifier: Arc<dyn Notifier> = match &config.email {
        Some(e) => Arc::new(ResendNotifier::new(e.resend_api_key.clone(), e.from.clone(), timeout)?),
        None => Arc::new(LogNotifier),
    };
    let mut marketplaces = Vec::with_capacity(config.seller_accounts.len());
    for account in &config.seller_accounts {
        let client = SpApiClient::new(account.credentials.clone(), timeout)?;
        marketplaces.push(SellerAccount::new(account.name.clone(), Arc::new(client)));
    }
    if marketplaces.is_empty() {
        tracing::warn!("SP-API not configured, order and refund sync disabled");
    }
    let deps = Integrations {
        provider: Arc::new(GetCidClient::new(&config.getcid_base_url, timeout)?),
        blobs,
        notifier,
        marketplaces,
        nats,
        clock: Arc::new(SystemClock),
    };

    let state = AppState::assemble(Arc::new(PgStore::new(db)), deps, &config);
    let app = api::router(state);

    tracing::info!("🚀 OpenSASE Fulfillment listening on 0.0.0.0:{}", config.port);
    axum::serve(tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?, app).await?;
    Ok(())
}
