//! Per-region shipping delays with a read-through TTL cache.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;
use validator::Validate;

use crate::clock::Clock;
use crate::domain::aggregates::StateDelayEntry;
use crate::domain::value_objects::{DelayHours, RegionKey};
use crate::store::StateDelayStore;
use crate::{FulfillmentError, Result};

pub const DEFAULT_DELAY_HOURS: i32 = 96;
pub const DEFAULT_CACHE_TTL_SECS: i64 = 300;

type DelayMap = HashMap<String, DelayHours>;

struct Snapshot {
    delays: Arc<DelayMap>,
    expires_at: DateTime<Utc>,
}

/// Region to delay cache owned by [`StateDelays`].
pub struct DelayCache {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    slot: RwLock<Option<Snapshot>>,
}

impl DelayCache {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { clock, ttl, slot: RwLock::new(None) }
    }

    /// Cached delay for a normalised key, fresh or not.
    pub fn get(&self, key: &str) -> Option<DelayHours> {
        self.snapshot().and_then(|m| m.get(key).copied())
    }

    pub fn is_fresh(&self) -> bool { self.fresh_snapshot().is_some() }

    /// Replaces the whole cache and restarts the TTL.
    pub fn refresh_all(&self, entries: &[StateDelayEntry]) -> Arc<DelayMap> {
        let delays: Arc<DelayMap> =
            Arc::new(entries.iter().map(|e| (e.state_name.as_str().to_string(), e.delay_hours)).collect());
        let expires_at = self.clock.now() + self.ttl;
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = Some(Snapshot { delays: delays.clone(), expires_at });
        delays
    }

    pub fn invalidate(&self) {
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn fresh_snapshot(&self) -> Option<Arc<DelayMap>> {
        let now = self.clock.now();
        let slot = self.slot.read().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().filter(|s| now < s.expires_at).map(|s| s.delays.clone())
    }

    fn snapshot(&self) -> Option<Arc<DelayMap>> {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).as_ref().map(|s| s.delays.clone())
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateStateDelay {
    #[validate(length(min = 1, max = 64, message = "State name and delay hours are required"))]
    #[serde(alias = "stateName")]
    pub state_name: String,
    #[serde(alias = "delayHours")]
    pub delay_hours: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateStateDelay {
    #[validate(length(min = 1, max = 64, message = "State name must not be empty"))]
    #[serde(alias = "stateName")]
    pub state_name: Option<String>,
    #[serde(alias = "delayHours")]
    pub delay_hours: i32,
}

/// Read and admin access to the state delay table.
pub struct StateDelays {
    store: Arc<dyn StateDelayStore>,
    cache: DelayCache,
    clock: Arc<dyn Clock>,
    fallback: DelayHours,
}

impl StateDelays {
    pub fn new(store: Arc<dyn StateDelayStore>, clock: Arc<dyn Clock>, ttl: Duration, fallback: DelayHours) -> Self {
        Self { store, cache: DelayCache::new(clock.clone(), ttl), clock, fallback }
    }

    pub fn cache(&self) -> &DelayCache { &self.cache }

    /// Delay for `region`, reloading the table once the cache has expired.
    pub async fn delay_for(&self, region: Option<&str>) -> Result<DelayHours> {
        let delays = match self.cache.fresh_snapshot() {
            Some(delays) => delays,
            None => {
                let rows = self.store.list_state_delays().await?;
                tracing::debug!(rows = rows.len(), "state delay cache refreshed");
                self.cache.refresh_all(&rows)
            }
        };
        Ok(self.resolve(Some(delays.as_ref()), region))
    }

    /// Non-blocking lookup against whatever is cached; the fallback when nothing is.
    pub fn delay_for_cached(&self, region: Option<&str>) -> DelayHours {
        self.resolve(self.cache.snapshot().as_deref(), region)
    }

    pub fn invalidate(&self) { self.cache.invalidate(); }

    fn resolve(&self, delays: Option<&DelayMap>, region: Option<&str>) -> DelayHours {
        let Some(delays) = delays else { return self.fallback };
        RegionKey::normalize(region)
            .and_then(|key| delays.get(key.as_str()).copied())
            .or_else(|| delays.get(RegionKey::DEFAULT).copied())
            .unwrap_or(self.fallback)
    }

    pub async fn list(&self) -> Result<Vec<StateDelayEntry>> {
        Ok(self.store.list_state_delays().await?)
    }

    pub async fn create(&self, req: CreateStateDelay) -> Result<StateDelayEntry> {
        req.validate()?;
        let state_name = RegionKey::normalize(Some(&req.state_name))
            .ok_or_else(|| FulfillmentError::validation("State name and delay hours are required"))?;
        let delay_hours = DelayHours::new(req.delay_hours)?;
        let entry = StateDelayEntry::new(state_name, delay_hours, self.clock.now());
        self.store.insert_state_delay(&entry).await.map_err(|e| match FulfillmentError::from(e) {
            FulfillmentError::Conflict(_) => FulfillmentError::Conflict("State already exists".into()),
            other => other,
        })?;
        self.invalidate();
        tracing::info!(state = %entry.state_name, hours = delay_hours.value(), "state delay added");
        Ok(entry)
    }

    pub async fn update(&self, id: Uuid, req: UpdateStateDelay) -> Result<StateDelayEntry> {
        req.validate()?;
        let delay_hours = DelayHours::new(req.delay_hours)?;
        let state_name = match req.state_name.as_deref() {
            Some(raw) => Some(
                RegionKey::normalize(Some(raw)).ok_or_else(|| FulfillmentError::validation("State name must not be empty"))?,
            ),
            None => None,
        };
        let entry = self
            .store
            .update_state_delay(id, state_name.as_ref(), delay_hours, self.clock.now())
            .await
            .map_err(|e| match FulfillmentError::from(e) {
                FulfillmentError::Conflict(_) => FulfillmentError::Conflict("State already exists".into()),
                other => other,
            })?
            .ok_or_else(|| FulfillmentError::not_found("State not found"))?;
        self.invalidate();
        tracing::info!(%id, state = %entry.state_name, hours = delay_hours.value(), "state delay updated");
        Ok(entry)
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        if !self.store.delete_state_delay(id).await? {
            return Err(FulfillmentError::not_found("State not found"));
        }
        self.invalidate();
        tracing::info!(%id, "state delay removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, ManualClock, StateDelays) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let delays = StateDelays::new(
            store.clone(),
            Arc::new(clock.clone()),
            Duration::seconds(DEFAULT_CACHE_TTL_SECS),
            DelayHours::from_stored(DEFAULT_DELAY_HOURS),
        );
        (store, clock, delays)
    }

    fn add(name: &str, hours: i32) -> CreateStateDelay {
        CreateStateDelay { state_name: name.into(), delay_hours: hours }
    }

    #[tokio::test]
    async fn test_lookup_ignores_case_and_whitespace() {
        let (_, _, delays) = setup();
        delays.create(add("Delhi", 48)).await.unwrap();
        for region in ["Delhi", "DELHI", "  delhi "] {
            assert_eq!(delays.delay_for(Some(region)).await.unwrap().value(), 48);
        }
    }

    #[tokio::test]
    async fn test_fallback_chain() {
        let (_, _, delays) = setup();
        assert_eq!(delays.delay_for(Some("GOA")).await.unwrap().value(), DEFAULT_DELAY_HOURS);
        delays.create(add("default", 120)).await.unwrap();
        assert_eq!(delays.delay_for(Some("GOA")).await.unwrap().value(), 120);
        assert_eq!(delays.delay_for(None).await.unwrap().value(), 120);
        assert_eq!(delays.delay_for(Some("   ")).await.unwrap().value(), 120);
    }

    #[tokio::test]
    async fn test_cache_serves_until_ttl() {
        let (store, clock, delays) = setup();
        delays.create(add("KERALA", 72)).await.unwrap();
        delays.delay_for(Some("KERALA")).await.unwrap();
        delays.delay_for(Some("KERALA")).await.unwrap();
        assert_eq!(store.state_delay_reads(), 1);

        clock.advance(Duration::minutes(5));
        assert!(!delays.cache().is_fresh());
        delays.delay_for(Some("KERALA")).await.unwrap();
        assert_eq!(store.state_delay_reads(), 2);
    }

    #[tokio::test]
    async fn test_mutations_invalidate() {
        let (_, _, delays) = setup();
        let entry = delays.create(add("PUNJAB", 72)).await.unwrap();
        assert_eq!(delays.delay_for(Some("punjab")).await.unwrap().value(), 72);

        delays.update(entry.id, UpdateStateDelay { state_name: None, delay_hours: 24 }).await.unwrap();
        assert_eq!(delays.delay_for(Some("punjab")).await.unwrap().value(), 24);

        delays.delete(entry.id).await.unwrap();
        assert_eq!(delays.delay_for(Some("punjab")).await.unwrap().value(), DEFAULT_DELAY_HOURS);
    }

    #[tokio::test]
    async fn test_sync_lookup_uses_cache_only() {
        let (_, clock, delays) = setup();
        delays.create(add("ASSAM", 200)).await.unwrap();
        assert_eq!(delays.delay_for_cached(Some("assam")).value(), DEFAULT_DELAY_HOURS);

        delays.delay_for(Some("assam")).await.unwrap();
        clock.advance(Duration::hours(1));
        assert_eq!(delays.delay_for_cached(Some("assam")).value(), 200);
    }

    #[tokio::test]
    async fn test_admin_bounds_and_duplicates() {
        let (_, _, delays) = setup();
        assert!(matches!(delays.create(add("GOA", 0)).await, Err(FulfillmentError::Validation(_))));
        assert!(matches!(delays.create(add("GOA", 337)).await, Err(FulfillmentError::Validation(_))));
        assert!(matches!(delays.create(add("   ", 10)).await, Err(FulfillmentError::Validation(_))));

        let goa = delays.create(add(" goa ", 336)).await.unwrap();
        assert_eq!(goa.state_name.as_str(), "GOA");
        assert!(matches!(delays.create(add("Goa", 10)).await, Err(FulfillmentError::Conflict(_))));

        let bihar = delays.create(add("BIHAR", 10)).await.unwrap();
        let rename = UpdateStateDelay { state_name: Some("goa".into()), delay_hours: 10 };
        assert!(matches!(delays.update(bihar.id, rename).await, Err(FulfillmentError::Conflict(_))));

        let missing = UpdateStateDelay { state_name: None, delay_hours: 10 };
        assert!(matches!(delays.update(Uuid::now_v7(), missing).await, Err(FulfillmentError::NotFound(_))));
        assert!(matches!(delays.delete(Uuid::now_v7()).await, Err(FulfillmentError::NotFound(_))));
    }

    #[test]
    fn test_cache_expiry_with_manual_clock() {
        let clock = ManualClock::new(Utc::now());
        let cache = DelayCache::new(Arc::new(clock.clone()), Duration::seconds(30));
        let entry = StateDelayEntry::new(
            RegionKey::normalize(Some("bihar")).unwrap(),
            DelayHours::new(12).unwrap(),
            Utc::now(),
        );
        cache.refresh_all(&[entry]);
        assert!(cache.is_fresh());
        clock.advance(Duration::seconds(30));
        assert!(!cache.is_fresh());
        assert_eq!(cache.get("BIHAR").map(|d| d.value()), Some(12));
        cache.invalidate();
        assert_eq!(cache.get("BIHAR"), None);
    }
}
