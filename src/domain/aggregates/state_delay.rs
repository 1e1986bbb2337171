//! State Delay Entry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::domain::value_objects::{DelayHours, RegionKey};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateDelayEntry {
    pub id: Uuid,
    pub state_name: RegionKey,
    pub delay_hours: DelayHours,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StateDelayEntry {
    pub fn new(state_name: RegionKey, delay_hours: DelayHours, now: DateTime<Utc>) -> Self {
        Self { id: Uuid::now_v7(), state_name, delay_hours, created_at: now, updated_at: now }
    }
}
