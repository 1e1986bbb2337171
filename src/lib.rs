//! OpenSASE Fulfillment
//!
//! Marketplace order fulfillment and redemption gating for a digital license
//! storefront.
//!
//! ## Features
//! - Redemption gate for marketplace-fulfilled orders with per-region delays
//! - Early-delivery appeals with admin review
//! - GetCID confirmation-id token pool with per-order quotas
//! - Cron-driven order and refund sync from the Selling Partner API, across
//!   seller accounts
//! - Queue of multi-item orders for manual handling
//! - License key claim behind the redemption gate

use thiserror::Error;

pub mod api;
pub mod appeals;
pub mod blob;
pub mod clock;
pub mod config;
pub mod domain;
pub mod effects;
pub mod getcid;
pub mod notify;
pub mod redemption;
pub mod state_delays;
pub mod store;
pub mod sync;

use domain::aggregates::TransitionError;
use domain::value_objects::{DelayHoursError, InstallationIdError, OrderIdError};
use store::StoreError;

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum FulfillmentError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Expected refusals whose reason is shown to the customer verbatim.
    #[error("{0}")]
    Policy(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Unavailable(String),

    #[error("upstream timed out: {0}")]
    Timeout(String),

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl FulfillmentError {
    pub fn validation(msg: impl Into<String>) -> Self { Self::Validation(msg.into()) }
    pub fn not_found(msg: impl Into<String>) -> Self { Self::NotFound(msg.into()) }
    pub fn policy(msg: impl Into<String>) -> Self { Self::Policy(msg.into()) }
}

impl From<StoreError> for FulfillmentError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<TransitionError> for FulfillmentError {
    fn from(e: TransitionError) -> Self { Self::Validation(e.to_string()) }
}

impl From<OrderIdError> for FulfillmentError {
    fn from(e: OrderIdError) -> Self { Self::Validation(e.to_string()) }
}

impl From<InstallationIdError> for FulfillmentError {
    fn from(e: InstallationIdError) -> Self { Self::Validation(e.to_string()) }
}

impl From<DelayHoursError> for FulfillmentError {
    fn from(e: DelayHoursError) -> Self { Self::Validation(e.to_string()) }
}

impl From<validator::ValidationErrors> for FulfillmentError {
    fn from(e: validator::ValidationErrors) -> Self { Self::Validation(first_validation_message(&e)) }
}

/// First field message, falling back to the field name.
fn first_validation_message(errors: &validator::ValidationErrors) -> String {
    let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
    fields.sort_by_key(|(name, _)| *name);
    fields
        .into_iter()
        .flat_map(|(name, errs)| errs.iter().map(move |e| (name, e)))
        .map(|(name, e)| e.message.as_ref().map(|m| m.to_string()).unwrap_or_else(|| format!("Invalid {name}")))
        .next()
        .unwrap_or_else(|| "Invalid request".to_string())
}

pub type Result<T> = std::result::Result<T, FulfillmentError>;
