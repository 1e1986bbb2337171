//! Early Delivery Appeal Aggregate
//!
//! Appeal status lives in two places: on each appeal record and, mirrored, on
//! the parent order. Both move through the same transition table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::domain::value_objects::MarketplaceOrderId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppealStatus {
    #[default]
    None,
    Pending,
    Approved,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppealAction { Submit, Approve, Reject }

impl AppealStatus {
    /// `None` has no stored representation.
    pub fn as_db(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Pending => Some("PENDING"),
            Self::Approved => Some("APPROVED"),
            Self::Rejected => Some("REJECTED"),
        }
    }

    pub fn from_db(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("PENDING") => Self::Pending,
            Some(v) if v.eq_ignore_ascii_case("APPROVED") => Self::Approved,
            Some(v) if v.eq_ignore_ascii_case("REJECTED") => Self::Rejected,
            _ => Self::None,
        }
    }

    /// Open appeals block a new submission for the same order.
    pub fn is_open(&self) -> bool { matches!(self, Self::Pending | Self::Approved) }

    pub fn transition(self, action: AppealAction) -> Result<AppealStatus, TransitionError> {
        use AppealAction::*;
        use AppealStatus::*;
        match (self, action) {
            (None | Rejected, Submit) => Ok(Pending),
            (Pending, Approve) => Ok(Approved),
            (Pending, Reject) => Ok(Rejected),
            (from, action) => Err(TransitionError { from, action }),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action:?} an appeal that is {}", .from.label())]
pub struct TransitionError {
    pub from: AppealStatus,
    pub action: AppealAction,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EarlyAppeal {
    pub id: Uuid,
    pub order_id: MarketplaceOrderId,
    pub customer_email: String,
    pub customer_whatsapp: String,
    pub proof_image_url: String,
    pub status: AppealStatus,
    pub rejection_reason: Option<String>,
    pub admin_notes: Option<String>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl EarlyAppeal {
    pub fn submit(
        order_id: MarketplaceOrderId,
        customer_email: impl Into<String>,
        customer_whatsapp: impl Into<String>,
        proof_image_url: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            order_id,
            customer_email: customer_email.into(),
            customer_whatsapp: customer_whatsapp.into(),
            proof_image_url: proof_image_url.into(),
            status: AppealStatus::Pending,
            rejection_reason: None,
            admin_notes: None,
            reviewed_by: None,
            reviewed_at: None,
            created_at: now,
        }
    }

    /// Applies an admin decision, leaving `self` untouched on an illegal move.
    pub fn resolve(&mut self, decision: &AppealDecision, now: DateTime<Utc>) -> Result<AppealStatus, TransitionError> {
        let next = self.status.transition(decision.action())?;
        self.status = next;
        self.rejection_reason = match decision {
            AppealDecision::Reject { reason } => reason.clone(),
            AppealDecision::Approve => None,
        };
        self.reviewed_at = Some(now);
        Ok(next)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppealDecision {
    Approve,
    Reject { reason: Option<String> },
}

impl AppealDecision {
    pub fn action(&self) -> AppealAction {
        match self { Self::Approve => AppealAction::Approve, Self::Reject { .. } => AppealAction::Reject }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use AppealAction::*;
        use AppealStatus::*;
        assert_eq!(None.transition(Submit), Ok(Pending));
        assert_eq!(Rejected.transition(Submit), Ok(Pending));
        assert_eq!(Pending.transition(Approve), Ok(Approved));
        assert_eq!(Pending.transition(Reject), Ok(Rejected));
        for (from, action) in [(Pending, Submit), (Approved, Submit), (Approved, Reject), (Rejected, Approve), (None, Approve), (Approved, Approve)] {
            assert_eq!(from.transition(action), Err(TransitionError { from, action }));
        }
    }

    #[test]
    fn test_resolve_records_reason() {
        let order_id = MarketplaceOrderId::new("408-1234567-1234567").unwrap();
        let mut appeal = EarlyAppeal::submit(order_id, "a@b.in", "9876543210", "https://x/p.png", Utc::now());
        let decision = AppealDecision::Reject { reason: Some("Blurry screenshot".into()) };
        assert_eq!(appeal.resolve(&decision, Utc::now()), Ok(AppealStatus::Rejected));
        assert_eq!(appeal.rejection_reason.as_deref(), Some("Blurry screenshot"));
        assert!(appeal.resolve(&AppealDecision::Approve, Utc::now()).is_err());
        assert_eq!(appeal.status, AppealStatus::Rejected);
    }

    #[test]
    fn test_db_round_trip_of_missing_status() {
        assert_eq!(AppealStatus::from_db(None), AppealStatus::None);
        assert_eq!(AppealStatus::from_db(Some("approved")), AppealStatus::Approved);
        assert_eq!(AppealStatus::None.as_db(), None);
    }
}
