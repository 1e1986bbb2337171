//! GetCID Token Aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct GetCidToken {
    pub id: Uuid,
    pub token: String,
    pub email: Option<String>,
    pub count_used: i32,
    pub total_available: i32,
    pub priority: i32,
    pub is_active: bool,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GetCidToken {
    pub fn new(token: &str, usage: TokenUsage, priority: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            token: token.trim().to_lowercase(),
            email: usage.email,
            count_used: usage.count_used,
            total_available: usage.total_available,
            priority,
            is_active: true,
            last_verified_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining(&self) -> i32 { (self.total_available - self.count_used).max(0) }

    pub fn is_selectable(&self) -> bool { self.is_active && self.count_used < self.total_available }

    /// Token prefix safe to write to logs.
    pub fn redacted(&self) -> String { format!("{}...", self.token.chars().take(4).collect::<String>()) }
}

/// Usage as reported by the provider's own ledger.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub email: Option<String>,
    pub count_used: i32,
    pub total_available: i32,
}

/// Highest priority active token with capacity left.
///
/// Ties go to the token with more remaining capacity, then to the older id so
/// the choice is deterministic.
pub fn select_token(tokens: &[GetCidToken]) -> Option<&GetCidToken> {
    tokens
        .iter()
        .filter(|t| t.is_selectable())
        .max_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.remaining().cmp(&b.remaining()))
                .then(b.id.cmp(&a.id))
        })
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSummary {
    pub total_tokens: usize,
    pub total_used: i64,
    pub total_available: i64,
    pub total_remaining: i64,
}

impl TokenSummary {
    pub fn of(tokens: &[GetCidToken]) -> Self {
        let total_used: i64 = tokens.iter().map(|t| i64::from(t.count_used)).sum();
        let total_available: i64 = tokens.iter().map(|t| i64::from(t.total_available)).sum();
        Self { total_tokens: tokens.len(), total_used, total_available, total_remaining: total_available - total_used }
    }
}

#[cfg(test)]
pub(crate) fn sample_token(token: &str, used: i32, capacity: i32, priority: i32) -> GetCidToken {
    let usage = TokenUsage { email: None, count_used: used, total_available: capacity };
    GetCidToken::new(token, usage, priority, Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_prefers_priority_with_capacity() {
        let tokens = vec![
            sample_token("low-priority", 0, 10, 1),
            sample_token("exhausted-high", 10, 10, 9),
            sample_token("mid", 3, 10, 5),
        ];
        assert_eq!(select_token(&tokens).unwrap().token, "mid");
    }

    #[test]
    fn test_select_never_returns_inactive_or_full() {
        let mut inactive = sample_token("inactive", 0, 10, 10);
        inactive.is_active = false;
        let tokens = vec![inactive, sample_token("full", 5, 5, 3)];
        assert!(select_token(&tokens).is_none());
    }

    #[test]
    fn test_summary() {
        let tokens = vec![sample_token("a", 3, 10, 1), sample_token("b", 1, 5, 2)];
        let s = TokenSummary::of(&tokens);
        assert_eq!((s.total_tokens, s.total_used, s.total_available, s.total_remaining), (2, 4, 15, 11));
    }

    #[test]
    fn test_redacted_token() {
        assert_eq!(sample_token("ABCDEFGH", 0, 1, 1).redacted(), "abcd...");
    }
}
