//! Classification of GetCID provider responses.
//!
//! The provider answers with free text and no error codes, so outcomes are
//! recognised by known phrases. The grammar sits behind a trait so a new
//! provider wording can be swapped in without touching the pool.

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CidOutcome {
    Success,
    WrongIid,
    BlockedIid,
    ExceededIid,
    CallSupport,
    BlockedKey,
    IpBlocked,
    IidBlocked,
    TokenError,
    ServerBusy,
    Error,
}

impl CidOutcome {
    pub const ALL: [CidOutcome; 11] = [
        Self::Success,
        Self::WrongIid,
        Self::BlockedIid,
        Self::ExceededIid,
        Self::CallSupport,
        Self::BlockedKey,
        Self::IpBlocked,
        Self::IidBlocked,
        Self::TokenError,
        Self::ServerBusy,
        Self::Error,
    ];

    /// Value stored in the usage log.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::WrongIid => "wrong_iid",
            Self::BlockedIid => "blocked_iid",
            Self::ExceededIid => "exceeded_iid",
            Self::CallSupport => "call_support",
            Self::BlockedKey => "blocked_key",
            Self::IpBlocked => "ip_blocked",
            Self::IidBlocked => "iid_blocked",
            Self::TokenError => "token_error",
            Self::ServerBusy => "server_busy",
            Self::Error => "error",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Success => "Confirmation ID generated successfully!",
            Self::WrongIid => "Invalid Installation ID. Please check and try again.",
            Self::BlockedIid => "This Installation ID has been blocked.",
            Self::ExceededIid => "This Installation ID has exceeded usage limits.",
            Self::CallSupport => "This product requires phone activation. Please call Microsoft Support.",
            Self::BlockedKey => "This product key may be blocked. Please contact support.",
            Self::IpBlocked => "Too many requests. Please try again later.",
            Self::IidBlocked => "This Installation ID has too many requests. Please try again later.",
            Self::TokenError => "Service configuration error. Please contact support.",
            Self::ServerBusy => "Server is busy. Please try again in a few minutes.",
            Self::Error => "An error occurred. Please try again.",
        }
    }

    /// Worth retrying from the client with the same or a corrected request.
    pub fn is_retryable(&self) -> bool { matches!(self, Self::WrongIid | Self::ServerBusy | Self::IpBlocked) }

    pub fn is_success(&self) -> bool { *self == Self::Success }
}

pub trait ResponseClassifier: Send + Sync {
    fn classify(&self, raw: &str) -> CidOutcome;
}

/// Phrases used by getcid.info. First match wins.
#[derive(Clone, Copy, Debug, Default)]
pub struct GetCidGrammar;

const PHRASES: &[(&[&str], CidOutcome)] = &[
    (&["Wrong IID"], CidOutcome::WrongIid),
    (&["Blocked IID"], CidOutcome::BlockedIid),
    (&["Exceeded IID"], CidOutcome::ExceededIid),
    (&["Need to call"], CidOutcome::CallSupport),
    (&["Not legimate", "Not legitimate", "Maybe blocked"], CidOutcome::BlockedKey),
    (&["IP reach request limit", "IP is being locked"], CidOutcome::IpBlocked),
    (&["IID reach request limit", "IID is being locked"], CidOutcome::IidBlocked),
    (&["Token"], CidOutcome::TokenError),
    (&["Server too busy"], CidOutcome::ServerBusy),
];

impl ResponseClassifier for GetCidGrammar {
    fn classify(&self, raw: &str) -> CidOutcome {
        let text = raw.trim();
        if text.len() == 48 && text.bytes().all(|b| b.is_ascii_digit()) {
            return CidOutcome::Success;
        }
        PHRASES
            .iter()
            .find(|(needles, _)| needles.iter().any(|n| text.contains(n)))
            .map(|(_, outcome)| *outcome)
            .unwrap_or(CidOutcome::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_each_phrase() {
        let g = GetCidGrammar;
        let cases = [
            (" 123456789012345678901234567890123456789012345678\n", CidOutcome::Success),
            ("Wrong IID", CidOutcome::WrongIid),
            ("Error: Blocked IID", CidOutcome::BlockedIid),
            ("Exceeded IID", CidOutcome::ExceededIid),
            ("Need to call Microsoft", CidOutcome::CallSupport),
            ("Not legimate key", CidOutcome::BlockedKey),
            ("Maybe blocked", CidOutcome::BlockedKey),
            ("Your IP reach request limit", CidOutcome::IpBlocked),
            ("IP is being locked", CidOutcome::IpBlocked),
            ("IID reach request limit", CidOutcome::IidBlocked),
            ("IID is being locked for 1h", CidOutcome::IidBlocked),
            ("Token is invalid", CidOutcome::TokenError),
            ("Server too busy", CidOutcome::ServerBusy),
            ("<html>502</html>", CidOutcome::Error),
        ];
        for (raw, expected) in cases {
            assert_eq!(g.classify(raw), expected, "{raw:?}");
        }
    }

    #[test]
    fn test_near_miss_lengths_are_not_success() {
        let g = GetCidGrammar;
        assert_eq!(g.classify(&"1".repeat(47)), CidOutcome::Error);
        assert_eq!(g.classify(&"1".repeat(49)), CidOutcome::Error);
    }

    #[test]
    fn test_messages_are_distinct_and_retry_set_is_fixed() {
        let messages: HashSet<_> = CidOutcome::ALL.iter().map(|o| o.message()).collect();
        assert_eq!(messages.len(), CidOutcome::ALL.len());
        let retryable: Vec<_> = CidOutcome::ALL.iter().filter(|o| o.is_retryable()).collect();
        assert_eq!(retryable, [&CidOutcome::WrongIid, &CidOutcome::IpBlocked, &CidOutcome::ServerBusy]);
    }
}
