//! Value Objects for marketplace fulfillment

use serde::{Deserialize, Serialize};
use std::fmt;

/// Marketplace order identifier.
///
/// Two shapes are accepted: the 15-17 digit secret code used for digital
/// delivery, and the dash-segmented `XXX-XXXXXXX-XXXXXXX` marketplace id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MarketplaceOrderId(String);

impl MarketplaceOrderId {
    pub fn new(value: impl Into<String>) -> Result<Self, OrderIdError> {
        let value = value.into().trim().to_string();
        if value.is_empty() { return Err(OrderIdError::Empty); }
        if is_secret_code(&value) || is_dashed_order_id(&value) {
            Ok(Self(value))
        } else {
            Err(OrderIdError::Malformed)
        }
    }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_secret_code(&self) -> bool { is_secret_code(&self.0) }
}

fn is_secret_code(value: &str) -> bool {
    (15..=17).contains(&value.len()) && value.bytes().all(|b| b.is_ascii_digit())
}

fn is_dashed_order_id(value: &str) -> bool {
    let parts: Vec<&str> = value.split('-').collect();
    parts.len() == 3
        && [3usize, 7, 7].iter().zip(&parts).all(|(len, part)| part.len() == *len && part.bytes().all(|b| b.is_ascii_digit()))
}

impl fmt::Display for MarketplaceOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl TryFrom<String> for MarketplaceOrderId {
    type Error = OrderIdError;
    fn try_from(value: String) -> Result<Self, Self::Error> { Self::new(value) }
}

impl From<MarketplaceOrderId> for String {
    fn from(id: MarketplaceOrderId) -> Self { id.0 }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderIdError {
    #[error("Order ID is required")]
    Empty,
    #[error("Order ID format is not recognised. Please check your order ID.")]
    Malformed,
}

/// Windows/Office installation id, 63 digits once whitespace is stripped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstallationId(String);

impl InstallationId {
    pub const LEN: usize = 63;

    pub fn parse(raw: &str) -> Result<Self, InstallationIdError> {
        let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        if cleaned.len() != Self::LEN || !cleaned.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InstallationIdError);
        }
        Ok(Self(cleaned))
    }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for InstallationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid Installation ID. Must be 63 digits.")]
pub struct InstallationIdError;

/// Normalised shipping region used as the state-delay lookup key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionKey(String);

impl RegionKey {
    /// Name of the table row that overrides the built-in fallback delay.
    pub const DEFAULT: &'static str = "DEFAULT";

    /// Returns `None` for null or blank regions.
    pub fn normalize(raw: Option<&str>) -> Option<Self> {
        let value = raw?.trim().to_uppercase();
        if value.is_empty() { None } else { Some(Self(value)) }
    }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Per-region shipping delay, in hours.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DelayHours(i32);

impl DelayHours {
    pub const MIN: i32 = 1;
    /// 14 days.
    pub const MAX: i32 = 336;

    pub fn new(hours: i32) -> Result<Self, DelayHoursError> {
        if !(Self::MIN..=Self::MAX).contains(&hours) { return Err(DelayHoursError(hours)); }
        Ok(Self(hours))
    }
    /// Trusted values loaded from storage or configuration; not range checked.
    pub fn from_stored(hours: i32) -> Self { Self(hours.max(0)) }
    pub fn value(&self) -> i32 { self.0 }
    pub fn as_duration(&self) -> chrono::Duration { chrono::Duration::hours(i64::from(self.0)) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Delay must be between 1 and 336 hours (14 days), got {0}")]
pub struct DelayHoursError(pub i32);

/// WhatsApp contact number, digits only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhatsAppNumber(String);

impl WhatsAppNumber {
    pub fn parse(raw: &str) -> Option<Self> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        (10..=12).contains(&digits.len()).then_some(Self(digits))
    }
    pub fn as_str(&self) -> &str { &self.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_id_shapes() {
        assert!(MarketplaceOrderId::new("408-1234567-1234567").is_ok());
        assert!(MarketplaceOrderId::new(" 123456789012345 ").unwrap().is_secret_code());
        assert_eq!(MarketplaceOrderId::new("408-123-1234567"), Err(OrderIdError::Malformed));
        assert_eq!(MarketplaceOrderId::new("12345"), Err(OrderIdError::Malformed));
        assert_eq!(MarketplaceOrderId::new("  "), Err(OrderIdError::Empty));
        assert_eq!(OrderIdError::Empty.to_string(), "Order ID is required");
    }

    #[test]
    fn test_installation_id_strips_whitespace() {
        let raw = "1234567 1234567 1234567 1234567 1234567 1234567 1234567 1234567 1234567";
        assert_eq!(InstallationId::parse(raw).unwrap().as_str().len(), 63);
        assert!(InstallationId::parse(&"1".repeat(62)).is_err());
        assert!(InstallationId::parse(&format!("{}a", "1".repeat(62))).is_err());
    }

    #[test]
    fn test_region_normalization() {
        let a = RegionKey::normalize(Some("Delhi"));
        assert_eq!(a, RegionKey::normalize(Some("DELHI")));
        assert_eq!(a, RegionKey::normalize(Some("  delhi ")));
        assert_eq!(RegionKey::normalize(Some("   ")), None);
        assert_eq!(RegionKey::normalize(None), None);
    }

    #[test]
    fn test_delay_bounds() {
        assert!(DelayHours::new(0).is_err());
        assert!(DelayHours::new(337).is_err());
        assert_eq!(DelayHours::new(336).unwrap().as_duration(), chrono::Duration::days(14));
    }

    #[test]
    fn test_whatsapp_digits() {
        assert_eq!(WhatsAppNumber::parse("+91 98765-43210").unwrap().as_str(), "919876543210");
        assert!(WhatsAppNumber::parse("12345").is_none());
    }
}
