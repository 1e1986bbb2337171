//! Selling Partner API client for the Orders and Finances APIs.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{MarketplaceApi, MarketplaceError, MarketplaceOrder, OrderItem, RefundEvent};
use crate::domain::aggregates::FulfillmentChannel;

pub const DEFAULT_ENDPOINT: &str = "https://sellingpartnerapi-fe.amazon.com";
pub const DEFAULT_TOKEN_URL: &str = "https://api.amazon.com/auth/o2/token";
const PAGE_SIZE: &str = "100";
const PAGE_PAUSE: Duration = Duration::from_millis(200);
const FINANCES_PAGE_PAUSE: Duration = Duration::from_millis(300);
const FINANCES_MAX_PAGES: usize = 50;
const THROTTLE_PAUSE: Duration = Duration::from_secs(5);
const THROTTLE_RETRIES: usize = 2;

#[derive(Clone, Debug)]
pub struct SpApiCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub marketplace_id: String,
    pub endpoint: String,
    pub token_url: String,
}

pub struct SpApiClient {
    http: reqwest::Client,
    creds: SpApiCredentials,
    cached: Mutex<Option<(String, DateTime<Utc>)>>,
}

#[derive(Deserialize)]
struct LwaToken {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    payload: Option<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OrdersPage {
    #[serde(default)]
    orders: Vec<MarketplaceOrder>,
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ItemsPage {
    #[serde(default)]
    order_items: Vec<OrderItem>,
}

/// Finances responses carry the page under `payload` or at the top level.
#[derive(Deserialize)]
struct FinancesResponse {
    payload: Option<TransactionsPage>,
    #[serde(flatten)]
    top: TransactionsPage,
}

impl FinancesResponse {
    fn page(self) -> TransactionsPage { self.payload.unwrap_or(self.top) }
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionsPage {
    #[serde(default)]
    transactions: Vec<Transaction>,
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Transaction {
    transaction_type: Option<String>,
    posted_date: Option<DateTime<Utc>>,
    total_amount: Option<CurrencyAmount>,
    #[serde(default)]
    related_identifiers: Vec<RelatedIdentifier>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrencyAmount {
    currency_amount: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelatedIdentifier {
    related_identifier_name: Option<String>,
    related_identifier_value: Option<String>,
}

impl Transaction {
    fn identifier(&self, name: &str) -> Option<String> {
        self.related_identifiers
            .iter()
            .find(|r| r.related_identifier_name.as_deref() == Some(name))
            .and_then(|r| r.related_identifier_value.clone())
    }

    /// The refund this transaction records, if it is a refund tied to an order.
    fn refund(&self) -> Option<RefundEvent> {
        let kind = self.transaction_type.as_deref()?;
        if !kind.to_ascii_lowercase().contains("refund") {
            return None;
        }
        let amount = self.total_amount.as_ref().and_then(|t| match t.currency_amount.as_ref()? {
            serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
            serde_json::Value::String(s) => Decimal::from_str(s).ok(),
            _ => None,
        });
        Some(RefundEvent {
            order_id: self.identifier("ORDER_ID")?,
            refund_id: self.identifier("REFUND_ID"),
            posted_at: self.posted_date,
            amount,
        })
    }
}

impl SpApiClient {
    pub fn new(creds: SpApiCredentials, timeout: Duration) -> Result<Self, MarketplaceError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, creds, cached: Mutex::new(None) })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, query: &[(&str, &str)]) -> Result<T, MarketplaceError> {
        let token = self.access_token().await?;
        let mut attempt = 0;
        let resp = loop {
            let resp = self.http.get(url).query(query).header("x-amz-access-token", token.as_str()).send().await?;
            if resp.status() != reqwest::StatusCode::TOO_MANY_REQUESTS || attempt == THROTTLE_RETRIES {
                break resp;
            }
            attempt += 1;
            tracing::warn!(url, attempt, "marketplace API throttled, backing off");
            tokio::time::sleep(THROTTLE_PAUSE).await;
        };
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MarketplaceError::Status { status: status.as_u16(), body: body.chars().take(200).collect() });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl MarketplaceApi for SpApiClient {
    /// Exchanges the refresh token for a short-lived access token, reusing it
    /// until a minute before expiry.
    async fn access_token(&self) -> Result<String, MarketplaceError> {
        let mut cached = self.cached.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if *expires_at > Utc::now() {
                return Ok(token.clone());
            }
        }
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", self.creds.refresh_token.as_str()),
            ("client_id", self.creds.client_id.as_str()),
            ("client_secret", self.creds.client_secret.as_str()),
        ];
        let resp = self.http.post(&self.creds.token_url).form(&form).send().await?;
        if !resp.status().is_success() {
            return Err(MarketplaceError::Auth(resp.status().as_u16()));
        }
        let token: LwaToken = resp.json().await?;
        let ttl = token.expires_in.unwrap_or(3600).saturating_sub(60).max(0);
        *cached = Some((token.access_token.clone(), Utc::now() + chrono::Duration::seconds(ttl)));
        Ok(token.access_token)
    }

    async fn list_orders(&self, channel: FulfillmentChannel, created_after: DateTime<Utc>) -> Result<Vec<MarketplaceOrder>, MarketplaceError> {
        let url = format!("{}/orders/v0/orders", self.creds.endpoint);
        let created_after = created_after.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut orders = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let page: Envelope<OrdersPage> = {
                let mut query = vec![
                    ("MarketplaceIds", self.creds.marketplace_id.as_str()),
                    ("CreatedAfter", created_after.as_str()),
                    ("FulfillmentChannels", channel.api_code()),
                    ("MaxResultsPerPage", PAGE_SIZE),
                ];
                if let Some(token) = next_token.as_deref() {
                    query.push(("NextToken", token));
                }
                self.get_json(&url, &query).await?
            };
            let Some(page) = page.payload else { break };
            orders.extend(page.orders);
            match page.next_token {
                Some(token) if !token.is_empty() => {
                    next_token = Some(token);
                    tokio::time::sleep(PAGE_PAUSE).await;
                }
                _ => break,
            }
        }
        tracing::debug!(channel = channel.as_str(), count = orders.len(), "fetched marketplace orders");
        Ok(orders)
    }

    async fn order_items(&self, order_id: &str) -> Result<Vec<OrderItem>, MarketplaceError> {
        let url = format!("{}/orders/v0/orders/{}/orderItems", self.creds.endpoint, order_id);
        let page: Envelope<ItemsPage> = self.get_json(&url, &[]).await?;
        Ok(page.payload.map(|p| p.order_items).unwrap_or_default())
    }

    async fn refund_events(&self, posted_after: DateTime<Utc>) -> Result<Vec<RefundEvent>, MarketplaceError> {
        let url = format!("{}/finances/2024-06-19/transactions", self.creds.endpoint);
        let posted_after = posted_after.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut refunds = Vec::new();
        let mut scanned = 0;
        let mut next_token: Option<String> = None;
        for page_number in 0..FINANCES_MAX_PAGES {
            if page_number > 0 {
                tokio::time::sleep(FINANCES_PAGE_PAUSE).await;
            }
            let response: FinancesResponse = {
                let mut query = vec![("postedAfter", posted_after.as_str())];
                if let Some(token) = next_token.as_deref() {
                    query.push(("nextToken", token));
                }
                self.get_json(&url, &query).await?
            };
            let page = response.page();
            scanned += page.transactions.len();
            refunds.extend(page.transactions.iter().filter_map(Transaction::refund));
            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }
        tracing::debug!(scanned, refunds = refunds.len(), "fetched refund transactions");
        Ok(refunds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orders_page_decodes() {
        let raw = r#"{"payload":{"Orders":[{"AmazonOrderId":"408-1234567-1234567","OrderStatus":"Shipped",
            "PurchaseDate":"2025-01-02T10:00:00Z","LastUpdateDate":"2025-01-03T08:00:00Z",
            "OrderTotal":{"Amount":"1499.00","CurrencyCode":"INR"},"BuyerInfo":{"BuyerEmail":"x@marketplace.amazon.in"},
            "ShippingAddress":{"City":"NEW DELHI","StateOrRegion":"DELHI","PostalCode":"110001","CountryCode":"IN"}}],
            "NextToken":"abc"}}"#;
        let page: Envelope<OrdersPage> = serde_json::from_str(raw).unwrap();
        let page = page.payload.unwrap();
        assert_eq!(page.next_token.as_deref(), Some("abc"));
        let order = &page.orders[0];
        assert_eq!(order.amazon_order_id, "408-1234567-1234567");
        assert_eq!(order.shipping_address.as_ref().and_then(|a| a.state_or_region.as_deref()), Some("DELHI"));
        assert_eq!(order.order_total.as_ref().map(|t| t.amount.as_str()), Some("1499.00"));
    }

    #[test]
    fn test_items_page_tolerates_missing_payload() {
        let page: Envelope<ItemsPage> = serde_json::from_str(r#"{"errors":[]}"#).unwrap();
        assert!(page.payload.is_none());
        let page: Envelope<ItemsPage> =
            serde_json::from_str(r#"{"payload":{"OrderItems":[{"ASIN":"B0TEST","SellerSKU":"WIN11","QuantityOrdered":2}]}}"#).unwrap();
        let item = &page.payload.unwrap().order_items[0];
        assert_eq!((item.asin.as_deref(), item.quantity_ordered), (Some("B0TEST"), Some(2)));
    }

    #[test]
    fn test_refund_transactions_are_picked_out() {
        let raw = r#"{"payload":{"nextToken":"n2","transactions":[
            {"transactionType":"Refund","postedDate":"2025-02-01T09:30:00Z",
             "totalAmount":{"currencyAmount":-1499.0,"currencyCode":"INR"},
             "relatedIdentifiers":[{"relatedIdentifierName":"ORDER_ID","relatedIdentifierValue":"408-1234567-1234567"},
                                   {"relatedIdentifierName":"REFUND_ID","relatedIdentifierValue":"R-77"}]},
            {"transactionType":"Shipment","relatedIdentifiers":[{"relatedIdentifierName":"ORDER_ID","relatedIdentifierValue":"171-7654321-7654321"}]},
            {"transactionType":"GuaranteeClaimRefund","relatedIdentifiers":[]}]}}"#;
        let page = serde_json::from_str::<FinancesResponse>(raw).unwrap().page();
        assert_eq!(page.next_token.as_deref(), Some("n2"));
        let refunds: Vec<RefundEvent> = page.transactions.iter().filter_map(Transaction::refund).collect();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].order_id, "408-1234567-1234567");
        assert_eq!(refunds[0].refund_id.as_deref(), Some("R-77"));
        assert_eq!(refunds[0].amount, Some(Decimal::new(-1499, 0)));
        assert!(refunds[0].posted_at.is_some());

        let top = serde_json::from_str::<FinancesResponse>(
            r#"{"transactions":[{"transactionType":"REFUND","relatedIdentifiers":[{"relatedIdentifierName":"ORDER_ID","relatedIdentifierValue":"A1"}]}]}"#,
        )
        .unwrap()
        .page();
        assert_eq!(top.transactions.iter().filter_map(Transaction::refund).count(), 1);
    }
}
