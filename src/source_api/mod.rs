//! The source provider API client (spec.md §6, "source API"): object retrieval for revalidation
//! and related-entity backfill, list-page fetching for the Backfill Engine, and webhook endpoint
//! management for the Managed Endpoint Registry.
//!
//! Grounded on `payment_providers/stripe.rs`'s use of the `stripe`/`stripe_*` crate family —
//! generalized from one checkout flow to the full object surface named in spec.md §3.

pub mod envelope;

use crate::errors::{Error, Result};
use serde_json::Value;
use stripe::Client;

/// One page of a list endpoint: the records plus whether more pages remain.
pub struct Page {
    pub records: Vec<Value>,
    pub has_more: bool,
}

/// Abstracts the subset of the source provider's HTTP surface the sync engine depends on, so
/// `backfill`, `entities`, and `webhooks::router` can be tested against a stub instead of a live
/// account. Grounded on `payment_providers::PaymentProvider`'s same role.
#[async_trait::async_trait]
pub trait SourceApi: Send + Sync {
    /// Fetches a single object of `kind` by id, as its raw JSON representation.
    async fn retrieve(&self, kind: &str, id: &str) -> Result<Value>;

    /// Fetches one page (size 100) of `kind`, optionally filtered by `created_gte` and resuming
    /// from `starting_after`.
    async fn list_page(&self, kind: &str, created_gte: Option<i64>, starting_after: Option<&str>) -> Result<Page>;

    /// Fetches one page of a sub-list embedded in a parent object (e.g. invoice `lines`, charge
    /// `refunds`), used by the Entity Upserter's related-list expansion policy (§4.1).
    async fn list_sub_page(&self, parent_kind: &str, parent_id: &str, sub_list: &str, starting_after: Option<&str>) -> Result<Page>;

    /// Registers a webhook endpoint at `url` listening for all event types, returning
    /// `(provider_webhook_id, secret)`.
    async fn create_webhook_endpoint(&self, url: &str) -> Result<(String, String)>;

    /// Best-effort deletion of a previously-registered endpoint.
    async fn delete_webhook_endpoint(&self, provider_webhook_id: &str) -> Result<()>;

    /// Starts a live-stream session, returning `{websocket_url, websocket_id, secret,
    /// reconnect_delay_secs}` (spec.md §4.7, "Session establishment").
    async fn create_live_stream_session(&self) -> Result<LiveStreamSession>;
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct LiveStreamSession {
    pub websocket_url: String,
    pub websocket_id: String,
    pub secret: String,
    #[serde(default)]
    pub reconnect_delay_secs: Option<u64>,
}

/// The production [`SourceApi`] backed by the real provider.
pub struct StripeSourceApi {
    client: Client,
    api_key: String,
}

impl StripeSourceApi {
    /// Assumes the process-wide rustls crypto provider has already been installed (`main.rs`
    /// does this once at startup, before any client is built).
    pub fn new(api_key: String) -> Self {
        let client = Client::new(&api_key);
        Self { client, api_key }
    }
}

#[async_trait::async_trait]
impl SourceApi for StripeSourceApi {
    async fn retrieve(&self, kind: &str, id: &str) -> Result<Value> {
        let url = format!("/v1/{}s/{}", plural_path(kind), id);
        self.get_raw(&url).await
    }

    async fn list_page(&self, kind: &str, created_gte: Option<i64>, starting_after: Option<&str>) -> Result<Page> {
        let mut url = format!("/v1/{}s?limit=100", plural_path(kind));
        if let Some(created_gte) = created_gte {
            url.push_str(&format!("&created[gte]={created_gte}"));
        }
        if let Some(starting_after) = starting_after {
            url.push_str(&format!("&starting_after={starting_after}"));
        }
        self.get_page(&url).await
    }

    async fn list_sub_page(&self, parent_kind: &str, parent_id: &str, sub_list: &str, starting_after: Option<&str>) -> Result<Page> {
        let mut url = format!("/v1/{}s/{}/{}?limit=100", plural_path(parent_kind), parent_id, sub_list);
        if let Some(starting_after) = starting_after {
            url.push_str(&format!("&starting_after={starting_after}"));
        }
        self.get_page(&url).await
    }

    async fn create_webhook_endpoint(&self, url: &str) -> Result<(String, String)> {
        let body: Value = self
            .client
            .post_form("/v1/webhook_endpoints", serde_json::json!({ "url": url, "enabled_events": ["*"] }))
            .await
            .map_err(|e| Error::SourceApiError { message: e.to_string() })?;
        let id = body.get("id").and_then(Value::as_str).ok_or_else(|| Error::SourceApiError { message: "missing id in response".into() })?;
        let secret = body
            .get("secret")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::SourceApiError { message: "missing secret in response".into() })?;
        Ok((id.to_string(), secret.to_string()))
    }

    async fn delete_webhook_endpoint(&self, provider_webhook_id: &str) -> Result<()> {
        let _: Result<Value, _> = self.client.get(&format!("/v1/webhook_endpoints/{provider_webhook_id}/delete")).await;
        Ok(())
    }

    async fn create_live_stream_session(&self) -> Result<LiveStreamSession> {
        let body: Value = self
            .client
            .post_form("/v1/webhook_sessions", serde_json::json!({}))
            .await
            .map_err(|e| Error::SourceApiError { message: e.to_string() })?;
        serde_json::from_value(body).map_err(|e| Error::SourceApiError { message: e.to_string() })
    }
}

impl StripeSourceApi {
    async fn get_raw(&self, path: &str) -> Result<Value> {
        self.client.get(path).await.map_err(|e| Error::SourceApiError { message: e.to_string() })
    }

    async fn get_page(&self, path: &str) -> Result<Page> {
        let body: Value = self.get_raw(path).await?;
        let records = body.get("data").and_then(Value::as_array).cloned().unwrap_or_default();
        let has_more = body.get("has_more").and_then(Value::as_bool).unwrap_or(false);
        Ok(Page { records, has_more })
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

/// Maps an `EntityKind` name (snake_case singular) to the source API's plural path segment.
/// A handful of kinds don't pluralize by simple suffix and are special-cased.
fn plural_path(kind: &str) -> String {
    match kind {
        "tax_id" => "customers/tax_ids".to_string(), // tax ids are listed per-customer; see entities::upsert::tax_id
        "checkout_session" => "checkout/sessions".to_string(),
        "active_entitlement" => "entitlements/active_entitlements".to_string(),
        other => format!("{other}s"),
    }
}
