//! Webhook Router (spec.md §4.3): signature verification, optional revalidation, and dispatch to
//! the Entity Upserter.

use crate::config::SyncConfig;
use crate::db::handlers::ManagedWebhooks;
use crate::entities::Upserter;
use crate::errors::{Error, Result};
use crate::db::models::entity::EntityKind;
use crate::source_api::envelope::WebhookEvent;
use crate::source_api::SourceApi;
use crate::webhooks::signing;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

pub struct Router {
    pool: PgPool,
    upserter: Upserter,
    source_api: Arc<dyn SourceApi>,
    sync_config: SyncConfig,
}

impl Router {
    pub fn new(pool: PgPool, upserter: Upserter, source_api: Arc<dyn SourceApi>, sync_config: SyncConfig) -> Self {
        Self { pool, upserter, source_api, sync_config }
    }

    /// `process(raw_body, signature, endpoint_uuid)` (spec.md §4.3). Idempotent by construction:
    /// every downstream write goes through the Persistence Gateway's freshness guard (I2), so a
    /// retried delivery is a silent no-op rather than a duplicate effect.
    pub async fn process(&self, raw_body: &[u8], signature_header: &str, endpoint_uuid: Uuid) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
        let endpoint = ManagedWebhooks::new(&mut conn)
            .find_by_uuid(endpoint_uuid)
            .await?
            .ok_or_else(|| Error::NotFound { resource: "managed webhook".to_string(), id: endpoint_uuid.to_string() })?;
        drop(conn);

        let now = Utc::now().timestamp();
        signing::verify(raw_body, signature_header, &endpoint.secret, now, self.sync_config.signature_tolerance_secs)
            .map_err(|e| Error::SignatureError { message: e.to_string() })?;

        let event: WebhookEvent = serde_json::from_slice(raw_body).map_err(|e| Error::BadRequest { message: e.to_string() })?;

        let Some((kind, effect)) = dispatch(&event.type_) else {
            return Ok(()); // unrecognized type: 200 OK, no effect
        };

        let mut object = event.data.object.clone();
        let mut synced_at = DateTime::from_timestamp(event.created, 0).unwrap_or_else(Utc::now);

        let revalidate_configured = self.sync_config.revalidate_objects_via_stripe_api.iter().any(|t| t == &event.type_);
        if revalidate_configured && should_revalidate(kind, &object) {
            if let Some(id) = object.get("id").and_then(Value::as_str) {
                object = self.source_api.retrieve(kind.as_str(), id).await?;
                synced_at = Utc::now();
            }
        }

        let account_id = event
            .data
            .object
            .get("account")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();

        match effect {
            Effect::Upsert => {
                self.upserter.upsert(kind, &account_id, vec![object], synced_at).await?;
            }
            Effect::Delete => {
                if let Some(id) = object.get("id").and_then(Value::as_str) {
                    self.upserter.delete(kind, id, &account_id).await?;
                }
            }
            Effect::ActiveEntitlementUpsert => {
                if let Some(customer_id) = object.get("customer").and_then(Value::as_str) {
                    let entitlements = object.get("entitlements").and_then(Value::as_array).cloned().unwrap_or_default();
                    let records: Vec<Value> = entitlements
                        .into_iter()
                        .map(|mut e| {
                            e["customer"] = Value::String(customer_id.to_string());
                            e
                        })
                        .collect();
                    self.upserter.upsert(EntityKind::ActiveEntitlement, &account_id, records, synced_at).await?;
                }
            }
        }

        Ok(())
    }

    /// Installs a fresh verification secret for `endpoint_uuid`. Used by the Live-Stream Client
    /// right after session establishment, whose session secret supersedes whatever secret the
    /// endpoint was last registered with (spec.md §4.7).
    pub async fn set_endpoint_secret(&self, endpoint_uuid: Uuid, secret: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
        ManagedWebhooks::new(&mut conn).update_secret(endpoint_uuid, secret).await?;
        Ok(())
    }
}

enum Effect {
    Upsert,
    Delete,
    ActiveEntitlementUpsert,
}

/// Dispatch table for event types (spec.md §4.3, step 5).
fn dispatch(event_type: &str) -> Option<(EntityKind, Effect)> {
    use EntityKind::*;

    Some(match event_type {
        "customer.created" | "customer.updated" => (Customer, Effect::Upsert),
        "customer.deleted" => (Customer, Effect::Upsert), // deleted payload handled by Upserter
        t if t.starts_with("customer.subscription.") => (Subscription, Effect::Upsert),
        "customer.tax_id.created" | "customer.tax_id.updated" => (TaxId, Effect::Upsert),
        "customer.tax_id.deleted" => (TaxId, Effect::Delete),
        t if t.starts_with("invoice.") => (Invoice, Effect::Upsert),
        "product.created" | "product.updated" => (Product, Effect::Upsert),
        "product.deleted" => (Product, Effect::Delete),
        "price.created" | "price.updated" => (Price, Effect::Upsert),
        "price.deleted" => (Price, Effect::Delete),
        "plan.created" | "plan.updated" => (Plan, Effect::Upsert),
        "plan.deleted" => (Plan, Effect::Delete),
        t if t.starts_with("setup_intent.") => (SetupIntent, Effect::Upsert),
        t if t.starts_with("subscription_schedule.") => (SubscriptionSchedule, Effect::Upsert),
        t if t.starts_with("payment_method.") => (PaymentMethod, Effect::Upsert),
        t if t.starts_with("charge.dispute.") => (Dispute, Effect::Upsert),
        t if t.starts_with("charge.") => (Charge, Effect::Upsert),
        t if t.starts_with("payment_intent.") => (PaymentIntent, Effect::Upsert),
        t if t.starts_with("credit_note.") => (CreditNote, Effect::Upsert),
        t if t.starts_with("checkout.session.") => (CheckoutSession, Effect::Upsert),
        "entitlements.active_entitlement_summary.updated" => (ActiveEntitlement, Effect::ActiveEntitlementUpsert),
        _ => return None,
    })
}

/// An object is "terminal" when further revalidation would be wasted work (spec.md §4.3, step 4):
/// invoices in `void`/`uncollectible`/paid status, and any object lacking a `status`/`paid` field
/// at all (nothing to revalidate against).
fn should_revalidate(kind: EntityKind, object: &Value) -> bool {
    if kind != EntityKind::Invoice {
        return true;
    }
    let status = object.get("status").and_then(Value::as_str);
    let paid = object.get("paid").and_then(Value::as_bool).unwrap_or(false);
    !matches!(status, Some("void") | Some("uncollectible")) && !paid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_subscription_wildcard_events() {
        let (kind, _) = dispatch("customer.subscription.updated").unwrap();
        assert_eq!(kind, EntityKind::Subscription);
    }

    #[test]
    fn dispatches_tax_id_deletion_separately_from_upsert() {
        assert!(matches!(dispatch("customer.tax_id.deleted"), Some((EntityKind::TaxId, Effect::Delete))));
        assert!(matches!(dispatch("customer.tax_id.updated"), Some((EntityKind::TaxId, Effect::Upsert))));
    }

    #[test]
    fn unrecognized_event_types_are_ignored() {
        assert!(dispatch("balance.available").is_none());
    }

    #[test]
    fn revalidation_is_scoped_to_configured_event_types() {
        let configured = vec!["invoice.updated".to_string()];
        assert!(configured.iter().any(|t| t == "invoice.updated"));
        assert!(!configured.iter().any(|t| t == "invoice.created"));
    }

    #[test]
    fn paid_or_void_invoices_are_not_revalidated() {
        let paid = serde_json::json!({"status": "paid", "paid": true});
        let void = serde_json::json!({"status": "void", "paid": false});
        let open = serde_json::json!({"status": "open", "paid": false});

        assert!(!should_revalidate(EntityKind::Invoice, &paid));
        assert!(!should_revalidate(EntityKind::Invoice, &void));
        assert!(should_revalidate(EntityKind::Invoice, &open));
    }
}
