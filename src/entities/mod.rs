//! Entity Upserter (spec.md §4.2): per-kind normalization and secondary effects layered on top of
//! the Persistence Gateway's raw `upsert`.

use crate::config::SyncConfig;
use crate::db::handlers::Entities as EntitiesGateway;
use crate::db::models::entity::{EntityKind, EntityRecord, EntityWrite};
use crate::errors::Result;
use crate::source_api::SourceApi;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;

pub struct Upserter {
    pool: PgPool,
    source_api: Arc<dyn SourceApi>,
    config: SyncConfig,
}

impl Upserter {
    pub fn new(pool: PgPool, source_api: Arc<dyn SourceApi>, config: SyncConfig) -> Self {
        Self { pool, source_api, config }
    }

    /// Upserts `records` of `kind` for `account_id`, applying the kind's secondary effects.
    /// `synced_at` is `event.created` for webhook-driven writes or `now()` for backfill/refetch
    /// writes (spec.md §4.1, "Freshness guard rationale").
    pub async fn upsert(&self, kind: EntityKind, account_id: &str, records: Vec<Value>, synced_at: DateTime<Utc>) -> Result<Vec<EntityRecord>> {
        let mut records = records;

        if self.config.auto_expand_lists {
            for record in &mut records {
                self.expand_truncated_lists(kind, account_id, record).await?;
            }
        }

        if self.config.backfill_related_entities {
            for record in &records {
                self.backfill_related(kind, account_id, record, synced_at).await?;
            }
        }

        let normalized: Vec<EntityWrite> = records.iter().cloned().map(|raw| self.normalize(kind, raw)).collect();

        let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
        let written = EntitiesGateway::new(&mut conn).upsert(kind, account_id, &normalized, synced_at).await?;
        drop(conn);

        self.apply_secondary_effects(kind, account_id, &records, synced_at).await?;

        Ok(written)
    }

    pub async fn delete(&self, kind: EntityKind, id: &str, account_id: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
        Ok(EntitiesGateway::new(&mut conn).delete(kind, id, account_id).await?)
    }

    /// Replaces a nested `price` object with its id and defaults `deleted=false`, matching the
    /// subscription-item denormalization named in spec.md §4.2.
    fn normalize(&self, kind: EntityKind, mut raw: Value) -> EntityWrite {
        if kind == EntityKind::Customer && is_deleted_customer_payload(&raw) {
            let id = raw.get("id").cloned().unwrap_or(Value::Null);
            raw = serde_json::json!({ "id": id, "object": "customer", "deleted": true });
            return EntityWrite::from_raw(raw);
        }

        if kind == EntityKind::SubscriptionItem {
            if let Some(price) = raw.get("price").cloned() {
                if let Some(price_id) = price.get("id").and_then(Value::as_str) {
                    raw["price"] = Value::String(price_id.to_string());
                }
            }
        }
        if raw.get("deleted").is_none() {
            raw["deleted"] = Value::Bool(false);
        }
        EntityWrite::from_raw(raw)
    }

    /// Paginates a sub-list with `has_more=true` to exhaustion and replaces it in-place, resetting
    /// `has_more` to `false` (spec.md §4.1, "Related-entity expansion policy").
    async fn expand_truncated_lists(&self, kind: EntityKind, account_id: &str, record: &mut Value) -> Result<()> {
        let sub_list_field = match kind {
            EntityKind::Invoice => "lines",
            EntityKind::Charge => "refunds",
            _ => return Ok(()),
        };

        let Some(id) = record.get("id").and_then(Value::as_str).map(str::to_string) else {
            return Ok(());
        };
        let Some(sub_list) = record.get(sub_list_field).cloned() else {
            return Ok(());
        };
        let has_more = sub_list.get("has_more").and_then(Value::as_bool).unwrap_or(false);
        if !has_more {
            return Ok(());
        }

        let mut all_records: Vec<Value> = sub_list.get("data").and_then(Value::as_array).cloned().unwrap_or_default();
        let mut starting_after = all_records.last().and_then(|v| v.get("id")).and_then(Value::as_str).map(str::to_string);

        loop {
            let page = self.source_api.list_sub_page(kind.as_str(), &id, sub_list_field, starting_after.as_deref()).await?;
            let more = page.has_more;
            starting_after = page.records.last().and_then(|v| v.get("id")).and_then(Value::as_str).map(str::to_string);
            all_records.extend(page.records);
            if !more {
                break;
            }
        }

        record[sub_list_field] = serde_json::json!({ "object": "list", "data": all_records, "has_more": false });
        let _ = account_id;
        Ok(())
    }

    /// Before upserting a record with foreign references, fetches any referenced entity not yet
    /// present locally, recursively across the bounded foreign-reference graph (spec.md §4.1,
    /// "Related-entity backfill").
    #[async_recursion::async_recursion]
    async fn backfill_related(&self, kind: EntityKind, account_id: &str, record: &Value, synced_at: DateTime<Utc>) -> Result<()> {
        for related_kind in kind.related_kinds() {
            let Some(field) = foreign_key_field(kind, *related_kind) else { continue };
            let Some(ref_id) = record.get(field).and_then(field_as_id) else { continue };

            let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
            let missing = EntitiesGateway::new(&mut conn).find_missing(*related_kind, &[ref_id.clone()], account_id).await?;
            drop(conn);

            if missing.is_empty() {
                continue;
            }

            for missing_id in missing {
                let fetched = self.source_api.retrieve(related_kind.as_str(), &missing_id).await?;
                self.backfill_related(*related_kind, account_id, &fetched, synced_at).await?;
                let normalized = self.normalize(*related_kind, fetched);
                let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
                EntitiesGateway::new(&mut conn).upsert(*related_kind, account_id, &[normalized], synced_at).await?;
            }
        }
        Ok(())
    }

    async fn apply_secondary_effects(&self, kind: EntityKind, account_id: &str, records: &[Value], synced_at: DateTime<Utc>) -> Result<()> {
        match kind {
            EntityKind::Subscription => self.apply_subscription_effects(account_id, records, synced_at).await,
            EntityKind::CheckoutSession => self.apply_checkout_session_effects(account_id, records, synced_at).await,
            EntityKind::ActiveEntitlement => self.apply_active_entitlement_effects(account_id, records).await,
            _ => Ok(()),
        }
    }

    /// After upserting subscriptions, upserts their enclosed items, then soft-deletes any item row
    /// for the subscription whose id is no longer in the current set (spec.md §4.2).
    async fn apply_subscription_effects(&self, account_id: &str, records: &[Value], synced_at: DateTime<Utc>) -> Result<()> {
        for subscription in records {
            let Some(subscription_id) = subscription.get("id").and_then(Value::as_str) else { continue };
            let items: Vec<Value> = subscription
                .get("items")
                .and_then(|v| v.get("data"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            let keep_ids: Vec<String> = items.iter().filter_map(|i| i.get("id").and_then(Value::as_str)).map(str::to_string).collect();

            let normalized: Vec<EntityWrite> = items.into_iter().map(|raw| self.normalize(EntityKind::SubscriptionItem, raw)).collect();
            let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
            let mut gateway = EntitiesGateway::new(&mut conn);
            gateway.upsert(EntityKind::SubscriptionItem, account_id, &normalized, synced_at).await?;
            gateway
                .soft_delete_missing_children(EntityKind::SubscriptionItem, account_id, "subscription", subscription_id, &keep_ids, synced_at)
                .await?;
        }
        Ok(())
    }

    /// After upserting a checkout session, fetches its line items and persists them into the
    /// companion `checkout_session_line_item` kind, keyed by session id (spec.md §4.2).
    async fn apply_checkout_session_effects(&self, account_id: &str, records: &[Value], synced_at: DateTime<Utc>) -> Result<()> {
        for session in records {
            let Some(session_id) = session.get("id").and_then(Value::as_str).map(str::to_string) else { continue };
            let mut all_items = Vec::new();
            let mut starting_after = None;
            loop {
                let page = self.source_api.list_sub_page("checkout_session", &session_id, "line_items", starting_after.as_deref()).await?;
                let more = page.has_more;
                starting_after = page.records.last().and_then(|v| v.get("id")).and_then(Value::as_str).map(str::to_string);
                all_items.extend(page.records);
                if !more {
                    break;
                }
            }

            let normalized: Vec<EntityWrite> = all_items
                .into_iter()
                .map(|mut raw| {
                    raw["checkout_session"] = Value::String(session_id.clone());
                    self.normalize(EntityKind::CheckoutSessionLineItem, raw)
                })
                .collect();

            let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
            EntitiesGateway::new(&mut conn).upsert(EntityKind::CheckoutSessionLineItem, account_id, &normalized, synced_at).await?;
        }
        Ok(())
    }

    /// Before upserting the new set of active entitlements for a customer, deletes rows whose id
    /// is not in the new set (spec.md §4.2 — a hard delete, unlike subscription items).
    async fn apply_active_entitlement_effects(&self, account_id: &str, records: &[Value]) -> Result<()> {
        let by_customer: std::collections::HashMap<String, Vec<String>> = records.iter().fold(Default::default(), |mut acc, record| {
            if let (Some(customer_id), Some(id)) = (record.get("customer").and_then(field_as_id), record.get("id").and_then(Value::as_str)) {
                acc.entry(customer_id).or_default().push(id.to_string());
            }
            acc
        });

        let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
        let mut gateway = EntitiesGateway::new(&mut conn);
        for (customer_id, keep_ids) in by_customer {
            gateway
                .delete_missing_children(EntityKind::ActiveEntitlement, account_id, "customer", &customer_id, &keep_ids)
                .await?;
        }
        Ok(())
    }
}

/// Extracts an id from either a bare id string or an expanded object reference.
fn field_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => value.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn foreign_key_field(kind: EntityKind, related: EntityKind) -> Option<&'static str> {
    match (kind, related) {
        (EntityKind::Invoice, EntityKind::Customer) => Some("customer"),
        (EntityKind::Invoice, EntityKind::Subscription) => Some("subscription"),
        (EntityKind::Subscription, EntityKind::Customer) => Some("customer"),
        (EntityKind::Charge, EntityKind::Customer) => Some("customer"),
        (EntityKind::Charge, EntityKind::Invoice) => Some("invoice"),
        (EntityKind::Dispute, EntityKind::Charge) => Some("charge"),
        (EntityKind::PaymentIntent, EntityKind::Customer) => Some("customer"),
        (EntityKind::PaymentIntent, EntityKind::Invoice) => Some("invoice"),
        (EntityKind::Price, EntityKind::Product) => Some("product"),
        (EntityKind::Plan, EntityKind::Product) => Some("product"),
        _ => None,
    }
}

/// Handles the "deleted customer" payload (`{id, object, deleted}` only) by selecting a minimal
/// upsert projection instead of treating the sparse payload as a full record (spec.md §4.2).
pub fn is_deleted_customer_payload(raw: &Value) -> bool {
    raw.get("deleted").and_then(Value::as_bool) == Some(true) && raw.get("email").is_none() && raw.get("created").is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_the_sparse_deleted_customer_payload() {
        let deleted = serde_json::json!({"id": "cus_1", "object": "customer", "deleted": true});
        assert!(is_deleted_customer_payload(&deleted));

        let full = serde_json::json!({"id": "cus_1", "object": "customer", "deleted": false, "email": "a@b.com", "created": 1700000000});
        assert!(!is_deleted_customer_payload(&full));
    }

    #[test]
    fn foreign_key_field_graph_matches_related_kinds() {
        for kind in EntityKind::ALL {
            for related in kind.related_kinds() {
                assert!(
                    foreign_key_field(kind, *related).is_some(),
                    "{kind} declares {related} as related but has no mapped foreign key field"
                );
            }
        }
    }
}
