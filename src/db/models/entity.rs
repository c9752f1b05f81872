//! The entity kind enum and the generic entity row, per spec.md §3 ("Entity record").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every entity kind synchronized from the source provider.
///
/// Grounded on the shape of `webhooks/events.rs`'s `WebhookEventType` (an enum with
/// `as_str`/`FromStr`/`Display`), generalized from three variants to the nineteen kinds named in
/// spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Customer,
    Product,
    Price,
    Plan,
    Subscription,
    SubscriptionItem,
    SubscriptionSchedule,
    Invoice,
    InvoiceLineItem,
    Charge,
    Dispute,
    PaymentIntent,
    PaymentMethod,
    SetupIntent,
    TaxId,
    CreditNote,
    CheckoutSession,
    CheckoutSessionLineItem,
    ActiveEntitlement,
}

impl EntityKind {
    pub const ALL: [EntityKind; 19] = [
        EntityKind::Customer,
        EntityKind::Product,
        EntityKind::Price,
        EntityKind::Plan,
        EntityKind::Subscription,
        EntityKind::SubscriptionItem,
        EntityKind::SubscriptionSchedule,
        EntityKind::Invoice,
        EntityKind::InvoiceLineItem,
        EntityKind::Charge,
        EntityKind::Dispute,
        EntityKind::PaymentIntent,
        EntityKind::PaymentMethod,
        EntityKind::SetupIntent,
        EntityKind::TaxId,
        EntityKind::CreditNote,
        EntityKind::CheckoutSession,
        EntityKind::CheckoutSessionLineItem,
        EntityKind::ActiveEntitlement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Customer => "customer",
            EntityKind::Product => "product",
            EntityKind::Price => "price",
            EntityKind::Plan => "plan",
            EntityKind::Subscription => "subscription",
            EntityKind::SubscriptionItem => "subscription_item",
            EntityKind::SubscriptionSchedule => "subscription_schedule",
            EntityKind::Invoice => "invoice",
            EntityKind::InvoiceLineItem => "invoice_line_item",
            EntityKind::Charge => "charge",
            EntityKind::Dispute => "dispute",
            EntityKind::PaymentIntent => "payment_intent",
            EntityKind::PaymentMethod => "payment_method",
            EntityKind::SetupIntent => "setup_intent",
            EntityKind::TaxId => "tax_id",
            EntityKind::CreditNote => "credit_note",
            EntityKind::CheckoutSession => "checkout_session",
            EntityKind::CheckoutSessionLineItem => "checkout_session_line_item",
            EntityKind::ActiveEntitlement => "active_entitlement",
        }
    }

    /// The foreign-reference graph from §9 ("Related-entity backfill cycles"): kinds this kind
    /// points to, consulted by `backfillRelatedEntities` to prevent orphan references from
    /// out-of-order webhook arrival. The graph is a DAG in practice, so a bounded recursive walk
    /// (no cycle detection) suffices.
    pub fn related_kinds(&self) -> &'static [EntityKind] {
        match self {
            EntityKind::Invoice => &[EntityKind::Customer, EntityKind::Subscription],
            EntityKind::Subscription => &[EntityKind::Customer],
            EntityKind::Charge => &[EntityKind::Customer, EntityKind::Invoice],
            EntityKind::Dispute => &[EntityKind::Charge],
            EntityKind::PaymentIntent => &[EntityKind::Customer, EntityKind::Invoice],
            EntityKind::Price => &[EntityKind::Product],
            EntityKind::Plan => &[EntityKind::Product],
            _ => &[],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseEntityKindError(pub String);

impl fmt::Display for ParseEntityKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown entity kind: {}", self.0)
    }
}
impl std::error::Error for ParseEntityKindError {}

impl FromStr for EntityKind {
    type Err = ParseEntityKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ParseEntityKindError(s.to_string()))
    }
}

/// A single row of the generic `entities` table.
///
/// Typed projection columns are explicitly opaque to the core (spec.md §3); consumers that need
/// typed access read `raw_data` directly or project it in their own query layer downstream of
/// this crate.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct EntityRecord {
    pub kind: String,
    pub id: String,
    pub account_id: String,
    pub raw_data: serde_json::Value,
    pub created: Option<i64>,
    pub deleted: bool,
    pub last_synced_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A record awaiting upsert: the normalized payload plus the `created` value used for cursor
/// bookkeeping, if the kind carries one.
#[derive(Debug, Clone)]
pub struct EntityWrite {
    pub id: String,
    pub raw_data: serde_json::Value,
    pub created: Option<i64>,
}

impl EntityWrite {
    pub fn from_raw(raw_data: serde_json::Value) -> Self {
        let id = raw_data.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let created = raw_data.get("created").and_then(|v| v.as_i64());
        Self { id, raw_data, created }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_as_str() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_str(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(EntityKind::from_str("not_a_kind").is_err());
    }

    #[test]
    fn invoice_related_kinds_match_the_documented_graph() {
        assert_eq!(EntityKind::Invoice.related_kinds(), &[EntityKind::Customer, EntityKind::Subscription]);
    }
}
