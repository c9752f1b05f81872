//! Row type for the `managed_webhooks` table (spec.md §3, "Managed Webhook").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct ManagedWebhook {
    pub local_uuid: Uuid,
    pub provider_webhook_id: String,
    pub account_id: String,
    pub url: String,
    pub secret: String,
    pub created_at: DateTime<Utc>,
}
