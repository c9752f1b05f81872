//! Managed Endpoint Registry (spec.md §4.4): owns the lifecycle of webhook endpoints registered
//! at the source provider on this installation's behalf.

use crate::db::advisory_lock;
use crate::db::handlers::ManagedWebhooks;
use crate::db::models::managed_webhook::ManagedWebhook;
use crate::errors::Result;
use crate::source_api::SourceApi;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

pub struct Registry {
    pool: PgPool,
    source_api: Arc<dyn SourceApi>,
}

impl Registry {
    pub fn new(pool: PgPool, source_api: Arc<dyn SourceApi>) -> Self {
        Self { pool, source_api }
    }

    /// Returns the managed endpoint for `(account_id, base_url)`, registering one at the source
    /// if it doesn't exist yet. Idempotent across processes and restarts: the lookup key is the
    /// bare `base_url`, not anything minted per call, so a second caller (or the same caller after
    /// a restart) finds the row a prior call already created instead of registering a duplicate.
    ///
    /// Concurrent callers for the same pair are serialized on an advisory lock keyed by
    /// `"webhook:{account_id}:{base_url}"` (§4.4); the lock is held on a single dedicated
    /// connection for the lookup-then-maybe-create critical section, then released regardless of
    /// outcome.
    pub async fn find_or_create(&self, account_id: &str, base_url: &str) -> Result<ManagedWebhook> {
        let lock_key = format!("webhook:{account_id}:{base_url}");
        let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
        advisory_lock::acquire(&mut conn, &lock_key).await?;

        let result = self.find_or_create_locked(&mut conn, account_id, base_url).await;

        let _ = advisory_lock::release(&mut conn, &lock_key).await;
        result
    }

    async fn find_or_create_locked(&self, conn: &mut sqlx::PgConnection, account_id: &str, base_url: &str) -> Result<ManagedWebhook> {
        let mut webhooks = ManagedWebhooks::new(conn);
        if let Some(existing) = webhooks.find_by_account_and_url(account_id, base_url).await? {
            return Ok(existing);
        }

        // `local_uuid` is minted here, before the row exists, because the callback URL we
        // register at the source must already contain it: it's how `/stripe-webhooks/:endpoint_uuid`
        // finds this row's secret when an event arrives. `url` itself stays the bare `base_url` —
        // that's the stable key this install is known by, independent of which uuid its current
        // registration happens to carry.
        let local_uuid = Uuid::new_v4();
        let callback_url = format!("{}/stripe-webhooks/{}", base_url.trim_end_matches('/'), local_uuid);
        let (provider_webhook_id, secret) = self.source_api.create_webhook_endpoint(&callback_url).await?;

        match webhooks.create(local_uuid, &provider_webhook_id, account_id, base_url, &secret).await {
            Ok(created) => Ok(created),
            Err(e) if crate::db::errors::is_duplicate_managed_webhook(&e) => {
                // Another process won the race despite the advisory lock (e.g. a stale lock from
                // a crashed holder); the unique constraint is the backstop named in §4.4.
                let _ = self.source_api.delete_webhook_endpoint(&provider_webhook_id).await;
                webhooks
                    .find_by_account_and_url(account_id, base_url)
                    .await?
                    .ok_or(e)
                    .map_err(Into::into)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Tears down a managed endpoint: best-effort at the source, then the local row. Called on
    /// shutdown unless `KEEP_WEBHOOKS_ON_SHUTDOWN` is set.
    pub async fn delete(&self, local_uuid: Uuid) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
        let mut webhooks = ManagedWebhooks::new(&mut conn);
        if let Some(endpoint) = webhooks.find_by_uuid(local_uuid).await? {
            self.source_api.delete_webhook_endpoint(&endpoint.provider_webhook_id).await?;
        }
        webhooks.delete(local_uuid).await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<ManagedWebhook>> {
        let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
        let mut webhooks = ManagedWebhooks::new(&mut conn);
        Ok(webhooks.list().await?)
    }
}
