//! The Managed Endpoint Registry's storage (spec.md §4.4): one managed webhook endpoint per
//! `(account_id, url)`, registered lazily on first sync and torn down on shutdown unless
//! `KEEP_WEBHOOKS_ON_SHUTDOWN` is set.

use crate::db::errors::{self, Result};
use crate::db::models::managed_webhook::ManagedWebhook;
use sqlx::PgConnection;

pub struct ManagedWebhooks<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> ManagedWebhooks<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    pub async fn find_by_account_and_url(&mut self, account_id: &str, url: &str) -> Result<Option<ManagedWebhook>> {
        let row = sqlx::query_as(
            "select local_uuid, provider_webhook_id, account_id, url, secret, created_at from managed_webhooks where account_id = $1 and url = $2",
        )
        .bind(account_id)
        .bind(url)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(row)
    }

    pub async fn find_by_uuid(&mut self, local_uuid: uuid::Uuid) -> Result<Option<ManagedWebhook>> {
        let row = sqlx::query_as(
            "select local_uuid, provider_webhook_id, account_id, url, secret, created_at from managed_webhooks where local_uuid = $1",
        )
        .bind(local_uuid)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(row)
    }

    /// Records a freshly-registered endpoint under a caller-chosen `local_uuid` — the same uuid
    /// the caller already baked into the callback URL registered at the source, so the row the
    /// incoming-webhook route finds by uuid is the one actually holding that registration's
    /// secret. Callers are expected to have already created the remote endpoint and to be holding
    /// the per-`(account_id, url)` advisory lock (§4.4); a concurrent insert under the same key is
    /// still rejected by the table's unique constraint as a last line of defense.
    pub async fn create(&mut self, local_uuid: uuid::Uuid, provider_webhook_id: &str, account_id: &str, url: &str, secret: &str) -> Result<ManagedWebhook> {
        let row = sqlx::query_as(
            r#"
            insert into managed_webhooks (local_uuid, provider_webhook_id, account_id, url, secret, created_at)
            values ($1, $2, $3, $4, $5, now())
            returning local_uuid, provider_webhook_id, account_id, url, secret, created_at
            "#,
        )
        .bind(local_uuid)
        .bind(provider_webhook_id)
        .bind(account_id)
        .bind(url)
        .bind(secret)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(errors::DbError::from)?;
        Ok(row)
    }

    /// Updates the verification secret on file for `local_uuid`. The Live-Stream Client calls
    /// this after establishing a session, since the source provider issues a fresh session secret
    /// independent of whatever secret the endpoint was originally registered with (spec.md §4.7,
    /// "Session establishment").
    pub async fn update_secret(&mut self, local_uuid: uuid::Uuid, secret: &str) -> Result<()> {
        sqlx::query("update managed_webhooks set secret = $1 where local_uuid = $2")
            .bind(secret)
            .bind(local_uuid)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    pub async fn delete(&mut self, local_uuid: uuid::Uuid) -> Result<bool> {
        let result = sqlx::query("delete from managed_webhooks where local_uuid = $1")
            .bind(local_uuid)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list(&mut self) -> Result<Vec<ManagedWebhook>> {
        let rows = sqlx::query_as(
            "select local_uuid, provider_webhook_id, account_id, url, secret, created_at from managed_webhooks order by created_at",
        )
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_account(conn: &mut PgConnection) {
        sqlx::query("insert into accounts (id) values ('acct_1') on conflict do nothing")
            .execute(conn)
            .await
            .unwrap();
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn create_then_find_round_trips(pool: sqlx::PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        seed_account(&mut conn).await;
        let mut webhooks = ManagedWebhooks::new(&mut conn);

        let created = webhooks.create(uuid::Uuid::new_v4(), "we_1", "acct_1", "https://sync.example/hooks", "whsec_abc").await.unwrap();
        let found = webhooks.find_by_account_and_url("acct_1", "https://sync.example/hooks").await.unwrap().unwrap();

        assert_eq!(found.local_uuid, created.local_uuid);
        assert_eq!(found.provider_webhook_id, "we_1");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn duplicate_account_and_url_is_rejected(pool: sqlx::PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        seed_account(&mut conn).await;
        let mut webhooks = ManagedWebhooks::new(&mut conn);

        webhooks.create(uuid::Uuid::new_v4(), "we_1", "acct_1", "https://sync.example/hooks", "whsec_abc").await.unwrap();
        let err = webhooks.create(uuid::Uuid::new_v4(), "we_2", "acct_1", "https://sync.example/hooks", "whsec_def").await.unwrap_err();

        assert!(errors::is_duplicate_managed_webhook(&err));
    }
}
