//! The Persistence Gateway's entity operations (spec.md §4.1): `upsert`, `delete`, `find_missing`.
//!
//! Grounded on `db/handlers/webhooks.rs`'s repository shape (a struct wrapping
//! `&mut PgConnection`, methods returning `db::errors::Result`), generalized from one table to a
//! kind-partitioned generic table.

use crate::db::errors::Result;
use crate::db::models::entity::{EntityKind, EntityRecord, EntityWrite};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;

pub struct Entities<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> Entities<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    /// Inserts or updates each record by `(kind, id, account_id)`.
    ///
    /// `raw_data`, `created`, and `deleted` are overwritten only when the existing
    /// `last_synced_at` is `NULL` or strictly less than `synced_at` (I2) — an older write is a
    /// silent no-op, enforced by the `ON CONFLICT ... WHERE` guard rather than a read-then-write
    /// race. Returns the rows that were actually written (a stale write contributes nothing to
    /// the returned vec).
    pub async fn upsert(
        &mut self,
        kind: EntityKind,
        account_id: &str,
        records: &[EntityWrite],
        synced_at: DateTime<Utc>,
    ) -> Result<Vec<EntityRecord>> {
        let mut written = Vec::with_capacity(records.len());
        for record in records {
            let row: Option<EntityRecord> = sqlx::query_as(
                r#"
                insert into entities (kind, id, account_id, raw_data, created, deleted, last_synced_at, updated_at)
                values ($1, $2, $3, $4, $5, false, $6, now())
                on conflict (kind, id, account_id) do update set
                    raw_data = excluded.raw_data,
                    created = excluded.created,
                    last_synced_at = excluded.last_synced_at,
                    updated_at = now()
                where entities.last_synced_at is null or entities.last_synced_at < excluded.last_synced_at
                returning kind, id, account_id, raw_data, created, deleted, last_synced_at, updated_at
                "#,
            )
            .bind(kind.as_str())
            .bind(&record.id)
            .bind(account_id)
            .bind(&record.raw_data)
            .bind(record.created)
            .bind(synced_at)
            .fetch_optional(&mut *self.conn)
            .await?;

            if let Some(row) = row {
                written.push(row);
            }
        }
        Ok(written)
    }

    /// Marks a row `deleted=true` without removing it (used for soft-delete kinds, e.g.
    /// subscription items and canceled subscriptions), honoring the same freshness guard as
    /// `upsert`.
    pub async fn soft_delete(&mut self, kind: EntityKind, id: &str, account_id: &str, synced_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            update entities set deleted = true, last_synced_at = $4, updated_at = now()
            where kind = $1 and id = $2 and account_id = $3
              and (last_synced_at is null or last_synced_at < $4)
            "#,
        )
        .bind(kind.as_str())
        .bind(id)
        .bind(account_id)
        .bind(synced_at)
        .execute(&mut *self.conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Hard-deletes a row by `(kind, id, account_id)`. Returns whether a row was removed.
    pub async fn delete(&mut self, kind: EntityKind, id: &str, account_id: &str) -> Result<bool> {
        let result = sqlx::query("delete from entities where kind = $1 and id = $2 and account_id = $3")
            .bind(kind.as_str())
            .bind(id)
            .bind(account_id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns the subset of `ids` not present for `(kind, account_id)`. Used by the Entity
    /// Upserter to decide which related entities need fetching (§4.1, "Related-entity backfill").
    pub async fn find_missing(&mut self, kind: EntityKind, ids: &[String], account_id: &str) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let present: Vec<String> = sqlx::query_scalar(
            "select id from entities where kind = $1 and account_id = $2 and id = any($3)",
        )
        .bind(kind.as_str())
        .bind(account_id)
        .bind(ids)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(ids.iter().filter(|id| !present.contains(id)).cloned().collect())
    }

    /// Marks as soft-deleted any row of `kind` belonging to `parent_id` (via the given SQL path
    /// into `raw_data`) whose id is not in `keep_ids`. Used for subscription-item pruning (§4.2)
    /// and active-entitlement pruning (§4.2).
    pub async fn soft_delete_missing_children(
        &mut self,
        kind: EntityKind,
        account_id: &str,
        parent_json_path: &str,
        parent_id: &str,
        keep_ids: &[String],
        synced_at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            update entities set deleted = true, last_synced_at = $5, updated_at = now()
            where kind = $1 and account_id = $2
              and raw_data #>> $3::text[] = $4
              and not (id = any($6))
              and (last_synced_at is null or last_synced_at < $5)
            "#,
        )
        .bind(kind.as_str())
        .bind(account_id)
        .bind(parent_json_path.split('.').collect::<Vec<_>>())
        .bind(parent_id)
        .bind(synced_at)
        .bind(keep_ids)
        .execute(&mut *self.conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Deletes (hard) any row of `kind` belonging to `parent_id` whose id is not in `keep_ids`.
    /// Used for active-entitlement pruning, which spec.md §4.2 specifies as a delete rather than
    /// a soft-delete.
    pub async fn delete_missing_children(
        &mut self,
        kind: EntityKind,
        account_id: &str,
        parent_json_path: &str,
        parent_id: &str,
        keep_ids: &[String],
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            delete from entities
            where kind = $1 and account_id = $2
              and raw_data #>> $3::text[] = $4
              and not (id = any($5))
            "#,
        )
        .bind(kind.as_str())
        .bind(account_id)
        .bind(parent_json_path.split('.').collect::<Vec<_>>())
        .bind(parent_id)
        .bind(keep_ids)
        .execute(&mut *self.conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_by_id(&mut self, kind: EntityKind, id: &str, account_id: &str) -> Result<Option<EntityRecord>> {
        let row = sqlx::query_as(
            "select kind, id, account_id, raw_data, created, deleted, last_synced_at, updated_at from entities where kind = $1 and id = $2 and account_id = $3",
        )
        .bind(kind.as_str())
        .bind(id)
        .bind(account_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(row)
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
    async fn upsert_inserts_new_row(pool: sqlx::PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        seed_account(&mut conn).await;
        let mut entities = Entities::new(&mut conn);
        let now = Utc::now();

        let written = entities
            .upsert(
                EntityKind::Customer,
                "acct_1",
                &[EntityWrite {
                    id: "cus_1".into(),
                    raw_data: serde_json::json!({"id": "cus_1", "email": "a@b.com"}),
                    created: Some(1704902400),
                }],
                now,
            )
            .await
            .unwrap();

        assert_eq!(written.len(), 1);
        assert_eq!(written[0].id, "cus_1");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn stale_write_is_a_no_op(pool: sqlx::PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        seed_account(&mut conn).await;
        let mut entities = Entities::new(&mut conn);
        let t0 = Utc::now();
        let t_earlier = t0 - chrono::Duration::seconds(60);

        entities
            .upsert(
                EntityKind::Charge,
                "acct_1",
                &[EntityWrite {
                    id: "ch_1".into(),
                    raw_data: serde_json::json!({"id": "ch_1", "paid": true}),
                    created: Some(1704902400),
                }],
                t0,
            )
            .await
            .unwrap();

        let written = entities
            .upsert(
                EntityKind::Charge,
                "acct_1",
                &[EntityWrite {
                    id: "ch_1".into(),
                    raw_data: serde_json::json!({"id": "ch_1", "paid": false}),
                    created: Some(1704902400),
                }],
                t_earlier,
            )
            .await
            .unwrap();

        assert!(written.is_empty(), "a stale write must not be reported as written");

        let row = entities.get_by_id(EntityKind::Charge, "ch_1", "acct_1").await.unwrap().unwrap();
        assert_eq!(row.raw_data["paid"], serde_json::json!(true));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn find_missing_returns_only_absent_ids(pool: sqlx::PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        seed_account(&mut conn).await;
        let mut entities = Entities::new(&mut conn);
        entities
            .upsert(
                EntityKind::Product,
                "acct_1",
                &[EntityWrite {
                    id: "prod_1".into(),
                    raw_data: serde_json::json!({"id": "prod_1"}),
                    created: Some(1704902400),
                }],
                Utc::now(),
            )
            .await
            .unwrap();

        let missing = entities
            .find_missing(EntityKind::Product, &["prod_1".into(), "prod_2".into()], "acct_1")
            .await
            .unwrap();

        assert_eq!(missing, vec!["prod_2".to_string()]);
    }
}
