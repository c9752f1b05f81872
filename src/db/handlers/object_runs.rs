//! Per-object-kind progress tracking within a sync run (spec.md §4.5, §4.6).
//!
//! `try_start_object_sync` is grounded on `db/handlers/webhooks.rs`'s claim query
//! (`select ... for update skip locked` followed by a conditional status flip) — the same
//! "atomic claim, not read-then-write" shape, generalized from one queue table to
//! `object_runs`.

use crate::db::errors::Result;
use crate::db::models::object_run::{ObjectRun, ObjectRunStatus};
use sqlx::PgConnection;

pub struct ObjectRuns<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> ObjectRuns<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    /// Seeds one `pending` row per object kind for a freshly-started sync run.
    pub async fn create_object_runs(&mut self, sync_run_id: i64, account_id: &str, objects: &[&str]) -> Result<Vec<ObjectRun>> {
        let mut created = Vec::with_capacity(objects.len());
        for object in objects {
            let row: ObjectRun = sqlx::query_as(
                r#"
                insert into object_runs (sync_run_id, account_id, object, status, processed_count, cursor, updated_at)
                values ($1, $2, $3, 'pending', 0, null, now())
                returning id, sync_run_id, account_id, object, status, processed_count, cursor, error_message, updated_at
                "#,
            )
            .bind(sync_run_id)
            .bind(account_id)
            .bind(object)
            .fetch_one(&mut *self.conn)
            .await?;
            created.push(row);
        }
        Ok(created)
    }

    /// Atomically claims the next `pending` object run for `sync_run_id`, skipping rows locked by
    /// a concurrent claimant, and flips it to `running` — but only while fewer than the run's
    /// `max_concurrent` objects are already `running`. The row selection (`for update skip
    /// locked`) and the concurrency gate are evaluated in the same statement, so two concurrent
    /// callers can never both claim the last available slot. Returns `None` when nothing is
    /// pending or the run is already at its concurrency limit.
    pub async fn try_start_object_sync(&mut self, sync_run_id: i64) -> Result<Option<ObjectRun>> {
        let row: Option<ObjectRun> = sqlx::query_as(
            r#"
            with candidate as (
                select id from object_runs
                where sync_run_id = $1 and status = 'pending'
                order by id
                for update skip locked
                limit 1
            )
            update object_runs
            set status = 'running', updated_at = now()
            from candidate
            where object_runs.id = candidate.id
              and (
                select count(*) from object_runs running_rows
                where running_rows.sync_run_id = $1 and running_rows.status = 'running'
              ) < (select max_concurrent from sync_runs where id = $1)
            returning object_runs.id, object_runs.sync_run_id, object_runs.account_id, object_runs.object,
                      object_runs.status, object_runs.processed_count, object_runs.cursor,
                      object_runs.error_message, object_runs.updated_at
            "#,
        )
        .bind(sync_run_id)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(row)
    }

    /// Advances the processed-record counter and checkpoints the cursor (spec.md §4.5:
    /// checkpointed every 100 records).
    pub async fn update_progress(&mut self, id: i64, additional_processed: i64, cursor: Option<i64>) -> Result<()> {
        sqlx::query("update object_runs set processed_count = processed_count + $2, cursor = coalesce($3, cursor), updated_at = now() where id = $1")
            .bind(id)
            .bind(additional_processed)
            .bind(cursor)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    pub async fn complete_object_sync(&mut self, id: i64) -> Result<()> {
        sqlx::query("update object_runs set status = 'complete', updated_at = now() where id = $1 and status = 'running'")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    pub async fn fail_object_sync(&mut self, id: i64, error_message: &str) -> Result<()> {
        sqlx::query("update object_runs set status = 'error', error_message = $2, updated_at = now() where id = $1 and status = 'running'")
            .bind(id)
            .bind(error_message)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    pub async fn count_running(&mut self, sync_run_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("select count(*) from object_runs where sync_run_id = $1 and status = 'running'")
            .bind(sync_run_id)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(count)
    }

    pub async fn are_all_complete(&mut self, sync_run_id: i64) -> Result<bool> {
        let remaining: i64 = sqlx::query_scalar(
            "select count(*) from object_runs where sync_run_id = $1 and status in ('pending', 'running')",
        )
        .bind(sync_run_id)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(remaining == 0)
    }

    pub async fn any_failed(&mut self, sync_run_id: i64) -> Result<bool> {
        let failed: i64 = sqlx::query_scalar("select count(*) from object_runs where sync_run_id = $1 and status = 'error'")
            .bind(sync_run_id)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(failed > 0)
    }

    pub async fn get_by_id(&mut self, id: i64) -> Result<Option<ObjectRun>> {
        let row = sqlx::query_as(
            "select id, sync_run_id, account_id, object, status, processed_count, cursor, error_message, updated_at from object_runs where id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(row)
    }

    pub fn is_terminal(status: ObjectRunStatus) -> bool {
        matches!(status, ObjectRunStatus::Complete | ObjectRunStatus::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_sync_run(conn: &mut PgConnection, max_concurrent: i32) -> i64 {
        sqlx::query("insert into accounts (id) values ('acct_1') on conflict do nothing")
            .execute(&mut *conn)
            .await
            .unwrap();
        let (id,): (i64,) = sqlx::query_as(
            "insert into sync_runs (account_id, started_at, status, max_concurrent) values ('acct_1', now(), 'running', $1) returning id",
        )
        .bind(max_concurrent)
        .fetch_one(&mut *conn)
        .await
        .unwrap();
        id
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn claim_returns_rows_in_order_and_then_none(pool: sqlx::PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let sync_run_id = seed_sync_run(&mut conn, 5).await;
        let mut runs = ObjectRuns::new(&mut conn);
        runs.create_object_runs(sync_run_id, "acct_1", &["customer", "invoice"]).await.unwrap();

        let first = runs.try_start_object_sync(sync_run_id).await.unwrap().unwrap();
        assert_eq!(first.object, "customer");

        let second = runs.try_start_object_sync(sync_run_id).await.unwrap().unwrap();
        assert_eq!(second.object, "invoice");

        assert!(runs.try_start_object_sync(sync_run_id).await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn claim_respects_max_concurrent(pool: sqlx::PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let sync_run_id = seed_sync_run(&mut conn, 1).await;
        let mut runs = ObjectRuns::new(&mut conn);
        runs.create_object_runs(sync_run_id, "acct_1", &["customer", "invoice"]).await.unwrap();

        let first = runs.try_start_object_sync(sync_run_id).await.unwrap();
        assert!(first.is_some(), "first claim should succeed under the limit");

        let second = runs.try_start_object_sync(sync_run_id).await.unwrap();
        assert!(second.is_none(), "second claim should block while one object is already running");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn all_complete_is_false_until_every_object_finishes(pool: sqlx::PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let sync_run_id = seed_sync_run(&mut conn, 5).await;
        let mut runs = ObjectRuns::new(&mut conn);
        runs.create_object_runs(sync_run_id, "acct_1", &["customer", "invoice"]).await.unwrap();

        let first = runs.try_start_object_sync(sync_run_id).await.unwrap().unwrap();
        runs.complete_object_sync(first.id).await.unwrap();
        assert!(!runs.are_all_complete(sync_run_id).await.unwrap());

        let second = runs.try_start_object_sync(sync_run_id).await.unwrap().unwrap();
        runs.complete_object_sync(second.id).await.unwrap();
        assert!(runs.are_all_complete(sync_run_id).await.unwrap());
    }
}
