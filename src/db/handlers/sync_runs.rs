//! The Sync Run Coordinator's storage (spec.md §4.6): one running sync run per account (I4),
//! enforced by `sync_runs_one_running_per_account`, a partial unique index rather than an
//! application-level check, so the guarantee holds even across concurrent processes.

use crate::db::errors::{DbError, Result};
use crate::db::models::sync_run::{SyncRun, SyncRunStatus};
use sqlx::PgConnection;

pub struct SyncRuns<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> SyncRuns<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    /// Starts a new sync run, or returns the account's already-running one if the partial unique
    /// index rejects the insert. Mirrors the find-or-create pattern the Managed Endpoint Registry
    /// uses under its advisory lock, except here the database constraint itself is the
    /// serialization point.
    pub async fn get_or_create_sync_run(&mut self, account_id: &str, triggered_by: Option<&str>, max_concurrent: i32) -> Result<SyncRun> {
        let inserted = sqlx::query_as(
            r#"
            insert into sync_runs (account_id, started_at, status, triggered_by, max_concurrent)
            values ($1, now(), 'running', $2, $3)
            returning id, account_id, started_at, status, triggered_by, max_concurrent, completed_at, error_message
            "#,
        )
        .bind(account_id)
        .bind(triggered_by)
        .bind(max_concurrent)
        .fetch_one(&mut *self.conn)
        .await;

        match inserted {
            Ok(run) => Ok(run),
            Err(e) => {
                let db_err = DbError::from(e);
                if matches!(&db_err, DbError::UniqueViolation { constraint, .. } if constraint.as_deref() == Some("sync_runs_one_running_per_account")) {
                    self.get_active_sync_run(account_id).await?.ok_or(db_err)
                } else {
                    Err(db_err)
                }
            }
        }
    }

    pub async fn get_active_sync_run(&mut self, account_id: &str) -> Result<Option<SyncRun>> {
        let row = sqlx::query_as(
            "select id, account_id, started_at, status, triggered_by, max_concurrent, completed_at, error_message from sync_runs where account_id = $1 and status = 'running'",
        )
        .bind(account_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(row)
    }

    pub async fn get_by_id(&mut self, id: i64) -> Result<Option<SyncRun>> {
        let row = sqlx::query_as(
            "select id, account_id, started_at, status, triggered_by, max_concurrent, completed_at, error_message from sync_runs where id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(row)
    }

    pub async fn complete_sync_run(&mut self, id: i64) -> Result<()> {
        sqlx::query("update sync_runs set status = 'complete', completed_at = now() where id = $1 and status = 'running'")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    pub async fn fail_sync_run(&mut self, id: i64, error_message: &str) -> Result<()> {
        sqlx::query("update sync_runs set status = 'error', completed_at = now(), error_message = $2 where id = $1 and status = 'running'")
            .bind(id)
            .bind(error_message)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    /// Marks as `error` any of `account_id`'s runs still `running` whose most recently touched
    /// object run (or, if it has none yet, whose own `started_at`) is older than `older_than` —
    /// crash recovery for runs whose owning process died without reaching
    /// `complete_sync_run`/`fail_sync_run`. Staleness is inactivity, not age: a backfill still
    /// checkpointing via `object_runs::update_progress` must never be cancelled out from under it
    /// just for running long. Mirrors `cancel_stale_leases` in `leader_election.rs`.
    pub async fn cancel_stale_runs(&mut self, account_id: &str, older_than: chrono::DateTime<chrono::Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            update sync_runs
            set status = 'error', completed_at = now(), error_message = 'stale: no object run activity within the timeout'
            where status = 'running'
              and account_id = $1
              and coalesce(
                    (select max(object_runs.updated_at) from object_runs where object_runs.sync_run_id = sync_runs.id),
                    sync_runs.started_at
                  ) < $2
            "#,
        )
        .bind(account_id)
        .bind(older_than)
        .execute(&mut *self.conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub fn status_to_text(status: SyncRunStatus) -> &'static str {
        match status {
            SyncRunStatus::Running => "running",
            SyncRunStatus::Complete => "complete",
            SyncRunStatus::Error => "error",
        }
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
    async fn second_concurrent_run_for_same_account_reuses_the_active_one(pool: sqlx::PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        seed_account(&mut conn).await;
        let mut runs = SyncRuns::new(&mut conn);

        let first = runs.get_or_create_sync_run("acct_1", Some("cron"), 5).await.unwrap();
        let second = runs.get_or_create_sync_run("acct_1", Some("manual"), 5).await.unwrap();

        assert_eq!(first.id, second.id);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn completing_a_run_allows_a_new_one_to_start(pool: sqlx::PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        seed_account(&mut conn).await;
        let mut runs = SyncRuns::new(&mut conn);

        let first = runs.get_or_create_sync_run("acct_1", None, 5).await.unwrap();
        runs.complete_sync_run(first.id).await.unwrap();
        let second = runs.get_or_create_sync_run("acct_1", None, 5).await.unwrap();

        assert_ne!(first.id, second.id);
    }

    async fn seed_run_started_at(conn: &mut PgConnection, account_id: &str, started_at: chrono::DateTime<chrono::Utc>) -> i64 {
        sqlx::query("insert into accounts (id) values ($1) on conflict do nothing").bind(account_id).execute(&mut *conn).await.unwrap();
        let (id,): (i64,) = sqlx::query_as(
            "insert into sync_runs (account_id, started_at, status, max_concurrent) values ($1, $2, 'running', 5) returning id",
        )
        .bind(account_id)
        .bind(started_at)
        .fetch_one(&mut *conn)
        .await
        .unwrap();
        id
    }

    async fn seed_object_run_touched_at(conn: &mut PgConnection, sync_run_id: i64, account_id: &str, updated_at: chrono::DateTime<chrono::Utc>) {
        sqlx::query(
            "insert into object_runs (sync_run_id, account_id, object, status, processed_count, cursor, updated_at) values ($1, $2, 'customer', 'running', 0, null, $3)",
        )
        .bind(sync_run_id)
        .bind(account_id)
        .bind(updated_at)
        .execute(&mut *conn)
        .await
        .unwrap();
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn a_run_with_no_recent_object_run_activity_is_cancelled(pool: sqlx::PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let old = chrono::Utc::now() - chrono::Duration::hours(1);
        let sync_run_id = seed_run_started_at(&mut conn, "acct_1", old).await;

        let cancelled = SyncRuns::new(&mut conn).cancel_stale_runs("acct_1", chrono::Utc::now() - chrono::Duration::minutes(5)).await.unwrap();
        assert_eq!(cancelled, 1);

        let run = SyncRuns::new(&mut conn).get_by_id(sync_run_id).await.unwrap().unwrap();
        assert_eq!(run.status, SyncRunStatus::Error);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn a_run_with_recent_object_run_activity_survives_despite_its_age(pool: sqlx::PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let old = chrono::Utc::now() - chrono::Duration::hours(1);
        let sync_run_id = seed_run_started_at(&mut conn, "acct_1", old).await;
        seed_object_run_touched_at(&mut conn, sync_run_id, "acct_1", chrono::Utc::now()).await;

        let cancelled = SyncRuns::new(&mut conn).cancel_stale_runs("acct_1", chrono::Utc::now() - chrono::Duration::minutes(5)).await.unwrap();
        assert_eq!(cancelled, 0);

        let run = SyncRuns::new(&mut conn).get_by_id(sync_run_id).await.unwrap().unwrap();
        assert_eq!(run.status, SyncRunStatus::Running);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn cancellation_is_scoped_to_the_given_account(pool: sqlx::PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let old = chrono::Utc::now() - chrono::Duration::hours(1);
        let other_account_run = seed_run_started_at(&mut conn, "acct_2", old).await;

        let cancelled = SyncRuns::new(&mut conn).cancel_stale_runs("acct_1", chrono::Utc::now() - chrono::Duration::minutes(5)).await.unwrap();
        assert_eq!(cancelled, 0);

        let run = SyncRuns::new(&mut conn).get_by_id(other_account_run).await.unwrap().unwrap();
        assert_eq!(run.status, SyncRunStatus::Running);
    }
}
