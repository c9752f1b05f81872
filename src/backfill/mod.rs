//! Backfill Engine (spec.md §4.5): drives one entity kind, or all kinds, from the source list API
//! into the database, checkpointing cursors so a crash resumes rather than restarts.

use crate::db::handlers::{ObjectRuns, SyncRuns};
use crate::db::models::entity::EntityKind;
use crate::entities::Upserter;
use crate::errors::{Error, Result};
use crate::source_api::SourceApi;
use chrono::Utc;
use sqlx::PgPool;
use std::str::FromStr;
use std::sync::Arc;

/// Checkpoint cadence named in spec.md §4.5: the cursor is written after every 100 processed
/// records, i.e. after every page (list pages are themselves size 100).
const CHECKPOINT_EVERY: usize = 100;

pub struct Engine {
    pool: PgPool,
    source_api: Arc<dyn SourceApi>,
    upserter: Upserter,
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessNextResult {
    pub processed: usize,
    pub has_more: bool,
    pub run_started_at: chrono::DateTime<Utc>,
}

impl Engine {
    pub fn new(pool: PgPool, source_api: Arc<dyn SourceApi>, upserter: Upserter) -> Self {
        Self { pool, source_api, upserter }
    }

    /// Processes one page of `kind` within `account_id`'s current (or newly-created) sync run.
    /// Joins or creates the run, claims the object (honoring `max_concurrent`), reads a page,
    /// upserts, checkpoints the cursor, and marks the object/run `complete` when pages are
    /// exhausted (spec.md §4.5).
    pub async fn process_next(&self, account_id: &str, kind: EntityKind, created_gte: Option<i64>, max_concurrent: i32) -> Result<ProcessNextResult> {
        let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
        let sync_run = SyncRuns::new(&mut conn).get_or_create_sync_run(account_id, Some("backfill"), max_concurrent).await?;

        let mut object_runs = ObjectRuns::new(&mut conn);
        if object_runs.try_start_object_sync(sync_run.id).await?.is_none() {
            // Either nothing pending yet (first call for this kind) or at the concurrency limit;
            // seed this kind's row if it doesn't exist, then retry the claim once.
            let existing = sqlx::query_scalar::<_, i64>("select count(*) from object_runs where sync_run_id = $1 and object = $2")
                .bind(sync_run.id)
                .bind(kind.as_str())
                .fetch_one(&mut *conn)
                .await
                .map_err(crate::db::errors::DbError::from)?;
            if existing == 0 {
                ObjectRuns::new(&mut conn).create_object_runs(sync_run.id, account_id, &[kind.as_str()]).await?;
            }
        }
        drop(conn);

        let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
        let object_run = ObjectRuns::new(&mut conn)
            .try_start_object_sync(sync_run.id)
            .await?
            .ok_or_else(|| Error::Internal { operation: format!("claim object run for {kind}") })?;
        drop(conn);

        let effective_cursor = created_gte.or(object_run.cursor);
        let starting_after = None; // cursor is a `created` filter, not a page token, per §4.5

        let page_result = self.source_api.list_page(kind.as_str(), effective_cursor, starting_after).await;

        let page = match page_result {
            Ok(page) => page,
            Err(e) => {
                let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
                ObjectRuns::new(&mut conn).fail_object_sync(object_run.id, &e.to_string()).await?;
                return Err(e);
            }
        };

        let page_cursor = page.records.iter().filter_map(|r| r.get("created").and_then(|c| c.as_i64())).max();

        self.upserter.upsert(kind, account_id, page.records.clone(), Utc::now()).await?;

        let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
        let new_cursor = match (object_run.cursor, page_cursor) {
            (Some(existing), Some(new)) => Some(existing.max(new)),
            (None, Some(new)) => Some(new),
            (existing, None) => existing,
        };
        ObjectRuns::new(&mut conn)
            .update_progress(object_run.id, page.records.len() as i64, new_cursor)
            .await?;

        if !page.has_more {
            ObjectRuns::new(&mut conn).complete_object_sync(object_run.id).await?;
            if ObjectRuns::new(&mut conn).are_all_complete(sync_run.id).await? {
                SyncRuns::new(&mut conn).complete_sync_run(sync_run.id).await?;
            }
        }

        Ok(ProcessNextResult { processed: page.records.len(), has_more: page.has_more, run_started_at: sync_run.started_at })
    }

    /// Loops `process_next` for `kind_filter` ("all" or a specific kind name) until every object
    /// in the run reaches a terminal state.
    pub async fn process_until_done(&self, account_id: &str, kind_filter: &str, created_gte: Option<i64>, max_concurrent: i32) -> Result<()> {
        let kinds: Vec<EntityKind> = if kind_filter == "all" {
            EntityKind::ALL.to_vec()
        } else {
            vec![EntityKind::from_str(kind_filter).map_err(|e| Error::BadRequest { message: e.to_string() })?]
        };

        for kind in kinds {
            loop {
                let result = self.process_next(account_id, kind, created_gte, max_concurrent).await?;
                if !result.has_more {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Legacy top-to-bottom pagination of one kind, checkpointing the cursor every
    /// [`CHECKPOINT_EVERY`] items and on error (spec.md §4.5, "sync_backfill").
    pub async fn sync_backfill(&self, account_id: &str, kind: EntityKind, created_gte: Option<i64>) -> Result<u64> {
        let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
        let sync_run = SyncRuns::new(&mut conn).get_or_create_sync_run(account_id, Some("legacy-backfill"), 1).await?;
        ObjectRuns::new(&mut conn).create_object_runs(sync_run.id, account_id, &[kind.as_str()]).await?;
        let object_run = ObjectRuns::new(&mut conn)
            .try_start_object_sync(sync_run.id)
            .await?
            .ok_or_else(|| Error::Internal { operation: "claim object run for legacy backfill".to_string() })?;
        drop(conn);

        let mut processed_since_checkpoint = 0usize;
        let mut total_processed = 0u64;
        let mut cursor = created_gte;
        let mut starting_after: Option<String> = None;

        loop {
            let page_result = self.source_api.list_page(kind.as_str(), cursor, starting_after.as_deref()).await;
            let page = match page_result {
                Ok(page) => page,
                Err(e) => {
                    let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
                    ObjectRuns::new(&mut conn).fail_object_sync(object_run.id, &e.to_string()).await?;
                    return Err(e);
                }
            };

            let page_cursor = page.records.iter().filter_map(|r| r.get("created").and_then(|c| c.as_i64())).max();
            starting_after = page.records.last().and_then(|r| r.get("id")).and_then(|v| v.as_str()).map(str::to_string);
            let has_more = page.has_more;
            let count = page.records.len();

            self.upserter.upsert(kind, account_id, page.records, Utc::now()).await?;

            cursor = page_cursor.map(|c| cursor.map_or(c, |existing| existing.max(c))).or(cursor);
            processed_since_checkpoint += count;
            total_processed += count as u64;

            if processed_since_checkpoint >= CHECKPOINT_EVERY || !has_more {
                let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
                ObjectRuns::new(&mut conn).update_progress(object_run.id, 0, cursor).await?;
                processed_since_checkpoint = 0;
            }

            if !has_more {
                break;
            }
        }

        let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
        ObjectRuns::new(&mut conn).complete_object_sync(object_run.id).await?;
        SyncRuns::new(&mut conn).complete_sync_run(sync_run.id).await?;

        Ok(total_processed)
    }
}
