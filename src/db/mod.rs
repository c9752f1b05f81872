//! Database layer: typed access to the destination PostgreSQL database (Persistence Gateway,
//! spec §4.1).
//!
//! Every entity kind is stored in a single kind-partitioned table (see [`models::entity`])
//! instead of one table per kind — the per-entity table schemas are explicitly outside the
//! core's concern, and nothing in [`handlers`] needs typed columns to do its job.
//!
//! # Modules
//!
//! - [`handlers`]: repository implementations — entities, managed webhooks, sync runs, object runs
//! - [`models`]: row types matching the tables in `migrations/`
//! - [`errors`]: database-specific error types, translated from raw `sqlx::Error`
//!
//! # Transactions
//!
//! Repositories wrap a `&mut PgConnection` (or transaction) rather than a pool, following the
//! same pattern as every other repository in this codebase:
//!
//! ```ignore
//! let mut tx = pool.begin().await?;
//! let mut entities = Entities::new(&mut tx);
//! entities.upsert(EntityKind::Customer, "acct_1", &records, synced_at).await?;
//! tx.commit().await?;
//! ```
//!
//! # Migrations
//!
//! Migrations live in `migrations/` and are run via [`crate::migrator`].

pub mod advisory_lock;
pub mod errors;
pub mod handlers;
pub mod models;

/// Registers `account_id` in the `accounts` table if it isn't already known. Every write against
/// the kind-partitioned `entities` table (and its sibling tables) has a foreign key to `accounts`,
/// so this must run before any sync activity for a previously-unseen account.
pub async fn ensure_account(pool: &sqlx::PgPool, account_id: &str) -> errors::Result<()> {
    sqlx::query("insert into accounts (id) values ($1) on conflict (id) do nothing")
        .bind(account_id)
        .execute(pool)
        .await
        .map_err(errors::DbError::from)?;
    Ok(())
}

/// Returns true if this schema was already initialized by an installation that predates the
/// `stripe-sync vN installed` schema comment marker (spec.md §6/§9) — i.e. `_sqlx_migrations`
/// exists but the marker comment is absent or doesn't match, meaning this isn't a fresh install
/// and isn't one of ours either.
pub async fn is_legacy_install(pool: &sqlx::PgPool) -> errors::Result<bool> {
    let migrations_table_exists: bool =
        sqlx::query_scalar("select exists (select 1 from pg_tables where schemaname = 'public' and tablename = '_sqlx_migrations')")
            .fetch_one(pool)
            .await
            .map_err(errors::DbError::from)?;
    if !migrations_table_exists {
        return Ok(false);
    }

    let comment: Option<String> = sqlx::query_scalar("select obj_description('public'::regnamespace, 'pg_namespace')")
        .fetch_one(pool)
        .await
        .map_err(errors::DbError::from)?;

    Ok(!matches!(comment, Some(c) if c.starts_with("stripe-sync v")))
}
