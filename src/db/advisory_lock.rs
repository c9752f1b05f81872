//! PostgreSQL advisory lock wrapper used to serialize cross-process critical sections.
//!
//! Grounded on the dedicated-connection pattern in `leader_election.rs`: advisory locks are
//! session-scoped, so the lock must be taken and released on the same connection, which must be
//! held for the duration of the critical section rather than returned to the pool in between.

use crate::db::errors::Result;
use sqlx::PgConnection;
use tracing::instrument;

/// Derives a stable 32-bit lock key from an arbitrary string key.
///
/// `pg_advisory_lock` takes a `bigint`; we fold an FNV-1a hash down to 32 bits and sign-extend so
/// the same key string always maps to the same lock id across processes (unlike
/// `std::hash::DefaultHasher`, whose output is randomized per-process).
pub fn lock_key_from_str(key: &str) -> i64 {
    const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
    const FNV_PRIME: u32 = 0x01000193;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    i64::from(hash as i32)
}

/// Blocks until the session-scoped advisory lock for `key` is held on `conn`.
///
/// Used by the Managed Endpoint Registry to serialize concurrent "find-or-create" attempts for
/// the same `(account_id, base_url)` pair across processes (§4.4). The unique constraint on
/// `(account_id, url)` remains the final backstop if two callers somehow race anyway.
#[instrument(skip(conn))]
pub async fn acquire(conn: &mut PgConnection, key: &str) -> Result<()> {
    let lock_id = lock_key_from_str(key);
    sqlx::query("select pg_advisory_lock($1)").bind(lock_id).execute(&mut *conn).await?;
    Ok(())
}

/// Releases the lock taken by [`acquire`] for the same `key`, on the same connection.
#[instrument(skip(conn))]
pub async fn release(conn: &mut PgConnection, key: &str) -> Result<()> {
    let lock_id = lock_key_from_str(key);
    sqlx::query("select pg_advisory_unlock($1)").bind(lock_id).execute(&mut *conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_stable() {
        let a = lock_key_from_str("webhook:acct_1:https://example.com/hook");
        let b = lock_key_from_str("webhook:acct_1:https://example.com/hook");
        assert_eq!(a, b);
    }

    #[test]
    fn lock_key_differs_for_different_input() {
        let a = lock_key_from_str("webhook:acct_1:https://example.com/hook");
        let b = lock_key_from_str("webhook:acct_2:https://example.com/hook");
        assert_ne!(a, b);
    }

    #[sqlx::test]
    async fn acquire_then_release_round_trips(pool: sqlx::PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        acquire(&mut conn, "test-key").await.unwrap();
        release(&mut conn, "test-key").await.unwrap();
    }
}
