use std::time::Duration;

use anyhow::Context;
use chrono::{Datelike, Local, NaiveDate};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::{
    db::{format_stamp, now_stamp},
    identity::Identity,
    plans::Operation,
};

/// Append-only usage ledger backed by the `usage_tracking` table.
///
/// Events are written in two steps: `reserve` atomically inserts a
/// `pending` row only while the identity is under its limit, and the row is
/// either committed after the processing step succeeds or released on
/// failure. Failed jobs therefore never consume quota, and two concurrent
/// requests cannot both slip past the limit the way a separate
/// check-then-record sequence would allow.
#[derive(Clone)]
pub struct UsageLedger {
    pool: SqlitePool,
    pending_ttl: Duration,
}

/// Handle to a pending ledger row.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: String,
}

#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    Allowed(Reservation),
    Denied { used: i64 },
}

impl UsageLedger {
    pub fn new(pool: SqlitePool, pending_ttl: Duration) -> Self {
        Self { pool, pending_ttl }
    }

    /// Attempts to reserve one usage event. The insert and the limit check
    /// are a single statement, so the check cannot race a concurrent
    /// reservation for the same identity. A negative limit always allows.
    ///
    /// Committed events plus unexpired pending reservations inside the
    /// identity's period count toward the limit; `used == limit` denies.
    pub async fn reserve(
        &self,
        identity: &Identity,
        operation: Operation,
        limit: i64,
    ) -> anyhow::Result<ReserveOutcome> {
        let (user_id, fingerprint) = match identity.ledger_columns() {
            Some(columns) => columns,
            None => anyhow::bail!("untracked identity cannot hold a reservation"),
        };

        let id = Uuid::new_v4().to_string();
        let now = now_stamp();
        let expires_at = format_stamp(
            Local::now().naive_local()
                + chrono::Duration::from_std(self.pending_ttl).unwrap_or(chrono::Duration::zero()),
        );
        let period_start = period_start_column(identity);

        let inserted = sqlx::query(
            r#"
            INSERT INTO usage_tracking (id, user_id, fingerprint, operation, status, expires_at, created_at)
            SELECT ?1, ?2, ?3, ?4, 'pending', ?5, ?6
            WHERE ?7 < 0
               OR (
                    SELECT COUNT(*) FROM usage_tracking
                     WHERE operation = ?4
                       AND ((?2 IS NOT NULL AND user_id = ?2)
                         OR (?3 IS NOT NULL AND fingerprint = ?3))
                       AND (status = 'committed'
                         OR (status = 'pending' AND expires_at > ?6))
                       AND (?8 IS NULL OR created_at >= ?8)
                  ) < ?7
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(fingerprint)
        .bind(operation.as_str())
        .bind(&expires_at)
        .bind(&now)
        .bind(limit)
        .bind(&period_start)
        .execute(&self.pool)
        .await
        .context("failed to reserve usage event")?;

        if inserted.rows_affected() == 1 {
            Ok(ReserveOutcome::Allowed(Reservation { id }))
        } else {
            // Report the same total the denial was based on, pending
            // reservations included.
            let used = self.count_active(identity, operation).await?;
            Ok(ReserveOutcome::Denied { used })
        }
    }

    /// Flips a pending reservation to a committed, immutable event.
    pub async fn commit(&self, reservation: &Reservation) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            "UPDATE usage_tracking SET status = 'committed', expires_at = NULL \
             WHERE id = ?1 AND status = 'pending'",
        )
        .bind(&reservation.id)
        .execute(&self.pool)
        .await
        .context("failed to commit usage reservation")?;

        Ok(updated.rows_affected() == 1)
    }

    /// Drops a pending reservation after a failed job.
    pub async fn release(&self, reservation: &Reservation) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM usage_tracking WHERE id = ?1 AND status = 'pending'")
            .bind(&reservation.id)
            .execute(&self.pool)
            .await
            .context("failed to release usage reservation")?;
        Ok(())
    }

    /// Committed events for this identity within its active period:
    /// calendar month for users, lifetime for fingerprints.
    pub async fn count_committed(
        &self,
        identity: &Identity,
        operation: Operation,
    ) -> anyhow::Result<i64> {
        let (user_id, fingerprint) = match identity.ledger_columns() {
            Some(columns) => columns,
            None => return Ok(0),
        };
        let period_start = period_start_column(identity);

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS used FROM usage_tracking
             WHERE operation = ?1
               AND status = 'committed'
               AND ((?2 IS NOT NULL AND user_id = ?2)
                 OR (?3 IS NOT NULL AND fingerprint = ?3))
               AND (?4 IS NULL OR created_at >= ?4)
            "#,
        )
        .bind(operation.as_str())
        .bind(user_id)
        .bind(fingerprint)
        .bind(&period_start)
        .fetch_one(&self.pool)
        .await
        .context("failed to count usage events")?;

        Ok(row.get::<i64, _>("used"))
    }

    /// Everything currently counted against the limit: committed events
    /// plus unexpired pending reservations, within the identity's period.
    /// This is the total the reserve check compares against.
    pub async fn count_active(
        &self,
        identity: &Identity,
        operation: Operation,
    ) -> anyhow::Result<i64> {
        let (user_id, fingerprint) = match identity.ledger_columns() {
            Some(columns) => columns,
            None => return Ok(0),
        };
        let period_start = period_start_column(identity);

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS used FROM usage_tracking
             WHERE operation = ?1
               AND ((?2 IS NOT NULL AND user_id = ?2)
                 OR (?3 IS NOT NULL AND fingerprint = ?3))
               AND (status = 'committed'
                 OR (status = 'pending' AND expires_at > ?4))
               AND (?5 IS NULL OR created_at >= ?5)
            "#,
        )
        .bind(operation.as_str())
        .bind(user_id)
        .bind(fingerprint)
        .bind(now_stamp())
        .bind(&period_start)
        .fetch_one(&self.pool)
        .await
        .context("failed to count active usage events")?;

        Ok(row.get::<i64, _>("used"))
    }

    /// Cheap connectivity probe for the health endpoint.
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    #[cfg(test)]
    pub(crate) fn pool_for_tests(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Removes pending reservations whose TTL elapsed, leftovers from a
    /// crash between reserve and commit/release.
    pub async fn prune_expired(&self) -> anyhow::Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM usage_tracking WHERE status = 'pending' AND expires_at <= ?1",
        )
        .bind(now_stamp())
        .execute(&self.pool)
        .await
        .context("failed to prune expired reservations")?;

        Ok(deleted.rows_affected())
    }
}

/// First instant of the current calendar month, server-local time, for
/// authenticated identities. Fingerprints have no period: their events
/// count forever.
pub fn month_start() -> String {
    let today = Local::now().date_naive();
    let first = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)
        .unwrap_or(today)
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default();
    format_stamp(first)
}

fn period_start_column(identity: &Identity) -> Option<String> {
    match identity {
        Identity::User(_) => Some(month_start()),
        _ => None,
    }
}
