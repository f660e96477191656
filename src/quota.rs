use serde::Serialize;

use crate::{
    error::ApiError,
    identity::Identity,
    ledger::{Reservation, ReserveOutcome, UsageLedger},
    plans::{operation_limit, Operation, Tier},
};

/// Quota clearance for one job. Holds the pending ledger reservation until
/// the job settles; `None` for untracked callers, who have nothing to
/// commit or release.
#[derive(Debug)]
pub struct QuotaClearance {
    pub tier: Tier,
    pub reservation: Option<Reservation>,
}

/// Per-operation usage snapshot, shaped for the usage endpoints.
#[derive(Debug, Serialize)]
pub struct OperationUsage {
    pub used: i64,
    pub limit: i64,
    pub unlimited: bool,
}

#[derive(Clone)]
pub struct QuotaGate {
    ledger: UsageLedger,
}

impl QuotaGate {
    pub fn new(ledger: UsageLedger) -> Self {
        Self { ledger }
    }

    /// The tier whose limits apply to this request. Anonymous callers get
    /// the guest tier whether or not they sent a fingerprint.
    pub fn tier_for(identity: &Identity) -> Tier {
        match identity {
            Identity::User(user) => user.tier,
            Identity::Fingerprint(_) | Identity::Untracked => Tier::Guest,
        }
    }

    /// Checks the identity against its limit for `operation` and reserves
    /// one slot. Denial maps straight to the quota error so handlers can
    /// use `?`.
    ///
    /// Untracked callers pass through without a reservation: there is no
    /// identity to attribute the event to, so it is allowed and logged
    /// rather than silently dropped or hard-rejected.
    pub async fn clear(
        &self,
        identity: &Identity,
        operation: Operation,
    ) -> Result<QuotaClearance, ApiError> {
        let tier = Self::tier_for(identity);
        let limit = operation_limit(tier, operation);

        if matches!(identity, Identity::Untracked) {
            tracing::warn!(
                operation = operation.as_str(),
                "request without token or fingerprint, usage not tracked"
            );
            return Ok(QuotaClearance {
                tier,
                reservation: None,
            });
        }

        match self.ledger.reserve(identity, operation, limit).await? {
            ReserveOutcome::Allowed(reservation) => Ok(QuotaClearance {
                tier,
                reservation: Some(reservation),
            }),
            ReserveOutcome::Denied { used } => Err(ApiError::QuotaExceeded {
                operation,
                used,
                limit,
                tier,
            }),
        }
    }

    /// Marks the cleared job as consumed. Missing reservation (untracked
    /// caller, or a reservation already pruned after a long job) is not an
    /// error; the work already happened.
    pub async fn settle_success(&self, clearance: &QuotaClearance) {
        if let Some(reservation) = &clearance.reservation {
            match self.ledger.commit(reservation).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(reservation = %reservation.id, "reservation vanished before commit");
                }
                Err(error) => {
                    tracing::error!(error = %error, "failed to commit usage reservation");
                }
            }
        }
    }

    /// Returns the reserved slot after a failed job.
    pub async fn settle_failure(&self, clearance: &QuotaClearance) {
        if let Some(reservation) = &clearance.reservation {
            if let Err(error) = self.ledger.release(reservation).await {
                tracing::error!(error = %error, "failed to release usage reservation");
            }
        }
    }

    /// Usage across all metered operations for this identity. Untracked
    /// callers report zero usage at guest limits.
    pub async fn usage_report(
        &self,
        identity: &Identity,
    ) -> anyhow::Result<Vec<(Operation, OperationUsage)>> {
        let tier = Self::tier_for(identity);
        let mut report = Vec::with_capacity(Operation::ALL.len());
        for operation in Operation::ALL {
            let limit = operation_limit(tier, operation);
            let used = self.ledger.count_committed(identity, operation).await?;
            report.push((
                operation,
                OperationUsage {
                    used,
                    limit,
                    unlimited: limit < 0,
                },
            ));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{db::test_pool, identity::AuthenticatedUser};

    async fn gate() -> QuotaGate {
        QuotaGate::new(UsageLedger::new(test_pool().await, Duration::from_secs(600)))
    }

    fn guest(fingerprint: &str) -> Identity {
        Identity::Fingerprint(fingerprint.to_string())
    }

    #[tokio::test]
    async fn guest_exhausts_the_4x_budget_after_one_job() {
        let gate = gate().await;
        let identity = guest("fp_guest");

        let clearance = gate
            .clear(&identity, Operation::Upscale4x)
            .await
            .expect("first 4x upscale allowed");
        assert_eq!(clearance.tier, Tier::Guest);
        gate.settle_success(&clearance).await;

        match gate.clear(&identity, Operation::Upscale4x).await {
            Err(ApiError::QuotaExceeded { used, limit, tier, .. }) => {
                assert_eq!(used, 1);
                assert_eq!(limit, 1);
                assert_eq!(tier, Tier::Guest);
            }
            other => panic!("expected quota denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_jobs_do_not_consume_quota() {
        let gate = gate().await;
        let identity = guest("fp_flaky");

        for _ in 0..5 {
            let clearance = gate
                .clear(&identity, Operation::Upscale4x)
                .await
                .expect("allowed while nothing committed");
            gate.settle_failure(&clearance).await;
        }

        assert!(gate.clear(&identity, Operation::Upscale4x).await.is_ok());
    }

    #[tokio::test]
    async fn untracked_callers_pass_without_reservation() {
        let gate = gate().await;
        let clearance = gate
            .clear(&Identity::Untracked, Operation::Upscale4x)
            .await
            .expect("untracked allowed");
        assert!(clearance.reservation.is_none());
        assert_eq!(clearance.tier, Tier::Guest);
        // Settling is a no-op either way.
        gate.settle_success(&clearance).await;
    }

    #[tokio::test]
    async fn resize_is_never_denied() {
        let gate = gate().await;
        let identity = guest("fp_resize");
        for _ in 0..10 {
            let clearance = gate
                .clear(&identity, Operation::Resize)
                .await
                .expect("resize allowed");
            gate.settle_success(&clearance).await;
        }
    }

    #[tokio::test]
    async fn usage_report_tracks_committed_events() {
        let gate = gate().await;
        let identity = Identity::User(AuthenticatedUser {
            id: "u1".to_string(),
            email: "u1@example.com".to_string(),
            username: "u1".to_string(),
            tier: Tier::Free,
        });
        sqlx::query(
            "INSERT INTO users (id, email, username, password, created_at, updated_at) \
             VALUES ('u1', 'u1@example.com', 'u1', 'x', ?1, ?1)",
        )
        .bind(crate::db::now_stamp())
        .execute(&gate.ledger_pool_for_tests())
        .await
        .expect("seed user");

        let clearance = gate
            .clear(&identity, Operation::Upscale2x)
            .await
            .expect("allowed");
        gate.settle_success(&clearance).await;

        let report = gate.usage_report(&identity).await.expect("report");
        for (operation, usage) in report {
            match operation {
                Operation::Upscale2x => {
                    assert_eq!(usage.used, 1);
                    assert_eq!(usage.limit, 5);
                    assert!(!usage.unlimited);
                }
                Operation::Upscale4x => assert_eq!(usage.used, 0),
                Operation::Resize => assert!(usage.unlimited),
            }
        }
    }

    impl QuotaGate {
        fn ledger_pool_for_tests(&self) -> sqlx::SqlitePool {
            self.ledger.pool_for_tests()
        }
    }
}
