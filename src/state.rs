use std::{future::Future, sync::Arc, time::Instant};

use sqlx::SqlitePool;
use tokio::sync::Semaphore;

use crate::{
    auth::AuthService, config::Config, ledger::UsageLedger, processor::ImageProcessor,
    quota::QuotaGate, rate_limit::SlidingWindowLimiter,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: AuthService,
    pub quota: QuotaGate,
    pub ledger: UsageLedger,
    pub processor: ImageProcessor,
    pub processing_semaphore: Arc<Semaphore>,
    pub global_limiter: Arc<SlidingWindowLimiter>,
    pub process_limiter: Arc<SlidingWindowLimiter>,
    pub auth_limiter: Arc<SlidingWindowLimiter>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config, pool: SqlitePool) -> Self {
        let auth = AuthService::new(pool.clone(), &config.jwt_secret, config.admin_emails.clone());
        let ledger = UsageLedger::new(pool, config.reservation_ttl);
        let quota = QuotaGate::new(ledger.clone());
        let processor = ImageProcessor::new(
            config.python_bin.clone(),
            &config.processor_script,
            config.processing_timeout,
        );

        Self {
            processing_semaphore: Arc::new(Semaphore::new(config.processing_concurrency)),
            global_limiter: Arc::new(SlidingWindowLimiter::new(
                std::time::Duration::from_secs(15 * 60),
                100,
            )),
            process_limiter: Arc::new(SlidingWindowLimiter::new(
                std::time::Duration::from_secs(15 * 60),
                30,
            )),
            auth_limiter: Arc::new(SlidingWindowLimiter::new(
                std::time::Duration::from_secs(15 * 60),
                10,
            )),
            config: Arc::new(config),
            auth,
            quota,
            ledger,
            processor,
            started_at: Instant::now(),
        }
    }

    /// Runs one processing task under the shared concurrency gate. Requests
    /// past the limit queue on the semaphore instead of forking unbounded
    /// subprocesses.
    pub async fn run_processing_job<F, Fut, T>(&self, task_name: &str, task: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let enqueued_at = Instant::now();
        let permit = self
            .processing_semaphore
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("processing queue closed"))?;
        let started_at = Instant::now();
        let wait_ms = started_at.duration_since(enqueued_at).as_millis();

        let result = task().await;

        let run_ms = Instant::now().duration_since(started_at).as_millis();
        drop(permit);

        if self.config.log_task_queue_timings {
            let available = self.processing_semaphore.available_permits();
            let running = self
                .config
                .processing_concurrency
                .saturating_sub(available);
            tracing::info!(
                queue = "processing",
                task = task_name,
                wait_ms,
                run_ms,
                running,
                "queue timing"
            );
        }

        result
    }
}

#[cfg(test)]
pub async fn test_state() -> AppState {
    let pool = crate::db::test_pool().await;
    AppState::new(crate::config::tests::test_config(), pool)
}
