use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub mod tasks;

use crate::context::AppContext;

/// Job scheduler for background tasks
///
/// Every job runs in its own task with a child of the scheduler's
/// cancellation token; cancelling the scheduler stops them all between runs.
pub struct JobScheduler {
    context: Arc<AppContext>,
    cancel: CancellationToken,
}

impl JobScheduler {
    pub fn new(context: Arc<AppContext>, cancel: CancellationToken) -> Self {
        Self { context, cancel }
    }

    /// Start all background jobs
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        info!("Starting background job scheduler");
        let retention = &self.context.config.retention;

        let handles = vec![
            // Cleanup tasks
            self.spawn("retention sweep", retention.cleanup_interval, |ctx| async move {
                tasks::retention_sweep(&ctx).await.map(|purged| {
                    if purged > 0 {
                        info!("Retention sweep removed {} files or blobs", purged);
                    }
                })
            }),
            self.spawn("stale upload cleanup", Duration::from_secs(3600), |ctx| async move {
                tasks::cleanup_stale_uploads(&ctx).await.map(|_| ())
            }),
            self.spawn("scratch sweep", Duration::from_secs(900), |ctx| async move {
                tasks::sweep_scratch(&ctx).await.map(|_| ())
            }),
            self.spawn("expired session cleanup", Duration::from_secs(3600), |ctx| async move {
                tasks::cleanup_expired_sessions(&ctx).await.map(|count| {
                    if count > 0 {
                        info!("Cleaned up {} expired sessions", count);
                    }
                })
            }),
            self.spawn("account deletion", Duration::from_secs(86400), |ctx| async move {
                tasks::purge_deleted_accounts(&ctx).await.map(|count| {
                    if count > 0 {
                        info!("Purged {} accounts after grace period", count);
                    }
                })
            }),
            // Monitoring
            self.spawn("health check", Duration::from_secs(300), |ctx| async move {
                tasks::health_check(&ctx).await
            }),
        ];

        info!("Background jobs started");
        handles
    }

    /// Run `job` now and then every `period` until cancelled
    fn spawn<F, Fut>(&self, name: &'static str, period: Duration, job: F) -> JoinHandle<()>
    where
        F: Fn(Arc<AppContext>) -> Fut + Send + 'static,
        Fut: Future<Output = crate::error::TroveResult<()>> + Send + 'static,
    {
        let context = Arc::clone(&self.context);
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                debug!("Running {} job", name);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = job(Arc::clone(&context)) => {
                        if let Err(e) = result {
                            error!("{} job failed: {}", name, e);
                        }
                    }
                }
            }

            debug!("{} job stopped", name);
        })
    }
}
