use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use crate::service::TriageService;

/// Background job that refreshes wait-based scores and broadcasts queue
/// snapshots at a fixed period until stopped.
pub struct Refresher {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Refresher {
    pub fn start(service: Arc<TriageService>, period: Duration) -> Self {
        Self::with_job(period, move || {
            let service = Arc::clone(&service);
            async move {
                service.refresh(Utc::now()).await;
            }
        })
    }

    /// Runs `job` once per period. A tick that panics or outlives the period
    /// is abandoned and the next one starts fresh; ticks never overlap.
    pub fn with_job<F, Fut>(period: Duration, job: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(period_ms = period.as_millis() as u64, "refresher started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let mut tick = tokio::spawn(job());
                        match time::timeout(period, &mut tick).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!(error = %e, "refresh tick failed; skipping"),
                            Err(_) => {
                                tick.abort();
                                warn!("refresh tick timed out; skipping");
                            }
                        }
                    }
                }
            }
            info!("refresher stopped");
        });

        Refresher { shutdown, handle }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            warn!(error = %e, "refresher task ended abnormally");
        }
    }
}
