//! Polling loop and patrol supervision

use crate::config::SchedulerConfig;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use vigil_monitor::MonitorEngine;

/// Outcome of one polling tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub claimed: usize,
    pub sampled: usize,
    pub failed: usize,
    pub escalations: usize,
}

/// Fetches due Hot/Warm streams and feeds them to the engine.
pub struct Poller {
    config: SchedulerConfig,
    engine: Arc<MonitorEngine>,
    permits: Arc<Semaphore>,
}

impl Poller {
    /// Create a new poller
    pub fn new(config: SchedulerConfig, engine: Arc<MonitorEngine>) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_samples.max(1)));
        Arc::new(Self {
            config,
            engine,
            permits,
        })
    }

    /// Run until the shutdown flag flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_ms = self.config.poll_tick_ms,
            max_concurrent = self.config.max_concurrent_samples,
            "Poller started"
        );

        let mut ticker = interval(self.config.poll_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.poll_once().await;
                    if summary.claimed > 0 {
                        debug!(
                            claimed = summary.claimed,
                            sampled = summary.sampled,
                            failed = summary.failed,
                            escalations = summary.escalations,
                            "Poll tick"
                        );
                    }
                    if self.config.patrol_enabled {
                        let started = self.engine.spawn_patrols();
                        if started > 0 {
                            info!(users = started, "Started patrol loops");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Poller stopped");
    }

    /// Claim due streams and sample them under the concurrency limit.
    /// Escalations spawned by the samples keep running in the background.
    pub async fn poll_once(&self) -> PollSummary {
        let claimed = self
            .engine
            .registry()
            .claim_due(self.config.max_claims_per_tick);
        let mut summary = PollSummary {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return summary;
        }

        let mut tasks = Vec::with_capacity(claimed.len());
        for key in claimed {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let engine = self.engine.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                match engine.sample_stream(&key).await {
                    Ok(report) => Ok(report.escalations.len()),
                    Err(e) => {
                        warn!(stream = %key, error = %e, "Sample failed");
                        Err(e)
                    }
                }
            }));
        }

        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok(Ok(escalations)) => {
                    summary.sampled += 1;
                    summary.escalations += escalations;
                }
                Ok(Err(_)) => summary.failed += 1,
                Err(e) => {
                    warn!(error = %e, "Sample task failed");
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}
