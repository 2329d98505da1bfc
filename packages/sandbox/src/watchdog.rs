// ABOUTME: Watchdog loop probing sandbox container liveness on a fixed interval
// ABOUTME: Captures diagnostics and rebuilds after consecutive failures, with a capped restart budget

use crate::config::WatchdogConfig;
use crate::lifecycle::ContainerLifecycle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Result of a single watchdog check
#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogEvent {
    Healthy,
    /// Another lifecycle operation held the lock
    Skipped,
    /// Container is permanently unhealthy; no probe was made
    Suspended,
    ProbeFailed { consecutive: u32, error: String },
    Rebuilt { container_id: String },
    RebuildFailed { error: String },
    GaveUp { restarts: u32 },
}

/// Failure bookkeeping carried between checks
#[derive(Debug, Default, Clone)]
pub struct ProbeTracker {
    pub consecutive_failures: u32,
    pub rebuild_failures: u32,
    /// Rebuilds since the last healthy probe; checked against `max_restarts`
    pub unrecovered_restarts: u32,
}

pub struct Watchdog {
    lifecycle: Arc<ContainerLifecycle>,
    config: WatchdogConfig,
    running: Arc<RwLock<bool>>,
    wake: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new(lifecycle: Arc<ContainerLifecycle>, config: WatchdogConfig) -> Self {
        Self {
            lifecycle,
            config,
            running: Arc::new(RwLock::new(false)),
            wake: Arc::new(Notify::new()),
            handle: Mutex::new(None),
        }
    }

    /// Run one probe and act on the result
    pub async fn check_once(&self, tracker: &mut ProbeTracker) -> WatchdogEvent {
        check(&self.lifecycle, &self.config, tracker).await
    }

    /// Start the probing task
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return; // Already running
        }
        *running = true;
        drop(running);

        let lifecycle = self.lifecycle.clone();
        let config = self.config.clone();
        let running_flag = self.running.clone();
        let wake = self.wake.clone();

        let handle = tokio::spawn(async move {
            info!(
                "Watchdog started (interval {:?}, threshold {}, max restarts {})",
                config.interval, config.failure_threshold, config.max_restarts
            );
            let mut tracker = ProbeTracker::default();

            loop {
                let mut delay = config.interval;
                if tracker.rebuild_failures > 0 {
                    delay += backoff(config.rebuild_backoff, tracker.rebuild_failures);
                }

                tokio::select! {
                    _ = time::sleep(delay) => {}
                    _ = wake.notified() => {}
                }

                if !*running_flag.read().await {
                    info!("Watchdog stopped");
                    break;
                }

                let event = check(&lifecycle, &config, &mut tracker).await;
                debug!("Watchdog check: {:?}", event);
            }
        });

        *self.handle.lock().await = Some(handle);
    }

    /// Stop the probing task and wait for it to exit
    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.wake.notify_one();

        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Watchdog task ended abnormally: {}", e);
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

fn backoff(base: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(6);
    base * 2u32.pow(exponent)
}

async fn check(
    lifecycle: &ContainerLifecycle,
    config: &WatchdogConfig,
    tracker: &mut ProbeTracker,
) -> WatchdogEvent {
    if lifecycle.status().permanently_unhealthy {
        // A reset starts over with a full restart budget
        *tracker = ProbeTracker::default();
        return WatchdogEvent::Suspended;
    }

    let error = match lifecycle.try_probe().await {
        None => return WatchdogEvent::Skipped,
        Some(Ok(())) => {
            if tracker.consecutive_failures > 0 {
                info!(
                    "Container healthy again after {} failed probes",
                    tracker.consecutive_failures
                );
            }
            tracker.consecutive_failures = 0;
            tracker.unrecovered_restarts = 0;
            return WatchdogEvent::Healthy;
        }
        Some(Err(e)) => e.to_string(),
    };

    tracker.consecutive_failures += 1;
    warn!(
        "Liveness probe failed ({}/{}): {}",
        tracker.consecutive_failures, config.failure_threshold, error
    );
    if tracker.consecutive_failures < config.failure_threshold {
        return WatchdogEvent::ProbeFailed {
            consecutive: tracker.consecutive_failures,
            error,
        };
    }
    tracker.consecutive_failures = 0;

    let restarts = tracker.unrecovered_restarts;
    if restarts >= config.max_restarts {
        lifecycle
            .mark_permanently_unhealthy(&format!(
                "{} restarts without recovery; last probe error: {}",
                restarts, error
            ))
            .await;
        return WatchdogEvent::GaveUp { restarts };
    }
    tracker.unrecovered_restarts += 1;

    let reason = format!(
        "{} consecutive liveness probe failures: {}",
        config.failure_threshold, error
    );
    match lifecycle.recover(&reason).await {
        Ok(container_id) => {
            info!("Watchdog rebuilt container {}", container_id);
            tracker.rebuild_failures = 0;
            WatchdogEvent::Rebuilt { container_id }
        }
        Err(e) => {
            error!("Watchdog rebuild failed: {}", e);
            tracker.rebuild_failures += 1;
            WatchdogEvent::RebuildFailed {
                error: e.to_string(),
            }
        }
    }
}
