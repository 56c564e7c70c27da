//! Background maintenance: cap enforcement, retirement, and refill.
//!
//! Three interval loops post work onto one bounded worker pool shared by
//! everything that shares the cache. Loops hold only a weak reference to
//! the cache state, so an abandoned cache winds its tasks down on its own;
//! an explicit shutdown signal stops the timers immediately.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};

use super::state::CacheState;
use super::StashConfig;
use crate::executor::Executor;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Spawn the worker pool and the periodic loops. Returns once everything
/// is scheduled; the tasks stop when the shutdown signal fires or the
/// cache state is dropped.
pub(crate) fn launch(config: &StashConfig, state: &Arc<CacheState>, inner: &Arc<dyn Executor>) {
    let (jobs, rx) = mpsc::channel::<Job>(config.queue.max(1));
    let rx = Arc::new(Mutex::new(rx));
    for _ in 0..config.workers.max(1) {
        let rx = rx.clone();
        tokio::spawn(async move {
            loop {
                let job = { rx.lock().await.recv().await };
                match job {
                    Some(job) => job.await,
                    None => break,
                }
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    state.set_shutdown(shutdown_tx);

    if let Some(period) = config.cap_interval {
        let cap = config.cap;
        spawn_periodic(
            period,
            shutdown_rx.clone(),
            Arc::downgrade(state),
            jobs.clone(),
            move |state: Arc<CacheState>| -> Job {
                Box::pin(async move {
                    let dropped = state.cap_pass(cap);
                    if dropped > 0 {
                        tracing::debug!(dropped, cap, "cache cap enforced");
                    }
                })
            },
        );
    }

    if let Some(period) = config.retire_interval {
        let retire_after = config.retire_after;
        spawn_periodic(
            period,
            shutdown_rx.clone(),
            Arc::downgrade(state),
            jobs.clone(),
            move |state: Arc<CacheState>| -> Job {
                Box::pin(async move {
                    let dropped = state.retire_pass(retire_after);
                    if dropped > 0 {
                        tracing::debug!(dropped, "retired idle cache entries");
                    }
                })
            },
        );
    }

    if let Some(period) = config.refill_interval {
        let delay = config.refill_delay;
        let state = Arc::downgrade(state);
        let inner = inner.clone();
        let mut shutdown_rx = shutdown_rx;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                let state = match state.upgrade() {
                    Some(state) => state,
                    None => break,
                };
                let pending = state.stale_jobs(delay);
                for job in pending {
                    let state = state.clone();
                    let inner = inner.clone();
                    let refill: Job = Box::pin(async move {
                        match inner.exec(&job.sql, &job.params, job.format).await {
                            Ok(rows) => state.complete_refill(&job.sql, &job.key, rows),
                            Err(e) => {
                                tracing::warn!(sql = %job.sql, error = %e, "cache refill failed");
                            }
                        }
                    });
                    if jobs.try_send(refill).is_err() {
                        // Worker queue is full; the rest waits for the
                        // next tick.
                        tracing::debug!("refill queue full, deferring remaining stale entries");
                        break;
                    }
                }
            }
        });
    }
}

fn spawn_periodic<F>(
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    state: Weak<CacheState>,
    jobs: mpsc::Sender<Job>,
    make_job: F,
) where
    F: Fn(Arc<CacheState>) -> Job + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => break,
            }
            let state = match state.upgrade() {
                Some(state) => state,
                None => break,
            };
            if jobs.try_send(make_job(state)).is_err() {
                tracing::debug!("maintenance queue full, skipping tick");
            }
        }
    });
}
