//! Periodic sweeps

use std::{future::Future, time::Duration};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

use super::Services;
use crate::{config::SchedulerConfig, error::AppResult};

/// Start the overdue and reservation-expiry sweepers.
///
/// Both loops exit once `shutdown` turns `true` or its sender is dropped.
pub fn spawn_sweepers(
    services: Services,
    config: &SchedulerConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    if !config.enabled {
        tracing::info!("Background sweeps disabled");
        return Vec::new();
    }

    let overdue = services.overdue.clone();
    let reservations = services.reservations;

    vec![
        spawn_sweep(
            "overdue",
            Duration::from_secs(config.overdue_interval_secs),
            shutdown.clone(),
            move || {
                let overdue = overdue.clone();
                async move { overdue.refresh_all().await }
            },
        ),
        spawn_sweep(
            "reservation_expiry",
            Duration::from_secs(config.expiry_interval_secs),
            shutdown,
            move || {
                let reservations = reservations.clone();
                async move { reservations.expire_stale().await }
            },
        ),
    ]
}

fn spawn_sweep<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    run: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = AppResult<usize>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = time::interval(period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(sweep = name, period_secs = period.as_secs(), "Sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = Instant::now();
                    match run().await {
                        Ok(count) => tracing::info!(
                            sweep = name,
                            count,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Sweep finished"
                        ),
                        Err(e) => tracing::error!(sweep = name, error = %e, "Sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(sweep = name, "Sweeper stopped");
    })
}
