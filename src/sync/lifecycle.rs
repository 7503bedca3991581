// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background loop: incremental sync of every registered session on a timer.

use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{EngineState, SyncEngine};
use crate::tenant::TenantContext;

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl SyncEngine {
    /// Run the periodic sync loop until `shutdown` flips to `true` or its
    /// sender is dropped.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            let _ = self.state.send(EngineState::Stopped);
            return;
        }

        let _ = self.state.send(EngineState::Running);
        let mut period = self.settings.read().interval;
        info!(interval_secs = period.as_secs(), peer = self.has_peer(), "Sync loop running");

        let mut settings_rx = self.settings_rx.lock().await;
        let mut timer = ticker(period);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                Ok(()) = settings_rx.changed() => {
                    let updated = settings_rx.borrow_and_update().clone();
                    info!(
                        batch_size = updated.batch_size,
                        interval_secs = updated.interval.as_secs(),
                        "Sync settings updated"
                    );
                    if updated.interval != period {
                        period = updated.interval;
                        timer = ticker(period);
                    }
                    *self.settings.write() = updated;
                }

                _ = timer.tick() => {
                    self.tick().await;
                }
            }
        }

        let stopping = Instant::now();
        let _ = self.state.send(EngineState::ShuttingDown);
        info!(sessions = self.sessions.len(), "Sync loop stopping");
        let _ = self.state.send(EngineState::Stopped);
        crate::metrics::record_startup_phase("sync_shutdown", stopping.elapsed());
    }

    /// One background round over the registered sessions.
    async fn tick(&self) {
        let sessions: Vec<TenantContext> = self.sessions.iter().map(|s| s.value().clone()).collect();
        if sessions.is_empty() {
            debug!("No sync sessions registered");
            return;
        }

        let _ = self.state.send(EngineState::Syncing);
        for ctx in &sessions {
            match self.incremental_sync(ctx).await {
                Ok(report) if report.is_clean() => {
                    debug!(clinic_id = ctx.clinic_id(), pulled = report.totals.pulled, pushed = report.totals.pushed, "Background sync clean");
                }
                Ok(report) => {
                    warn!(
                        clinic_id = ctx.clinic_id(),
                        errors = report.totals.errors,
                        unavailable = report.totals.unavailable,
                        "Background sync incomplete"
                    );
                }
                Err(e) => {
                    warn!(clinic_id = ctx.clinic_id(), error = %e, "Background sync failed");
                    crate::metrics::record_error("sync", "background", e.kind());
                }
            }
        }
        let _ = self.state.send(EngineState::Running);
    }
}
