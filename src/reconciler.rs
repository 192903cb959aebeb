//! Reconciler loop.
//!
//! Periodically diffs the registry's desired sources against the
//! supervisor's process table and issues stop/start commands. This is the
//! only caller of `Supervisor::ensure_started` and `Supervisor::stop` apart
//! from shutdown.
//!
//! # Graceful Shutdown
//!
//! The loop exits when the cancellation token is triggered, including in the
//! middle of a tick (for example while waiting out a stagger delay).

use crate::config::ReconcilerConfig;
use crate::error::SupervisorError;
use crate::registry::{RegistryClient, SourceRegistry};
use crate::state::ProcessState;
use crate::supervisor::{StartOutcome, Supervisor};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Result of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub stopped: usize,
    pub started: usize,
    pub failed: usize,
    /// The registry has never answered, so nothing was changed.
    pub skipped: bool,
}

/// Run the reconciler until `cancel_token` fires. The first tick runs
/// immediately.
#[instrument(skip_all, name = "reconciler")]
pub async fn run_reconciler<R: SourceRegistry>(
    mut registry: RegistryClient<R>,
    supervisor: Arc<Supervisor>,
    config: ReconcilerConfig,
    cancel_token: CancellationToken,
) {
    info!(
        interval_ms = config.interval_ms,
        stagger_ms = config.stagger_ms,
        "Starting reconciler"
    );

    let mut interval = tokio::time::interval(config.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel_token.cancelled() => break,
        }

        tokio::select! {
            report = reconcile_once(&mut registry, &supervisor, config.stagger()) => {
                if report.skipped {
                    continue;
                }
                log_process_table(&supervisor);
                if report.stopped + report.started + report.failed > 0 {
                    info!(
                        stopped = report.stopped,
                        started = report.started,
                        failed = report.failed,
                        live = supervisor.live_ids().len(),
                        "Reconciliation pass finished"
                    );
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }

    info!("Reconciler stopped");
}

fn log_process_table(supervisor: &Supervisor) {
    let now = Instant::now();
    for p in supervisor.snapshot() {
        let retry_in_ms = p
            .next_retry_at
            .map(|at| at.saturating_duration_since(now).as_millis());
        if p.state == ProcessState::Degraded {
            warn!(source = %p.id, crash_count = p.crash_count, "Source is degraded");
        } else {
            debug!(
                source = %p.id,
                state = ?p.state,
                pid = ?p.pid,
                crash_count = p.crash_count,
                retry_in_ms = ?retry_in_ms,
                "Process table entry"
            );
        }
    }
}

/// One reconciliation tick.
///
/// Stops run before starts: first every tracked source that left the
/// registry, then every tracked source whose connection URI changed. New
/// starts are separated by `stagger`; sources that are already tracked are
/// skipped without delay.
pub async fn reconcile_once<R: SourceRegistry>(
    registry: &mut RegistryClient<R>,
    supervisor: &Arc<Supervisor>,
    stagger: Duration,
) -> TickReport {
    let mut report = TickReport::default();

    let Some(desired) = registry.list_desired_sources().await else {
        warn!("No registry snapshot available yet, skipping reconciliation");
        report.skipped = true;
        return report;
    };

    let desired_ids: HashSet<_> = desired.iter().map(|s| s.id).collect();
    for id in supervisor.live_ids() {
        if !desired_ids.contains(&id) {
            info!("Source [{}] removed from registry, stopping", id);
            supervisor.stop(id).await;
            report.stopped += 1;
        }
    }

    for source in &desired {
        let Some(tracked) = supervisor.tracked_uri(source.id) else {
            continue;
        };
        match source.resolve_uri() {
            Ok(uri) if uri == tracked => {}
            _ => {
                info!("Source [{}] connection changed, restarting", source.id);
                supervisor.stop(source.id).await;
                report.stopped += 1;
            }
        }
    }

    let mut spawned_this_tick = false;
    for source in &desired {
        if !supervisor.needs_start(source.id) {
            continue;
        }
        if spawned_this_tick && source.resolve_uri().is_ok() {
            tokio::time::sleep(stagger).await;
        }

        match supervisor.ensure_started(source).await {
            Ok(StartOutcome::Spawned) => {
                spawned_this_tick = true;
                report.started += 1;
            }
            Ok(StartOutcome::AlreadyTracked) => {}
            Err(SupervisorError::Configuration(e)) => {
                error!("Skipping source [{}]: {}", source.id, e);
                report.failed += 1;
            }
            Err(e) => {
                error!("Failed to start source [{}]: {}", source.id, e);
                report.failed += 1;
            }
        }
    }

    report
}
