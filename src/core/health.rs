//! # Health check: reap what every other completion path missed.
//!
//! Runs every `health_check_interval` (or on demand through
//! [`TaskManager::run_health_check`]). One pass:
//!
//! ```text
//! run_health_check()                 (health_lock.try_lock, skipped if busy)
//!   ├─► finished monitor handles     → removed
//!   ├─► tasks older than 2× timeout  → Orphaned, removed
//!   ├─► streams without a monitor    → writer fails with Orphaned, removed
//!   └─► occupancy > 80% of a limit   → ResourcePressure warning
//! ```
//!
//! Every entry is handled on its own; one failing entry never stops the sweep.

use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::events::{Event, EventKind};

use super::manager::TaskManager;

/// Occupancy ratio above which resource pressure is reported.
pub const RESOURCE_WARNING_RATIO: f64 = 0.8;

/// Summary of one health check pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// Monitor handles whose task had already finished.
    pub completed_monitors: usize,
    /// Tasks failed with [`RelayError::Orphaned`].
    pub orphaned_tasks: usize,
    /// Streams removed for lacking a timeout monitor.
    pub orphaned_streams: usize,
    /// True if the pass did not run because another one was in progress.
    pub skipped: bool,
}

impl HealthReport {
    fn cleaned(&self) -> usize {
        self.completed_monitors + self.orphaned_tasks + self.orphaned_streams
    }
}

impl TaskManager {
    /// Runs one health check pass.
    pub fn run_health_check(&self) -> HealthReport {
        let Ok(_pass) = self.health_lock.try_lock() else {
            debug!("health check already running; tick skipped");
            return HealthReport {
                skipped: true,
                ..HealthReport::default()
            };
        };
        if self.is_disposed() {
            return HealthReport::default();
        }

        let report = HealthReport {
            completed_monitors: self.reap_finished_monitors(),
            orphaned_tasks: self.reap_orphaned_tasks(),
            orphaned_streams: self.reap_orphaned_streams(),
            skipped: false,
        };
        self.log_resource_usage();

        if report.cleaned() > 0 {
            info!(
                completed_monitors = report.completed_monitors,
                orphaned_tasks = report.orphaned_tasks,
                orphaned_streams = report.orphaned_streams,
                "health check cleaned up resources"
            );
        }
        self.bus.publish(
            Event::new(EventKind::HealthCheckCompleted).with_reason(format!(
                "monitors={} tasks={} streams={}",
                report.completed_monitors, report.orphaned_tasks, report.orphaned_streams
            )),
        );
        report
    }

    fn reap_finished_monitors(&self) -> usize {
        let finished: Vec<String> = self
            .monitors
            .iter()
            .filter(|m| m.join.is_finished())
            .map(|m| m.key().clone())
            .collect();

        finished
            .iter()
            .filter(|id| {
                self.monitors
                    .remove_if(id.as_str(), |_, m| m.join.is_finished())
                    .is_some()
            })
            .count()
    }

    fn reap_orphaned_tasks(&self) -> usize {
        let threshold = self.cfg.orphan_timeout();
        let stale: Vec<(String, u64)> = self
            .tasks
            .iter()
            .filter(|t| t.created_at.elapsed() > threshold)
            .map(|t| (t.key().clone(), t.generation))
            .collect();

        let mut reaped = 0;
        for (request_id, generation) in stale {
            let Some((_, task)) = self
                .tasks
                .remove_if(&request_id, |_, t| t.generation == generation)
            else {
                continue;
            };
            let age = task.created_at.elapsed();
            warn!(
                request_id = %request_id,
                instance_id = %task.instance_id,
                age_secs = age.as_secs_f64(),
                "reaping orphaned task"
            );
            task.slot.resolve(Err(RelayError::Orphaned {
                request_id: request_id.clone(),
                age,
            }));
            self.bus.publish(
                Event::new(EventKind::TaskOrphaned)
                    .with_request(request_id)
                    .with_instance(task.instance_id)
                    .with_elapsed(age),
            );
            reaped += 1;
        }
        reaped
    }

    fn reap_orphaned_streams(&self) -> usize {
        let candidates: Vec<(String, u64)> = self
            .streams
            .iter()
            .map(|s| (s.key().clone(), s.generation))
            .collect();

        let mut reaped = 0;
        for (request_id, generation) in candidates {
            let Some((_, stream)) = self.streams.remove_if(&request_id, |id, s| {
                s.generation == generation && !self.has_monitor(id, generation)
            }) else {
                continue;
            };
            let age = stream.created_at.elapsed();
            warn!(
                request_id = %request_id,
                instance_id = %stream.instance_id,
                connection_id = %stream.connection_id,
                "reaping stream without timeout monitor"
            );
            stream.close(Err(RelayError::Orphaned {
                request_id: request_id.clone(),
                age,
            }));
            self.bus.publish(
                Event::new(EventKind::StreamOrphaned)
                    .with_request(request_id)
                    .with_instance(stream.instance_id.as_str())
                    .with_elapsed(age),
            );
            reaped += 1;
        }
        reaped
    }

    fn has_monitor(&self, request_id: &str, generation: u64) -> bool {
        self.monitors
            .get(request_id)
            .is_some_and(|m| m.generation == generation && !m.join.is_finished())
    }

    fn log_resource_usage(&self) {
        let usage = [
            ("tasks", self.tasks.len(), self.cfg.max_pending_tasks),
            ("streams", self.streams.len(), self.cfg.max_pending_streams),
            ("monitors", self.monitors.len(), self.cfg.max_timeout_monitors),
        ];

        let pressured: Vec<String> = usage
            .iter()
            .filter(|(_, used, max)| over_threshold(*used, *max))
            .map(|(name, used, max)| format!("{name} {used}/{max}"))
            .collect();

        debug!(
            tasks = usage[0].1,
            streams = usage[1].1,
            monitors = usage[2].1,
            queued_tasks = self.queued_tasks(),
            queued_streams = self.queued_streams(),
            "resource usage"
        );
        if pressured.is_empty() {
            return;
        }

        let summary = pressured.join(", ");
        warn!(usage = %summary, "high resource usage");
        self.bus
            .publish(Event::new(EventKind::ResourcePressure).with_reason(summary));
    }
}

fn over_threshold(used: usize, max: usize) -> bool {
    max > 0 && used as f64 > max as f64 * RESOURCE_WARNING_RATIO
}
