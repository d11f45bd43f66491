//! Supervisor: wires collectors, queue, and workers for a set of
//! subscriptions and manages their shared lifecycle.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use campusidm_core::TargetSystem;

use crate::changelog::ChangeLog;
use crate::collector::{BackfillCollector, LiveCollector};
use crate::config::SubscriptionConfig;
use crate::handler::HandlerRegistry;
use crate::notify::NotificationSource;
use crate::queue::EventQueue;
use crate::runstate::RunState;
use crate::worker::{WorkerPool, WorkerStats};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no subscriptions to run")]
    NoSubscriptions,

    #[error("subscription '{target}' names unknown handler '{handler}'")]
    UnknownHandler { target: String, handler: String },

    #[error("invalid target system name: {0}")]
    InvalidTarget(String),

    #[error("failed to install signal handler: {0}")]
    Signal(std::io::Error),
}

/// Deployment-level switches applied across all subscriptions.
#[derive(Debug, Clone, Default)]
pub struct SupervisorOptions {
    /// Event queue bound; `None` for unbounded.
    pub queue_capacity: Option<usize>,

    /// Force-disable all live collectors (sweep-only operation).
    pub disable_listener: bool,

    /// Force-disable all backfill collectors (notification-only operation).
    pub disable_collector: bool,
}

/// Owns the run state and the task handles for one daemon run.
///
/// Each subscription gets its own queue and worker pool; a queue is shared
/// only between that subscription's collectors and workers, so one slow
/// target system never starves another's delivery.
#[derive(Debug)]
pub struct Supervisor {
    run_state: RunState,
    collector_tasks: Vec<JoinHandle<()>>,
    pools: Vec<WorkerPool>,
    stats: Vec<(String, Arc<WorkerStats>)>,
}

impl Supervisor {
    pub fn start(
        subscriptions: &[SubscriptionConfig],
        options: &SupervisorOptions,
        registry: &HandlerRegistry,
        changelog: Arc<dyn ChangeLog>,
        source: Arc<dyn NotificationSource>,
    ) -> Result<Self, SupervisorError> {
        if subscriptions.is_empty() {
            return Err(SupervisorError::NoSubscriptions);
        }

        let run_state = RunState::new();
        let mut collector_tasks = Vec::new();
        let mut pools = Vec::new();
        let mut stats = Vec::new();

        for subscription in subscriptions {
            let target = TargetSystem::new(&subscription.target_system)
                .map_err(|e| SupervisorError::InvalidTarget(e.to_string()))?;
            let handler =
                registry
                    .resolve(subscription)
                    .ok_or_else(|| SupervisorError::UnknownHandler {
                        target: subscription.target_system.clone(),
                        handler: subscription.handler.clone(),
                    })?;

            let queue = EventQueue::with_capacity(options.queue_capacity);

            if subscription.enable_listener && !options.disable_listener {
                let collector = LiveCollector::new(
                    target.clone(),
                    Arc::clone(&source),
                    Arc::clone(&changelog),
                    queue.clone(),
                    run_state.clone(),
                    subscription.listener_config(),
                );
                collector_tasks.push(tokio::spawn(collector.run()));
            }

            if subscription.enable_collector && !options.disable_collector {
                let collector = BackfillCollector::new(
                    target.clone(),
                    Arc::clone(&changelog),
                    queue.clone(),
                    run_state.clone(),
                    subscription.backfill_config(),
                );
                collector_tasks.push(tokio::spawn(collector.run()));
            }

            let pool = WorkerPool::spawn(
                subscription.concurrency.max(1),
                queue,
                Arc::clone(&changelog),
                handler,
                run_state.clone(),
                subscription.poll_timeout(),
            );
            stats.push((subscription.target_system.clone(), pool.stats()));
            pools.push(pool);

            info!(
                target_system = %target,
                concurrency = subscription.concurrency.max(1),
                listener = subscription.enable_listener && !options.disable_listener,
                collector = subscription.enable_collector && !options.disable_collector,
                "subscription started",
            );
        }

        Ok(Self {
            run_state,
            collector_tasks,
            pools,
            stats,
        })
    }

    pub fn run_state(&self) -> RunState {
        self.run_state.clone()
    }

    /// Per-target worker outcome counters.
    pub fn worker_stats(&self) -> &[(String, Arc<WorkerStats>)] {
        &self.stats
    }

    /// Block until a termination signal arrives, then stop and drain.
    /// SIGHUP is the conventional operator stop; SIGTERM and SIGINT behave
    /// the same way.
    pub async fn wait_for_shutdown(self) -> Result<(), SupervisorError> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sighup = signal(SignalKind::hangup()).map_err(SupervisorError::Signal)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(SupervisorError::Signal)?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(SupervisorError::Signal)?;

        tokio::select! {
            _ = sighup.recv() => info!(signal = "SIGHUP", "termination signal received"),
            _ = sigterm.recv() => info!(signal = "SIGTERM", "termination signal received"),
            _ = sigint.recv() => info!(signal = "SIGINT", "termination signal received"),
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop every loop and wait for it to exit. Collectors and workers check
    /// the run state at their poll granularity, so this returns within one
    /// poll timeout plus any in-flight delivery.
    pub async fn shutdown(self) {
        self.run_state.stop();

        for task in self.collector_tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "collector task panicked");
            }
        }
        for pool in self.pools {
            pool.join().await;
        }

        info!("supervisor shut down");
    }
}
