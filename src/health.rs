// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Health Monitor
//!
//! Periodically sweeps consumers with `auto_reconnect` enabled. The check is
//! the transport-level open flag of the dedicated channel and never touches
//! the broker. A dead channel is recorded as a disconnection and handed to
//! the [`RetryCoordinator`] with a rebuild action.

use crate::{
    manager::{ConsumerManager, ConsumerStatus},
    retry::{RetryAction, RetryCoordinator, ScheduleOutcome},
    stats::StatsCollector,
};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

/// Periodic liveness sweep over the consumers registered with the manager.
pub struct HealthMonitor {
    manager: Arc<ConsumerManager>,
    retry: Arc<RetryCoordinator>,
    stats: Arc<StatsCollector>,
    default_interval: Duration,
    last_checked: Mutex<HashMap<String, Instant>>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Creates a stopped monitor.
    ///
    /// # Parameters
    /// * `manager` - Registry whose consumers are checked and rebuilt
    /// * `retry` - Coordinator the rebuilds are scheduled through
    /// * `stats` - Receives a disconnection for every dead channel found
    /// * `default_interval` - Check interval for consumers without their own
    ///
    /// # Returns
    /// An Arc-wrapped monitor; call [`HealthMonitor::start`] to begin sweeping
    pub fn new(
        manager: Arc<ConsumerManager>,
        retry: Arc<RetryCoordinator>,
        stats: Arc<StatsCollector>,
        default_interval: Duration,
    ) -> Arc<HealthMonitor> {
        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(HealthMonitor {
            manager,
            retry,
            stats,
            default_interval,
            last_checked: Mutex::new(HashMap::default()),
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    /// Starts the periodic sweep. The sweep ticks at the smallest consumer
    /// interval and checks each consumer when its own interval elapsed.
    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                let tick = match monitor.upgrade() {
                    Some(monitor) => monitor.tick_interval(),
                    None => break,
                };

                tokio::select! {
                    _ = tokio::time::sleep(tick) => {
                        let Some(monitor) = monitor.upgrade() else { break };
                        monitor.check_due();
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        info!("consumer health monitor started");
    }

    /// Stops the sweep. Rebuilds already scheduled keep running.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.last_checked.lock().clear();
    }

    /// Checks every consumer now, regardless of its interval.
    ///
    /// # Returns
    /// The scheduling outcome for each consumer a recovery was requested for
    pub fn check_all(&self) -> HashMap<String, ScheduleOutcome> {
        self.manager
            .names()
            .into_iter()
            .filter_map(|name| self.check(&name).map(|outcome| (name, outcome)))
            .collect()
    }

    fn check_due(&self) {
        let now = Instant::now();

        for name in self.manager.names() {
            let Some(def) = self.manager.definition(&name) else {
                continue;
            };

            let due = {
                let mut last_checked = self.last_checked.lock();
                let due = last_checked
                    .get(&name)
                    .map(|at| now.duration_since(*at) >= def.health_check_interval())
                    .unwrap_or(true);
                if due {
                    last_checked.insert(name.clone(), now);
                }
                due
            };

            if due {
                self.check(&name);
            }
        }
    }

    fn tick_interval(&self) -> Duration {
        self.manager
            .names()
            .iter()
            .filter_map(|name| self.manager.definition(name))
            .filter(|def| def.auto_reconnect)
            .map(|def| def.health_check_interval())
            .min()
            .unwrap_or(self.default_interval)
            .max(Duration::from_millis(1))
    }

    fn check(&self, name: &str) -> Option<ScheduleOutcome> {
        let def = self.manager.definition(name)?;
        if !def.auto_reconnect {
            return None;
        }

        match self.manager.status(name)? {
            ConsumerStatus::Inactive => None,
            ConsumerStatus::Active => {
                if self.manager.channel_alive(name) {
                    return None;
                }

                if !self.manager.mark_recovering(name) {
                    return None;
                }
                self.stats.record_disconnection(name);
                warn!(consumer = name, "consumer channel is down, scheduling rebuild");
                Some(self.schedule_rebuild(name))
            }
            ConsumerStatus::Recovering => {
                if self.retry.is_in_progress(name) || self.retry.is_stopped(name) {
                    return None;
                }

                debug!(consumer = name, "consumer still recovering, rescheduling rebuild");
                Some(self.schedule_rebuild(name))
            }
        }
    }

    fn schedule_rebuild(&self, name: &str) -> ScheduleOutcome {
        self.retry.schedule_retry(name, self.rebuild_action(name))
    }

    fn rebuild_action(&self, name: &str) -> RetryAction {
        let manager = self.manager.clone();
        let stats = self.stats.clone();
        let name = name.to_owned();

        Arc::new(move || {
            let manager = manager.clone();
            let stats = stats.clone();
            let name = name.clone();

            async move {
                manager.rebuild(&name).await?;
                if manager.is_active(&name) {
                    stats.record_reconnection(&name);
                    info!(consumer = %name, "consumer channel rebuilt");
                }
                Ok(())
            }
            .boxed()
        })
    }
}
