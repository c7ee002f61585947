// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pool Manager and Scaler
//!
//! The pool manager owns the connection groups and channel workers. It eagerly
//! creates the minimum channel count at startup, then on every monitoring
//! interval runs a health check (replacing faulted workers) and a scaling
//! decision (one channel up or down per interval, driven by queue backlog from
//! the broker management API). All counters are mutated only by the manager.

use crate::{
    config::PoolConfig,
    connection::ConnectionGroup,
    context::Codec,
    errors::AmqpError,
    management::ManagementApi,
    registry::{ConsumerBinding, DispatchRegistry},
    worker::{self, WorkerHandle},
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{interval, sleep, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

/// Outcome of one scaling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    Up,
    Down,
    Hold,
}

/// Decides whether the pool should add, retire, or keep its channel count.
///
/// Scale up when the total backlog exceeds the threshold multiplied by the
/// current channel count and the maximum is not reached. Scale down when the
/// backlog is at or below the low-water mark and the minimum is not reached.
/// Adjustments are one channel per interval to avoid thrashing.
pub(crate) fn scale_decision(backlog: u64, channels: usize, cfg: &PoolConfig) -> ScaleAction {
    if let Some(threshold) = cfg.scaling_threshold {
        if backlog > threshold as u64 * channels as u64 && channels < cfg.max_channels as usize {
            return ScaleAction::Up;
        }
    }

    if backlog <= cfg.scale_down_backlog && channels > cfg.min_channels as usize {
        return ScaleAction::Down;
    }

    ScaleAction::Hold
}

/// Picks the worker to retire at scale-down.
///
/// Candidates are workers whose whole queue set stays covered by another
/// worker, so no queue loses its last consumer. The tie-break favors the most
/// recently idle worker (greatest last-activity timestamp).
pub(crate) fn pick_retire(workers: &[(Vec<String>, u64)]) -> Option<usize> {
    let mut best: Option<usize> = None;

    for (i, (queues, activity)) in workers.iter().enumerate() {
        let covered = queues.iter().all(|queue| {
            workers
                .iter()
                .enumerate()
                .any(|(j, (other, _))| j != i && other.contains(queue))
        });
        if !covered {
            continue;
        }

        match best {
            None => best = Some(i),
            Some(b) if *activity > workers[b].1 => best = Some(i),
            _ => {}
        }
    }

    best
}

/// Owns the connection groups and channel workers and supervises them.
pub struct PoolManager {
    cfg: PoolConfig,
    registry: Arc<DispatchRegistry>,
    management: Arc<dyn ManagementApi>,
    codec: Arc<dyn Codec>,
    groups: Mutex<Vec<Arc<ConnectionGroup>>>,
    workers: Mutex<Vec<WorkerHandle>>,
    /// Binding sets of torn-down workers whose replacement has not yet
    /// succeeded, retried on every monitoring tick.
    pending: Mutex<Vec<Vec<Arc<ConsumerBinding>>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl PoolManager {
    /// Creates a pool manager without opening any connection.
    ///
    /// The configuration is validated here, so invalid bounds fail before any
    /// broker connection is attempted.
    pub fn new(
        cfg: PoolConfig,
        registry: Arc<DispatchRegistry>,
        management: Arc<dyn ManagementApi>,
        codec: Arc<dyn Codec>,
    ) -> Result<Arc<PoolManager>, AmqpError> {
        cfg.validate()?;

        Ok(Arc::new(PoolManager {
            cfg,
            registry,
            management,
            codec,
            groups: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            monitor: Mutex::new(None),
        }))
    }

    /// Starts the pool.
    ///
    /// Eagerly spawns the minimum channel count, with the registry bindings
    /// grouped so each worker subscribes to a coherent queue subset, then
    /// starts the monitoring loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), AmqpError> {
        let assignments = self.registry.partition(self.cfg.min_channels as usize);
        for bindings in assignments {
            self.spawn_worker(bindings).await?;
        }

        info!(
            channels = self.total_channels().await,
            "channel pool started"
        );

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(manager.cfg.monitoring_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                manager.health_check().await;
                manager.scale().await;
            }
        });
        *self.monitor.lock().await = Some(handle);

        Ok(())
    }

    /// Number of open channel workers.
    pub async fn total_channels(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Finds a connection group with a free channel slot, opening a new
    /// connection when all groups are at capacity.
    async fn acquire_group(&self) -> Result<Arc<ConnectionGroup>, AmqpError> {
        let mut groups = self.groups.lock().await;

        if let Some(group) = groups
            .iter()
            .find(|group| group.is_connected() && group.has_capacity())
        {
            return Ok(group.clone());
        }

        let group = Arc::new(ConnectionGroup::open(&self.cfg).await?);
        info!(group = group.id().to_string(), "opened connection group");
        groups.push(group.clone());
        Ok(group)
    }

    async fn spawn_worker(&self, bindings: Vec<Arc<ConsumerBinding>>) -> Result<(), AmqpError> {
        let group = self.acquire_group().await?;
        let handle = worker::spawn(
            group,
            bindings,
            self.registry.clone(),
            &self.cfg,
            self.codec.clone(),
        )
        .await?;

        debug!(
            worker = handle.id().to_string(),
            connection = handle.connection_id().to_string(),
            "channel worker opened"
        );

        self.workers.lock().await.push(handle);
        Ok(())
    }

    /// Tears down faulted workers and replaces each with a fresh worker
    /// subscribed to the same binding set.
    ///
    /// A binding set whose replacement cannot be spawned (broker still
    /// unreachable) stays queued and is retried on every later tick, so a
    /// queue group is never abandoned and the channel count recovers to the
    /// configured minimum once the broker is back.
    pub(crate) async fn health_check(&self) {
        {
            let mut groups = self.groups.lock().await;
            groups.retain(|group| {
                if group.is_connected() {
                    true
                } else {
                    warn!(
                        group = group.id().to_string(),
                        "connection lost, dropping connection group"
                    );
                    false
                }
            });
        }

        let mut replace = Vec::new();
        {
            let mut workers = self.workers.lock().await;
            let mut i = 0;
            while i < workers.len() {
                if workers[i].is_faulted() {
                    let handle = workers.remove(i);
                    warn!(
                        worker = handle.id().to_string(),
                        "worker faulted, replacing"
                    );
                    handle.abort();
                    replace.push(handle.bindings().to_vec());
                } else {
                    i += 1;
                }
            }
        }

        if !replace.is_empty() {
            self.pending.lock().await.extend(replace);
        }

        self.respawn_pending().await;
    }

    /// Retries every binding set still waiting for a replacement worker.
    ///
    /// Sets that cannot be spawned go back on the pending list for the next
    /// monitoring tick; the manager keeps retrying indefinitely in the
    /// background.
    pub(crate) async fn respawn_pending(&self) {
        let pending = std::mem::take(&mut *self.pending.lock().await);

        for bindings in pending {
            if let Err(err) = self.spawn_worker(bindings.clone()).await {
                error!(
                    error = err.to_string(),
                    "failure to replace faulted worker, keeping it pending"
                );
                self.pending.lock().await.push(bindings);
            }
        }
    }

    /// Queries the backlog depth of every bound queue.
    ///
    /// Queues the management API cannot answer for are skipped with a warning
    /// so one flaky queue never stalls the scaler.
    pub(crate) async fn queue_backlogs(&self) -> Vec<(String, u64)> {
        let mut depths = Vec::new();
        for queue in self.registry.queues() {
            match self.management.queue_depth(&queue).await {
                Ok(depth) => depths.push((queue, depth)),
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        queue, "failure to query queue depth"
                    );
                }
            }
        }
        depths
    }

    /// Runs one scaling decision, adjusting by at most one channel.
    pub(crate) async fn scale(&self) {
        let depths = self.queue_backlogs().await;
        if depths.is_empty() {
            return;
        }

        let backlog: u64 = depths.iter().map(|(_, depth)| depth).sum();
        let channels = self.total_channels().await;

        match scale_decision(backlog, channels, &self.cfg) {
            ScaleAction::Up => {
                // New worker takes the queue group with the deepest backlog.
                let queue = depths
                    .iter()
                    .max_by_key(|(_, depth)| *depth)
                    .map(|(queue, _)| queue.clone());

                if let Some(queue) = queue {
                    info!(backlog, channels, queue, "scaling up one channel");
                    let bindings = self.registry.queue_bindings(&queue);
                    if let Err(err) = self.spawn_worker(bindings).await {
                        error!(error = err.to_string(), "failure to scale up");
                    }
                }
            }
            ScaleAction::Down => {
                self.retire_one(backlog, channels).await;
            }
            ScaleAction::Hold => {}
        }
    }

    async fn retire_one(&self, backlog: u64, channels: usize) {
        let mut workers = self.workers.lock().await;

        let entries: Vec<(Vec<String>, u64)> = workers
            .iter()
            .map(|handle| (handle.queues(), handle.last_activity_ms()))
            .collect();

        if let Some(idx) = pick_retire(&entries) {
            let handle = workers.remove(idx);
            info!(
                backlog,
                channels,
                worker = handle.id().to_string(),
                "scaling down one channel"
            );
            handle.drain();

            let timeout = self.cfg.shutdown_timeout;
            tokio::spawn(async move {
                let deadline = Instant::now() + timeout;
                while !handle.is_finished() && Instant::now() < deadline {
                    sleep(Duration::from_millis(100)).await;
                }
                if !handle.is_finished() {
                    warn!(
                        worker = handle.id().to_string(),
                        "drain timeout exceeded, force closing worker"
                    );
                    handle.abort();
                }
            });
        }
    }

    /// Shuts the pool down.
    ///
    /// All workers drain concurrently; workers still open after the shutdown
    /// timeout are force-closed. Their unacked deliveries are redelivered by
    /// the broker on the next connection.
    pub async fn shutdown(&self) {
        info!("channel pool shutting down...");

        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.abort();
        }

        let workers = {
            let mut guard = self.workers.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in &workers {
            handle.drain();
        }

        let deadline = Instant::now() + self.cfg.shutdown_timeout;
        loop {
            if workers.iter().all(|handle| handle.is_finished()) {
                break;
            }
            if Instant::now() >= deadline {
                warn!("shutdown timeout exceeded, force closing workers");
                for handle in &workers {
                    if !handle.is_finished() {
                        handle.abort();
                    }
                }
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }

        self.groups.lock().await.clear();
        info!("channel pool shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::BrokerConfig,
        context::{BusContext, JsonCodec},
        handler::{HandlerDescriptor, RouteDescriptor},
        management::MockManagementApi,
    };
    use serde::Deserialize;

    fn cfg(min: u16, max: u16, threshold: u32) -> PoolConfig {
        PoolConfig::default()
            .channels(min, max)
            .scaling_threshold(threshold)
    }

    #[test]
    fn scales_up_when_backlog_exceeds_threshold_per_channel() {
        // Two queues with backlog 300 each and 2 active channels: 600 > 100 * 2.
        let cfg = cfg(2, 5, 100);
        assert_eq!(scale_decision(600, 2, &cfg), ScaleAction::Up);
    }

    #[test]
    fn holds_at_max_channels() {
        let cfg = cfg(2, 5, 100);
        assert_eq!(scale_decision(600, 5, &cfg), ScaleAction::Hold);
    }

    #[test]
    fn holds_when_backlog_is_below_threshold() {
        let cfg = cfg(2, 5, 100);
        assert_eq!(scale_decision(150, 2, &cfg), ScaleAction::Hold);
    }

    #[test]
    fn scales_down_without_backlog() {
        let cfg = cfg(2, 5, 100);
        assert_eq!(scale_decision(0, 3, &cfg), ScaleAction::Down);
    }

    #[test]
    fn holds_at_min_channels_without_backlog() {
        let cfg = cfg(2, 5, 100);
        assert_eq!(scale_decision(0, 2, &cfg), ScaleAction::Hold);
    }

    #[test]
    fn never_scales_without_threshold() {
        let cfg = PoolConfig::default().channels(2, 5);
        assert_eq!(scale_decision(10_000, 2, &cfg), ScaleAction::Hold);
    }

    #[test]
    fn retire_favors_most_recently_idle() {
        let workers = vec![
            (vec!["orders".to_owned()], 100),
            (vec!["orders".to_owned()], 300),
            (vec!["orders".to_owned()], 200),
        ];
        assert_eq!(pick_retire(&workers), Some(1));
    }

    #[test]
    fn retire_keeps_sole_consumer_of_a_queue() {
        let workers = vec![
            (vec!["orders".to_owned()], 100),
            (vec!["audits".to_owned()], 900),
            (vec!["orders".to_owned()], 200),
        ];
        // The audits worker is the most recently idle but also the only
        // consumer of its queue, so an orders worker goes instead.
        assert_eq!(pick_retire(&workers), Some(2));
    }

    #[test]
    fn retire_returns_none_when_every_worker_is_a_sole_consumer() {
        let workers = vec![
            (vec!["orders".to_owned()], 100),
            (vec!["audits".to_owned()], 900),
        ];
        assert_eq!(pick_retire(&workers), None);
    }

    #[derive(Deserialize)]
    struct TestMessage {
        #[allow(dead_code)]
        text: String,
    }

    fn registry() -> Arc<DispatchRegistry> {
        Arc::new(
            DispatchRegistry::build(vec![HandlerDescriptor::new().exchange("ex").route(
                RouteDescriptor::new("orders", "order.created", |_ctx: BusContext<TestMessage>| {
                    async move { Ok(()) }
                }),
            )])
            .unwrap(),
        )
    }

    #[test]
    fn new_rejects_invalid_configuration_before_connecting() {
        let result = PoolManager::new(
            PoolConfig::default().channels(0, 5),
            registry(),
            Arc::new(MockManagementApi::new()),
            Arc::new(JsonCodec),
        );

        assert!(matches!(result, Err(AmqpError::ConfigurationError(_))));
    }

    /// Manager whose broker endpoint refuses connections immediately.
    fn unreachable_manager() -> Arc<PoolManager> {
        let broker = BrokerConfig {
            port: 59999,
            ..BrokerConfig::default()
        };
        let cfg = PoolConfig::new(broker).connect_backoff(Duration::ZERO, Duration::ZERO, 1);

        PoolManager::new(
            cfg,
            registry(),
            Arc::new(MockManagementApi::new()),
            Arc::new(JsonCodec),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn failed_replacement_stays_pending_for_later_ticks() {
        let manager = unreachable_manager();

        let bindings = manager.registry.queue_bindings("orders");
        manager.pending.lock().await.push(bindings);

        // Broker unreachable: the binding set must survive the failed respawn.
        manager.respawn_pending().await;
        assert_eq!(manager.total_channels().await, 0);
        assert_eq!(manager.pending.lock().await.len(), 1);

        // And stay queued across further ticks instead of being dropped.
        manager.respawn_pending().await;
        let pending = manager.pending.lock().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0][0].queue, "orders");
    }

    #[tokio::test]
    async fn health_check_retries_pending_replacements() {
        let manager = unreachable_manager();

        let bindings = manager.registry.queue_bindings("orders");
        manager.pending.lock().await.push(bindings);

        manager.health_check().await;

        assert_eq!(manager.pending.lock().await.len(), 1);
        assert_eq!(manager.total_channels().await, 0);
    }

    #[tokio::test]
    async fn queue_backlogs_skips_failing_queues() {
        let mut management = MockManagementApi::new();
        management
            .expect_queue_depth()
            .returning(|queue| match queue {
                "orders" => Err(AmqpError::ManagementApiError("boom".to_owned())),
                _ => Ok(0),
            });

        let manager = PoolManager::new(
            PoolConfig::default(),
            registry(),
            Arc::new(management),
            Arc::new(JsonCodec),
        )
        .unwrap();

        assert!(manager.queue_backlogs().await.is_empty());
    }

    #[tokio::test]
    async fn queue_backlogs_reports_depth_per_queue() {
        let mut management = MockManagementApi::new();
        management.expect_queue_depth().returning(|_| Ok(300));

        let manager = PoolManager::new(
            PoolConfig::default(),
            registry(),
            Arc::new(management),
            Arc::new(JsonCodec),
        )
        .unwrap();

        assert_eq!(
            manager.queue_backlogs().await,
            vec![("orders".to_owned(), 300)]
        );
    }
}
