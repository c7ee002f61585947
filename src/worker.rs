// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Workers
//!
//! A channel worker owns one broker channel, a prefetch-bounded delivery
//! stream over its assigned queues, and the per-delivery handler invocation
//! with ack/nack. Workers are independent tasks; deliveries within one worker
//! are processed strictly one at a time, which together with the prefetch
//! bound gives natural backpressure.

use crate::{
    config::PoolConfig,
    connection::ConnectionGroup,
    context::{Codec, Delivery},
    errors::AmqpError,
    otel,
    publisher::{requeue_count, Republisher},
    registry::{ConsumerBinding, DispatchRegistry},
    topology,
};
use futures_util::{stream::select_all, StreamExt};
use lapin::{
    message::Delivery as LapinDelivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    Channel,
};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Lifecycle states of a channel worker.
///
/// `Faulted` is reachable from any non-terminal state; a faulted worker never
/// retries internally, it waits for the pool manager to replace it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Opening,
    Subscribing,
    Consuming,
    Draining,
    Closed,
    Faulted,
}

impl WorkerState {
    /// Whether the worker reached the end of its lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Closed | WorkerState::Faulted)
    }
}

/// Whether a failed delivery may go through another delayed republish round.
pub(crate) fn should_republish(attempts: i64, max_attempts: u32) -> bool {
    attempts < max_attempts as i64
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn set_state(state: &Arc<Mutex<WorkerState>>, next: WorkerState) {
    if let Ok(mut guard) = state.lock() {
        *guard = next;
    }
}

/// Pool-side handle of a running channel worker.
///
/// The handle exposes the worker's state and activity timestamp to the health
/// check, and the drain/abort controls used at scale-down and shutdown.
pub struct WorkerHandle {
    id: Uuid,
    connection_id: Uuid,
    bindings: Vec<Arc<ConsumerBinding>>,
    state: Arc<Mutex<WorkerState>>,
    last_activity: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Identifier of this worker.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Identifier of the connection group the worker's channel came from.
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Binding set this worker consumes.
    pub fn bindings(&self) -> &[Arc<ConsumerBinding>] {
        &self.bindings
    }

    /// Distinct queues this worker is subscribed to.
    pub fn queues(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for binding in &self.bindings {
            if !seen.contains(&binding.queue) {
                seen.push(binding.queue.clone());
            }
        }
        seen
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.state
            .lock()
            .map(|guard| *guard)
            .unwrap_or(WorkerState::Faulted)
    }

    /// Milliseconds since epoch of the last processed delivery.
    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity.load(Ordering::SeqCst)
    }

    /// Whether the worker needs replacement.
    ///
    /// A worker is considered faulted when it reports the Faulted state or
    /// when its task ended before reaching a terminal state.
    pub fn is_faulted(&self) -> bool {
        let state = self.state();
        state == WorkerState::Faulted || (self.task.is_finished() && !state.is_terminal())
    }

    /// Whether the worker task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals the worker to stop accepting deliveries and drain.
    pub fn drain(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Force-closes the worker task.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawns a channel worker for the given binding set.
///
/// The worker acquires a channel from the connection group (Opening), sets the
/// prefetch and installs its topology (Subscribing), then consumes from all of
/// its queues until drained or faulted. A failure before the consume loop
/// releases the channel slot and surfaces as an error to the pool.
pub async fn spawn(
    group: Arc<ConnectionGroup>,
    bindings: Vec<Arc<ConsumerBinding>>,
    registry: Arc<DispatchRegistry>,
    cfg: &PoolConfig,
    codec: Arc<dyn Codec>,
) -> Result<WorkerHandle, AmqpError> {
    let id = Uuid::new_v4();
    let state = Arc::new(Mutex::new(WorkerState::Opening));
    let last_activity = Arc::new(AtomicU64::new(now_ms()));

    let channel = group.create_channel().await?;

    set_state(&state, WorkerState::Subscribing);
    if let Err(err) = subscribe(&channel, &bindings, cfg.prefetch_count, id).await {
        group.release_channel();
        return Err(err);
    }

    let mut consumers = Vec::new();
    for queue in distinct_queues(&bindings) {
        let consumer = channel
            .basic_consume(
                &queue,
                &format!("{}-{}", queue, id),
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                group.release_channel();
                AmqpError::ConsumerError(queue.clone())
            })?;
        consumers.push(consumer);
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let channel = Arc::new(channel);
    let republisher = Republisher::new(channel.clone(), codec.clone());

    let task = tokio::spawn({
        let state = state.clone();
        let last_activity = last_activity.clone();
        let group = group.clone();
        let cfg = cfg.clone();
        let worker_id = id;

        async move {
            let tracer = global::tracer("amqp consumer");
            let mut stream = select_all(consumers);
            set_state(&state, WorkerState::Consuming);
            debug!(worker = worker_id.to_string(), "worker consuming");

            let mut faulted = false;
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        break;
                    }

                    next = stream.next() => {
                        match next {
                            Some(Ok(delivery)) => {
                                last_activity.store(now_ms(), Ordering::SeqCst);
                                if let Err(err) = process_delivery(
                                    &tracer,
                                    &delivery,
                                    &registry,
                                    &republisher,
                                    &codec,
                                    &cfg,
                                )
                                .await
                                {
                                    error!(error = err.to_string(), "error consume msg");
                                }
                            }
                            Some(Err(err)) => {
                                error!(
                                    error = err.to_string(),
                                    worker = worker_id.to_string(),
                                    "consumer stream failure"
                                );
                                faulted = true;
                                break;
                            }
                            None => {
                                warn!(
                                    worker = worker_id.to_string(),
                                    "consumer stream ended, channel lost"
                                );
                                faulted = true;
                                break;
                            }
                        }
                    }
                }
            }

            if faulted {
                set_state(&state, WorkerState::Faulted);
            } else {
                set_state(&state, WorkerState::Draining);
                drop(stream);
                if let Err(err) = channel.close(200, "draining").await {
                    debug!(error = err.to_string(), "error closing drained channel");
                }
                set_state(&state, WorkerState::Closed);
                debug!(worker = worker_id.to_string(), "worker closed");
            }

            group.release_channel();
        }
    });

    Ok(WorkerHandle {
        id,
        connection_id: group.id(),
        bindings,
        state,
        last_activity,
        shutdown: shutdown_tx,
        task,
    })
}

fn distinct_queues(bindings: &[Arc<ConsumerBinding>]) -> Vec<String> {
    let mut seen = Vec::new();
    for binding in bindings {
        if !seen.contains(&binding.queue) {
            seen.push(binding.queue.clone());
        }
    }
    seen
}

async fn subscribe(
    channel: &Channel,
    bindings: &[Arc<ConsumerBinding>],
    prefetch: u16,
    worker_id: Uuid,
) -> Result<(), AmqpError> {
    if let Err(err) = channel.basic_qos(prefetch, BasicQosOptions::default()).await {
        error!(
            error = err.to_string(),
            worker = worker_id.to_string(),
            "error to configure qos"
        );
        return Err(AmqpError::QoSDeclarationError(prefetch.to_string()));
    }

    topology::install(channel, bindings).await
}

/// Processes one delivery end to end.
///
/// Resolves the handler via the dispatch registry; unroutable deliveries are
/// nacked without requeue and logged, never crashing the worker. A handler
/// failure (including a decode failure) is nacked and, when a requeue delay is
/// configured and the bounded attempt budget allows, republished onto the same
/// queue after the delay.
pub(crate) async fn process_delivery(
    tracer: &BoxedTracer,
    delivery: &LapinDelivery,
    registry: &DispatchRegistry,
    republisher: &Republisher,
    codec: &Arc<dyn Codec>,
    cfg: &PoolConfig,
) -> Result<(), AmqpError> {
    let headers = match delivery.properties.headers() {
        Some(val) => val.to_owned(),
        None => FieldTable::default(),
    };
    let exchange = delivery.exchange.to_string();
    let routing_key = delivery.routing_key.to_string();

    let (ctx, mut span) = otel::new_span(&headers, tracer, &routing_key);

    debug!(exchange, routing_key, "received delivery");

    let Some(binding) = registry.resolve(&exchange, &routing_key) else {
        let msg = "removing message from queue - reason: unroutable delivery";
        error!(exchange, routing_key, "{}", msg);
        span.set_status(Status::Error {
            description: Cow::from(msg),
        });

        if let Err(e) = delivery
            .nack(BasicNackOptions {
                multiple: false,
                requeue: false,
            })
            .await
        {
            error!("error whiling nack msg");
            span.record_error(&e);
            return Err(AmqpError::NackMessageError);
        }

        return Ok(());
    };

    let owned = Delivery {
        exchange,
        routing_key,
        delivery_tag: delivery.delivery_tag,
        headers: headers.clone(),
        body: delivery.data.clone(),
    };
    let attempts = requeue_count(&headers);

    let result = binding.handler.handle(owned.clone(), codec.clone()).await;

    if result.is_ok() {
        debug!("message successfully processed");
        return match delivery.ack(BasicAckOptions { multiple: false }).await {
            Err(e) => {
                error!("error whiling ack msg");
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(AmqpError::AckMessageError)
            }
            _ => {
                span.set_status(Status::Ok);
                Ok(())
            }
        };
    }

    // Nack before any republish so ack/nack order follows delivery order.
    if let Err(e) = delivery
        .nack(BasicNackOptions {
            multiple: false,
            requeue: false,
        })
        .await
    {
        error!("error whiling nack msg");
        span.record_error(&e);
        span.set_status(Status::Error {
            description: Cow::from("error to nack msg"),
        });
        return Err(AmqpError::NackMessageError);
    }

    match cfg.requeue_delay {
        Some(delay) if should_republish(attempts, cfg.max_requeue_attempts) => {
            warn!(
                queue = binding.queue,
                attempts, "error whiling handling msg, requeuing for later"
            );
            span.set_status(Status::Error {
                description: Cow::from("handler failure, message requeued"),
            });
            republisher
                .republish_after(&ctx, &binding.queue, &owned, attempts + 1, delay)
                .await?;
        }
        Some(_) => {
            error!(
                queue = binding.queue,
                attempts, "too many requeue attempts, dropping message"
            );
            span.set_status(Status::Error {
                description: Cow::from("handler failure, requeue budget exhausted"),
            });
        }
        None => {
            debug!(queue = binding.queue, "handler failure, message dropped");
            span.set_status(Status::Error {
                description: Cow::from("handler failure, message dropped"),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn republish_is_bounded_by_attempt_budget() {
        assert!(should_republish(0, 3));
        assert!(should_republish(2, 3));
        assert!(!should_republish(3, 3));
        assert!(!should_republish(10, 3));
        assert!(!should_republish(0, 0));
    }

    #[test]
    fn terminal_states() {
        assert!(WorkerState::Closed.is_terminal());
        assert!(WorkerState::Faulted.is_terminal());
        assert!(!WorkerState::Opening.is_terminal());
        assert!(!WorkerState::Subscribing.is_terminal());
        assert!(!WorkerState::Consuming.is_terminal());
        assert!(!WorkerState::Draining.is_terminal());
    }
}
