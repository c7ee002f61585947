// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dispatch Registry
//!
//! This module builds the immutable lookup from (exchange, routing key) to a
//! message handler. The registry is constructed once at startup from the
//! declarative handler descriptors and is read-only afterward, so workers
//! resolve handlers without any locking.

use crate::{errors::AmqpError, handler::ConsumerHandler, handler::HandlerDescriptor};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::debug;

/// One immutable binding produced by the registry build.
///
/// A binding ties a (queue, routing key, exchange) combination to the single
/// handler and payload type declared for it.
#[derive(Clone)]
pub struct ConsumerBinding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub payload_type: &'static str,
    pub handler: Arc<dyn ConsumerHandler>,
}

/// Immutable lookup from routes to handlers.
///
/// Built once from handler descriptors; lookup misses are reported to the
/// caller, which nacks the delivery without requeue.
pub struct DispatchRegistry {
    bindings: Vec<Arc<ConsumerBinding>>,
    routes: HashMap<(String, String), Arc<ConsumerBinding>>,
}

impl DispatchRegistry {
    /// Builds the registry from a set of handler descriptors.
    ///
    /// Every declared exchange of a descriptor is combined with every declared
    /// route. The build fails with `ConfigurationError` if a descriptor has no
    /// exchange or no route, if two different payload types are bound to the
    /// same queue, or if two handlers claim the same (exchange, routing key)
    /// route.
    pub fn build(descriptors: Vec<HandlerDescriptor>) -> Result<DispatchRegistry, AmqpError> {
        let mut bindings = Vec::new();
        let mut routes: HashMap<(String, String), Arc<ConsumerBinding>> = HashMap::new();
        let mut queue_payloads: HashMap<String, &'static str> = HashMap::new();

        for descriptor in &descriptors {
            if descriptor.exchanges.is_empty() {
                return Err(AmqpError::ConfigurationError(
                    "handler descriptor declares no exchange".to_owned(),
                ));
            }

            if descriptor.routes.is_empty() {
                return Err(AmqpError::ConfigurationError(
                    "handler descriptor declares no queue route".to_owned(),
                ));
            }

            for route in &descriptor.routes {
                match queue_payloads.get(route.queue.as_str()) {
                    Some(payload) if *payload != route.payload_type => {
                        return Err(AmqpError::ConfigurationError(format!(
                            "queue `{}` is bound to payload types `{}` and `{}`",
                            route.queue, payload, route.payload_type
                        )));
                    }
                    _ => {
                        queue_payloads.insert(route.queue.clone(), route.payload_type);
                    }
                }

                for exchange in &descriptor.exchanges {
                    let key = (exchange.clone(), route.routing_key.clone());
                    if routes.contains_key(&key) {
                        return Err(AmqpError::ConfigurationError(format!(
                            "route `{}`:`{}` is claimed by more than one handler",
                            exchange, route.routing_key
                        )));
                    }

                    let binding = Arc::new(ConsumerBinding {
                        exchange: exchange.clone(),
                        queue: route.queue.clone(),
                        routing_key: route.routing_key.clone(),
                        payload_type: route.payload_type,
                        handler: route.handler.clone(),
                    });

                    debug!(
                        exchange = binding.exchange,
                        queue = binding.queue,
                        routing_key = binding.routing_key,
                        "registered consumer binding"
                    );

                    routes.insert(key, binding.clone());
                    bindings.push(binding);
                }
            }
        }

        if bindings.is_empty() {
            return Err(AmqpError::ConfigurationError(
                "no consumer bindings registered".to_owned(),
            ));
        }

        Ok(DispatchRegistry { bindings, routes })
    }

    /// Resolves the handler binding for a delivery.
    ///
    /// # Returns
    /// The binding for the (exchange, routing key) pair, or None for
    /// unroutable deliveries.
    pub fn resolve(&self, exchange: &str, routing_key: &str) -> Option<Arc<ConsumerBinding>> {
        self.routes
            .get(&(exchange.to_owned(), routing_key.to_owned()))
            .cloned()
    }

    /// All bindings in registration order.
    pub fn bindings(&self) -> &[Arc<ConsumerBinding>] {
        &self.bindings
    }

    /// Distinct queue names in registration order.
    pub fn queues(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for binding in &self.bindings {
            if !seen.contains(&binding.queue) {
                seen.push(binding.queue.clone());
            }
        }
        seen
    }

    /// All bindings feeding one queue.
    pub fn queue_bindings(&self, queue: &str) -> Vec<Arc<ConsumerBinding>> {
        self.bindings
            .iter()
            .filter(|binding| binding.queue == queue)
            .cloned()
            .collect()
    }

    /// Groups bindings by queue and distributes the groups over `n` workers.
    ///
    /// A queue's bindings are never split across assignments: each group
    /// holds every binding that feeds one queue, and groups are dealt out
    /// round-robin. When there are more workers than queues, the groups cycle
    /// so that extra workers consume the busiest-shared queues in parallel.
    pub fn partition(&self, n: usize) -> Vec<Vec<Arc<ConsumerBinding>>> {
        if n == 0 {
            return vec![];
        }

        let mut groups: BTreeMap<String, Vec<Arc<ConsumerBinding>>> = BTreeMap::new();
        for binding in &self.bindings {
            groups
                .entry(binding.queue.clone())
                .or_default()
                .push(binding.clone());
        }
        let groups: Vec<Vec<Arc<ConsumerBinding>>> = groups.into_values().collect();

        if groups.is_empty() {
            return vec![];
        }

        if n <= groups.len() {
            let mut assignments: Vec<Vec<Arc<ConsumerBinding>>> = vec![Vec::new(); n];
            for (i, group) in groups.into_iter().enumerate() {
                assignments[i % n].extend(group);
            }
            assignments
        } else {
            (0..n).map(|i| groups[i % groups.len()].clone()).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::BusContext, handler::RouteDescriptor};
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct OrderMessage {
        #[allow(dead_code)]
        id: u64,
    }

    #[derive(Deserialize)]
    struct AuditMessage {
        #[allow(dead_code)]
        actor: String,
    }

    fn order_route(queue: &str, key: &str) -> RouteDescriptor {
        RouteDescriptor::new(queue, key, |_ctx: BusContext<OrderMessage>| async move {
            Ok(())
        })
    }

    fn audit_route(queue: &str, key: &str) -> RouteDescriptor {
        RouteDescriptor::new(queue, key, |_ctx: BusContext<AuditMessage>| async move {
            Ok(())
        })
    }

    #[test]
    fn build_produces_exchange_route_product() {
        let registry = DispatchRegistry::build(vec![HandlerDescriptor::new()
            .exchange("ex1")
            .exchange("ex2")
            .route(order_route("orders", "order.created"))])
        .unwrap();

        assert_eq!(registry.bindings().len(), 2);
        assert!(registry.resolve("ex1", "order.created").is_some());
        assert!(registry.resolve("ex2", "order.created").is_some());
    }

    #[test]
    fn resolve_misses_unknown_routes() {
        let registry = DispatchRegistry::build(vec![HandlerDescriptor::new()
            .exchange("ex1")
            .route(order_route("orders", "order.created"))])
        .unwrap();

        assert!(registry.resolve("ex1", "order.deleted").is_none());
        assert!(registry.resolve("other", "order.created").is_none());
    }

    #[test]
    fn build_rejects_conflicting_payload_types_on_one_queue() {
        let result = DispatchRegistry::build(vec![
            HandlerDescriptor::new()
                .exchange("ex1")
                .route(order_route("orders", "order.created")),
            HandlerDescriptor::new()
                .exchange("ex2")
                .route(audit_route("orders", "order.audited")),
        ]);

        assert!(matches!(result, Err(AmqpError::ConfigurationError(_))));
    }

    #[test]
    fn build_rejects_descriptor_without_exchange() {
        let result = DispatchRegistry::build(vec![
            HandlerDescriptor::new().route(order_route("orders", "order.created"))
        ]);

        assert!(matches!(result, Err(AmqpError::ConfigurationError(_))));
    }

    #[test]
    fn build_rejects_descriptor_without_routes() {
        let result = DispatchRegistry::build(vec![HandlerDescriptor::new().exchange("ex1")]);

        assert!(matches!(result, Err(AmqpError::ConfigurationError(_))));
    }

    #[test]
    fn build_rejects_duplicate_route() {
        let result = DispatchRegistry::build(vec![
            HandlerDescriptor::new()
                .exchange("ex1")
                .route(order_route("orders", "order.created")),
            HandlerDescriptor::new()
                .exchange("ex1")
                .route(order_route("orders-copy", "order.created")),
        ]);

        assert!(matches!(result, Err(AmqpError::ConfigurationError(_))));
    }

    #[test]
    fn partition_never_splits_a_queue() {
        let registry = DispatchRegistry::build(vec![HandlerDescriptor::new()
            .exchange("ex1")
            .exchange("ex2")
            .route(order_route("orders", "order.created"))
            .route(audit_route("audits", "audit.logged"))])
        .unwrap_or_else(|_| panic!("registry should build"));

        let parts = registry.partition(2);
        assert_eq!(parts.len(), 2);
        for part in &parts {
            let queues: Vec<&str> = part.iter().map(|b| b.queue.as_str()).collect();
            // Each assignment holds all bindings of its queues.
            for queue in &queues {
                assert_eq!(
                    part.iter().filter(|b| b.queue == *queue).count(),
                    registry.queue_bindings(queue).len()
                );
            }
        }
    }

    #[test]
    fn partition_cycles_groups_when_workers_exceed_queues() {
        let registry = DispatchRegistry::build(vec![HandlerDescriptor::new()
            .exchange("ex1")
            .route(order_route("orders", "order.created"))])
        .unwrap();

        let parts = registry.partition(3);
        assert_eq!(parts.len(), 3);
        for part in parts {
            assert_eq!(part.len(), 1);
            assert_eq!(part[0].queue, "orders");
        }
    }
}
