// Routing decisions
//
// Composes the instance registry, the load balancer, the work queue, and
// the metrics block. Every RPC-submitted request goes through the queue so
// priority ordering holds at the RPC boundary; the workers run the same
// decision path as direct calls.

use crate::routing::balancer::LoadBalancer;
use crate::routing::discovery::{ServiceDiscovery, ServiceInstance};
use crate::routing::metrics::{
    RoutingMetrics, MESSAGE_COUNT, MESSAGE_ERROR_COUNT, MESSAGE_LATENCY, ROUTE_COUNT,
    ROUTE_ERROR_COUNT, SERVICE_COUNT,
};
use crate::routing::queue::{QueueItem, ResponseCallback, WorkQueue};
use crate::routing::rpc::{ErrorCode, RouteRequest, RouteResponse, StatusResponse};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Decision core of the routing service.
pub struct MessageRouter {
    discovery: Arc<ServiceDiscovery>,
    balancer: Arc<LoadBalancer>,
    queue: Arc<WorkQueue>,
    metrics: Arc<RoutingMetrics>,
}

impl MessageRouter {
    /// Assemble the router and install the queue processor so workers run
    /// the routing path.
    pub fn new(
        discovery: Arc<ServiceDiscovery>,
        balancer: Arc<LoadBalancer>,
        queue: Arc<WorkQueue>,
        metrics: Arc<RoutingMetrics>,
    ) -> Arc<Self> {
        let router = Arc::new(Self {
            discovery,
            balancer,
            queue: Arc::clone(&queue),
            metrics,
        });

        let discovery = Arc::clone(&router.discovery);
        let balancer = Arc::clone(&router.balancer);
        let metrics = Arc::clone(&router.metrics);
        queue.set_processor(Arc::new(move |request| {
            route_instrumented(&discovery, &balancer, &metrics, request)
        }));

        router
    }

    /// Route one request synchronously.
    pub fn route_message(&self, request: &RouteRequest) -> RouteResponse {
        route_instrumented(&self.discovery, &self.balancer, &self.metrics, request)
    }

    /// Enqueue a request for the worker pool. When the queue refuses the
    /// item, the callback fires synchronously with an internal error.
    pub fn submit(&self, request: RouteRequest, callback: ResponseCallback) {
        let priority = request.priority;
        let item = QueueItem::new(request, callback, priority);
        if let Err(rejected) = self.queue.enqueue(item) {
            warn!("enqueue failed: {}", rejected.reason);
            self.metrics.increment_counter(MESSAGE_COUNT);
            self.metrics.increment_counter(MESSAGE_ERROR_COUNT);
            let response = RouteResponse::error(
                rejected.item.request.message_id.clone(),
                ErrorCode::InternalError,
                format!("request rejected: {}", rejected.reason),
            );
            (rejected.item.callback)(response);
        }
    }

    /// Register an instance with the discovery registry.
    pub fn register_service(&self, instance: ServiceInstance) {
        self.discovery.register(instance);
        self.metrics.increment_counter(SERVICE_COUNT);
    }

    /// Remove an instance by id.
    pub fn unregister_service(&self, service_id: &str) {
        if self.discovery.unregister(service_id) {
            self.metrics.decrement_counter(SERVICE_COUNT);
        }
    }

    pub fn instances(&self, service_name: &str) -> Vec<Arc<ServiceInstance>> {
        self.discovery.instances(service_name)
    }

    pub fn discovery(&self) -> &Arc<ServiceDiscovery> {
        &self.discovery
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn metrics(&self) -> &Arc<RoutingMetrics> {
        &self.metrics
    }

    /// Health snapshot for CheckStatus.
    pub fn check_status(&self) -> StatusResponse {
        StatusResponse {
            is_healthy: true,
            queue_size: self.queue.len() as u64,
            uptime_seconds: self.metrics.uptime_seconds(),
        }
    }
}

/// The routing decision with metrics around it.
fn route_instrumented(
    discovery: &ServiceDiscovery,
    balancer: &LoadBalancer,
    metrics: &RoutingMetrics,
    request: &RouteRequest,
) -> RouteResponse {
    let start = Instant::now();
    metrics.increment_counter(MESSAGE_COUNT);

    let response = route_internal(discovery, balancer, request);

    metrics.record_timer(MESSAGE_LATENCY, start.elapsed());
    if response.accepted {
        metrics.increment_counter(ROUTE_COUNT);
    } else {
        metrics.increment_counter(MESSAGE_ERROR_COUNT);
        metrics.increment_counter(ROUTE_ERROR_COUNT);
    }
    response
}

/// Pick an instance for the request's target service.
fn route_internal(
    discovery: &ServiceDiscovery,
    balancer: &LoadBalancer,
    request: &RouteRequest,
) -> RouteResponse {
    let message_id = request.message_id.clone();

    let target_service = request.target_service.trim();
    if target_service.is_empty() {
        return RouteResponse::error(
            message_id,
            ErrorCode::InvalidRequest,
            "Target service is required",
        );
    }

    let candidates = discovery.healthy_instances(target_service);
    if candidates.is_empty() {
        return RouteResponse::error(
            message_id,
            ErrorCode::ServiceUnavailable,
            "No available service instances for target service",
        );
    }

    let Some(instance) = balancer.select(target_service, &candidates) else {
        return RouteResponse::error(
            message_id,
            ErrorCode::ServiceUnavailable,
            "Failed to select service instance",
        );
    };

    debug!(
        message_id = %message_id,
        target_service,
        instance = %instance.service_id,
        endpoint = %instance.endpoint(),
        "message routed"
    );
    RouteResponse::success(message_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::balancer::LoadBalanceStrategy;
    use crate::routing::discovery::HealthProber;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct AlwaysUp;

    #[async_trait]
    impl HealthProber for AlwaysUp {
        async fn probe(&self, _instance: &ServiceInstance) -> bool {
            true
        }
    }

    fn router(strategy: LoadBalanceStrategy, queue_size: usize) -> Arc<MessageRouter> {
        MessageRouter::new(
            ServiceDiscovery::new(Arc::new(AlwaysUp)),
            Arc::new(LoadBalancer::new(strategy)),
            WorkQueue::new(queue_size),
            Arc::new(RoutingMetrics::new()),
        )
    }

    #[test]
    fn test_missing_target_is_invalid_request() {
        let router = router(LoadBalanceStrategy::RoundRobin, 10);
        let response = router.route_message(&RouteRequest::new("m1", ""));
        assert!(!response.accepted);
        assert_eq!(response.error_code, ErrorCode::InvalidRequest);
        assert_eq!(response.message_id, "m1");
    }

    #[test]
    fn test_unknown_service_is_unavailable() {
        let router = router(LoadBalanceStrategy::RoundRobin, 10);
        let response = router.route_message(&RouteRequest::new("m1", "nowhere"));
        assert!(!response.accepted);
        assert_eq!(response.error_code, ErrorCode::ServiceUnavailable);
    }

    #[test]
    fn test_all_unhealthy_is_unavailable() {
        let router = router(LoadBalanceStrategy::RoundRobin, 10);
        router.register_service(ServiceInstance::new("chat-1", "chat", "localhost", 50051));
        router.register_service(ServiceInstance::new("chat-2", "chat", "localhost", 50052));
        for instance in router.instances("chat") {
            instance.set_healthy(false);
        }

        let response = router.route_message(&RouteRequest::new("m9", "chat"));
        assert!(!response.accepted);
        assert_eq!(response.error_code, ErrorCode::ServiceUnavailable);
        assert_eq!(response.message_id, "m9");
    }

    #[test]
    fn test_round_robin_over_register() {
        let router = router(LoadBalanceStrategy::RoundRobin, 10);
        for i in 0..3 {
            router.register_service(ServiceInstance::new(
                format!("chat-{}", i),
                "chat",
                "localhost",
                50051 + i,
            ));
        }

        for i in 0..6 {
            let response = router.route_message(&RouteRequest::new(format!("m{}", i), "chat"));
            assert!(response.accepted, "request {} not accepted", i);
        }
        // Two selections each under round-robin.
        let loads: HashMap<String, i64> = router
            .instances("chat")
            .iter()
            .map(|i| (i.service_id.clone(), i.load()))
            .collect();
        assert!(loads.values().all(|&l| l == 2), "loads: {:?}", loads);
    }

    #[test]
    fn test_metrics_track_outcomes() {
        let router = router(LoadBalanceStrategy::RoundRobin, 10);
        router.register_service(ServiceInstance::new("chat-1", "chat", "localhost", 50051));

        router.route_message(&RouteRequest::new("ok", "chat"));
        router.route_message(&RouteRequest::new("bad", "missing"));

        let metrics = router.metrics();
        assert_eq!(metrics.counter(MESSAGE_COUNT), 2);
        assert_eq!(metrics.counter(ROUTE_COUNT), 1);
        assert_eq!(metrics.counter(ROUTE_ERROR_COUNT), 1);
        assert_eq!(metrics.timer_samples(MESSAGE_LATENCY), 2);
        assert_eq!(metrics.counter(SERVICE_COUNT), 1);
    }

    #[test]
    fn test_submit_queue_full_fails_synchronously() {
        let router = router(LoadBalanceStrategy::RoundRobin, 1);
        // No workers running: first fills the queue, second is rejected.
        router.submit(RouteRequest::new("first", "chat"), Box::new(|_| {}));

        let (tx, rx) = std::sync::mpsc::channel();
        router.submit(
            RouteRequest::new("second", "chat"),
            Box::new(move |response| {
                let _ = tx.send(response);
            }),
        );
        let response = rx.recv_timeout(std::time::Duration::from_millis(100)).unwrap();
        assert!(!response.accepted);
        assert_eq!(response.error_code, ErrorCode::InternalError);
        assert_eq!(response.message_id, "second");
    }

    #[test]
    fn test_check_status_reports_queue_depth() {
        let router = router(LoadBalanceStrategy::RoundRobin, 10);
        router.submit(RouteRequest::new("m1", "chat"), Box::new(|_| {}));
        let status = router.check_status();
        assert!(status.is_healthy);
        assert_eq!(status.queue_size, 1);
    }
}
