// Routing service assembly
//
// Builds the registry, balancer, queue, metrics and router from a config,
// owns the RPC server and the background tasks, and tears everything down
// in order on stop.

use crate::config::RoutingConfig;
use crate::error::Result;
use crate::routing::balancer::LoadBalancer;
use crate::routing::discovery::{ServiceDiscovery, ServiceInstance};
use crate::routing::metrics::RoutingMetrics;
use crate::routing::queue::WorkQueue;
use crate::routing::router::MessageRouter;
use crate::routing::rpc::RoutingRpcServer;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// One routing-service process worth of state.
pub struct RoutingService {
    config: RoutingConfig,
    discovery: Arc<ServiceDiscovery>,
    queue: Arc<WorkQueue>,
    router: Arc<MessageRouter>,
    rpc: Arc<RoutingRpcServer>,
    running: AtomicBool,
}

impl RoutingService {
    pub fn new(config: RoutingConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let discovery = ServiceDiscovery::with_rpc_prober(Duration::from_secs(
            config.instance_timeout_seconds,
        ));
        let balancer = Arc::new(LoadBalancer::new(config.load_balance_strategy));
        let queue = WorkQueue::new(config.queue_max_size);
        let metrics = Arc::new(RoutingMetrics::new());
        let router = MessageRouter::new(
            Arc::clone(&discovery),
            balancer,
            Arc::clone(&queue),
            metrics,
        );
        let rpc = RoutingRpcServer::new(Arc::clone(&router));

        Ok(Arc::new(Self {
            config,
            discovery,
            queue,
            router,
            rpc,
            running: AtomicBool::new(false),
        }))
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// RPC address once started.
    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.rpc.local_addr()
    }

    /// Bind the RPC endpoint, start the worker pool and the heartbeat task.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.rpc.bind(self.config.rpc_port).await?;
        self.rpc.start()?;
        self.queue.start(self.config.worker_thread_count);
        self.discovery
            .start_heartbeat(Duration::from_secs(self.config.heartbeat_interval_seconds));

        if self.config.register_default_services {
            self.register_default_services();
        }

        info!(
            rpc_port = self.config.rpc_port,
            workers = self.config.worker_thread_count,
            strategy = %self.config.load_balance_strategy,
            "routing service started"
        );
        Ok(())
    }

    /// Stop in order: no new RPC work, then drain the queue contract
    /// (abandon with shutdown errors), then the heartbeat.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.rpc.stop();
        self.queue.stop();
        self.discovery.stop_heartbeat();
        info!("routing service stopped");
    }

    /// Local development seed, mirroring a typical deployment layout.
    fn register_default_services(&self) {
        for instance in [
            ServiceInstance::new("service_chat_1", "chat", "localhost", 50051),
            ServiceInstance::new("service_chat_2", "chat", "localhost", 50052),
            ServiceInstance::new("service_notify_1", "notification", "localhost", 50061),
            ServiceInstance::new("service_command_1", "command", "localhost", 50071),
        ] {
            self.router.register_service(instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_binds_and_seeds() {
        let service = RoutingService::new(RoutingConfig {
            rpc_port: 0,
            register_default_services: true,
            ..RoutingConfig::default()
        })
        .unwrap();
        service.start().await.unwrap();

        assert!(service.rpc_addr().is_some());
        assert_eq!(service.router().instances("chat").len(), 2);
        assert_eq!(service.router().instances("notification").len(), 1);
        service.stop();
    }
}
