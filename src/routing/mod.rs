// Routing service: instance registry, load balancing, the priority work
// queue, metrics, and the RPC surface that exposes them

pub mod balancer;
pub mod discovery;
pub mod metrics;
pub mod queue;
pub mod router;
pub mod rpc;
pub mod service;

pub use balancer::{LoadBalanceStrategy, LoadBalancer};
pub use discovery::{HealthProber, RpcHealthProber, ServiceDiscovery, ServiceInstance};
pub use metrics::RoutingMetrics;
pub use queue::{QueueItem, ResponseCallback, WorkQueue};
pub use router::MessageRouter;
pub use rpc::{ErrorCode, RouteRequest, RouteResponse, RoutingRpcServer, StatusResponse};
pub use service::RoutingService;
