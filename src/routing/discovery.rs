// Service-instance registry and health probing
//
// Instances register under a service name and are probed periodically.
// A failed probe marks an instance unhealthy; an instance that is still
// unhealthy when the next pass starts is dropped, and service entries left
// empty disappear with it.

use crate::routing::rpc::{self, StatusResponse, OP_STATUS};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One reachable backend endpoint registered under a service name.
#[derive(Debug)]
pub struct ServiceInstance {
    pub service_id: String,
    pub service_name: String,
    pub host: String,
    pub port: u16,
    healthy: AtomicBool,
    load: AtomicI64,
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    pub fn new(
        service_id: impl Into<String>,
        service_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            service_name: service_name.into(),
            host: host.into(),
            port,
            healthy: AtomicBool::new(true),
            load: AtomicI64::new(0),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Seed the load counter, e.g. to carry load across a re-registration.
    pub fn with_load(self, load: i64) -> Self {
        self.load.store(load, Ordering::Relaxed);
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn load(&self) -> i64 {
        self.load.load(Ordering::Relaxed)
    }

    /// Bump the outstanding-work counter. Negative deltas decrement.
    pub fn add_load(&self, delta: i64) {
        self.load.fetch_add(delta, Ordering::Relaxed);
    }
}

/// Health check seam. The default implementation issues a short-deadline
/// CheckStatus RPC against the instance endpoint.
#[async_trait]
pub trait HealthProber: Send + Sync {
    async fn probe(&self, instance: &ServiceInstance) -> bool;
}

/// CheckStatus-based prober.
pub struct RpcHealthProber {
    timeout: Duration,
}

impl RpcHealthProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HealthProber for RpcHealthProber {
    async fn probe(&self, instance: &ServiceInstance) -> bool {
        let endpoint = instance.endpoint();
        let attempt = async {
            let mut stream = tokio::net::TcpStream::connect(&endpoint).await.ok()?;
            rpc::write_frame(&mut stream, OP_STATUS, &()).await.ok()?;
            let (op, body) = rpc::read_frame(&mut stream).await.ok()?;
            if op != OP_STATUS {
                return None;
            }
            let status: StatusResponse = rpc::decode_body(&body).ok()?;
            Some(status.is_healthy)
        };
        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Some(healthy)) => healthy,
            _ => false,
        }
    }
}

/// Registry of service instances keyed by service name.
pub struct ServiceDiscovery {
    services: RwLock<HashMap<String, Vec<Arc<ServiceInstance>>>>,
    prober: RwLock<Arc<dyn HealthProber>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceDiscovery {
    pub fn new(prober: Arc<dyn HealthProber>) -> Arc<Self> {
        Arc::new(Self {
            services: RwLock::new(HashMap::new()),
            prober: RwLock::new(prober),
            heartbeat_task: Mutex::new(None),
        })
    }

    /// Registry with the default RPC prober.
    pub fn with_rpc_prober(probe_timeout: Duration) -> Arc<Self> {
        Self::new(Arc::new(RpcHealthProber::new(probe_timeout)))
    }

    pub fn set_prober(&self, prober: Arc<dyn HealthProber>) {
        *self.prober.write() = prober;
    }

    /// Register an instance. Re-registration with a known id replaces the
    /// stored descriptor: new endpoint and metadata, healthy again, load
    /// reset to whatever the descriptor carries.
    pub fn register(&self, instance: ServiceInstance) {
        let instance = Arc::new(instance);
        let mut services = self.services.write();
        remove_instance(&mut services, &instance.service_id);
        services
            .entry(instance.service_name.clone())
            .or_default()
            .push(Arc::clone(&instance));
        debug!(
            service_id = %instance.service_id,
            service_name = %instance.service_name,
            endpoint = %instance.endpoint(),
            "service instance registered"
        );
    }

    /// Remove an instance by id. Returns whether anything was removed.
    pub fn unregister(&self, service_id: &str) -> bool {
        let mut services = self.services.write();
        let removed = remove_instance(&mut services, service_id);
        if removed {
            debug!(service_id, "service instance unregistered");
        }
        removed
    }

    /// All instances of a service, healthy or not.
    pub fn instances(&self, service_name: &str) -> Vec<Arc<ServiceInstance>> {
        self.services
            .read()
            .get(service_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Only the instances eligible for selection.
    pub fn healthy_instances(&self, service_name: &str) -> Vec<Arc<ServiceInstance>> {
        self.instances(service_name)
            .into_iter()
            .filter(|i| i.is_healthy())
            .collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }

    pub fn instance_count(&self) -> usize {
        self.services.read().values().map(Vec::len).sum()
    }

    /// One heartbeat pass: probe every instance; mark probe failures
    /// unhealthy; drop instances that entered the pass already unhealthy
    /// and still fail; erase empty service entries.
    pub async fn heartbeat_pass(&self) {
        let snapshot: Vec<Arc<ServiceInstance>> = {
            let services = self.services.read();
            services.values().flatten().cloned().collect()
        };

        let prober = self.prober.read().clone();
        let mut to_remove = Vec::new();
        for instance in snapshot {
            let was_healthy = instance.is_healthy();
            let alive = prober.probe(&instance).await;
            if alive {
                instance.set_healthy(true);
            } else if was_healthy {
                warn!(
                    service_id = %instance.service_id,
                    endpoint = %instance.endpoint(),
                    "health probe failed, marking unhealthy"
                );
                instance.set_healthy(false);
            } else {
                to_remove.push(instance.service_id.clone());
            }
        }

        if !to_remove.is_empty() {
            let mut services = self.services.write();
            for service_id in to_remove {
                info!(service_id = %service_id, "dropping unhealthy service instance");
                remove_instance(&mut services, &service_id);
            }
        }
    }

    /// Start the periodic heartbeat task.
    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration) {
        let discovery = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick would probe instances registered
            // milliseconds ago; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                discovery.heartbeat_pass().await;
            }
        });
        let mut slot = self.heartbeat_task.lock();
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat_task.lock().take() {
            handle.abort();
        }
    }
}

/// Remove an instance by id from whichever list holds it, erasing the
/// service entry if it empties. Returns whether anything was removed.
fn remove_instance(
    services: &mut HashMap<String, Vec<Arc<ServiceInstance>>>,
    service_id: &str,
) -> bool {
    let mut removed = false;
    services.retain(|_, instances| {
        let before = instances.len();
        instances.retain(|i| i.service_id != service_id);
        removed |= instances.len() != before;
        !instances.is_empty()
    });
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticProber {
        alive: AtomicBool,
    }

    #[async_trait]
    impl HealthProber for StaticProber {
        async fn probe(&self, _instance: &ServiceInstance) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    fn discovery_with(alive: bool) -> (Arc<ServiceDiscovery>, Arc<StaticProber>) {
        let prober = Arc::new(StaticProber {
            alive: AtomicBool::new(alive),
        });
        (ServiceDiscovery::new(prober.clone()), prober)
    }

    #[test]
    fn test_register_and_lookup() {
        let (discovery, _) = discovery_with(true);
        discovery.register(ServiceInstance::new("chat-1", "chat", "localhost", 50051));
        discovery.register(ServiceInstance::new("chat-2", "chat", "localhost", 50052));
        discovery.register(ServiceInstance::new("notify-1", "notification", "localhost", 50061));

        assert_eq!(discovery.instances("chat").len(), 2);
        assert_eq!(discovery.instances("notification").len(), 1);
        assert!(discovery.instances("missing").is_empty());
        assert_eq!(discovery.instance_count(), 3);
    }

    #[test]
    fn test_reregistration_replaces_and_heals() {
        let (discovery, _) = discovery_with(true);
        discovery.register(ServiceInstance::new("chat-1", "chat", "localhost", 50051));
        let first = discovery.instances("chat").remove(0);
        first.set_healthy(false);
        first.add_load(9);

        discovery.register(ServiceInstance::new("chat-1", "chat", "otherhost", 50099));
        let instances = discovery.instances("chat");
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].endpoint(), "otherhost:50099");
        assert!(instances[0].is_healthy());
        assert_eq!(instances[0].load(), 0);
    }

    #[test]
    fn test_unregister_erases_empty_entries() {
        let (discovery, _) = discovery_with(true);
        discovery.register(ServiceInstance::new("chat-1", "chat", "localhost", 50051));
        assert!(discovery.unregister("chat-1"));
        assert!(!discovery.unregister("chat-1"));
        assert!(discovery.service_names().is_empty());
    }

    #[test]
    fn test_healthy_filter() {
        let (discovery, _) = discovery_with(true);
        discovery.register(ServiceInstance::new("chat-1", "chat", "localhost", 50051));
        discovery.register(ServiceInstance::new("chat-2", "chat", "localhost", 50052));
        discovery.instances("chat")[0].set_healthy(false);

        let healthy = discovery.healthy_instances("chat");
        assert_eq!(healthy.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_marks_then_drops() {
        let (discovery, prober) = discovery_with(false);
        discovery.register(ServiceInstance::new("chat-1", "chat", "localhost", 50051));

        // First failing pass: marked unhealthy, still present.
        discovery.heartbeat_pass().await;
        assert_eq!(discovery.instance_count(), 1);
        assert!(discovery.healthy_instances("chat").is_empty());

        // Second failing pass: dropped, service entry erased.
        discovery.heartbeat_pass().await;
        assert_eq!(discovery.instance_count(), 0);
        assert!(discovery.service_names().is_empty());

        let _ = prober;
    }

    #[tokio::test]
    async fn test_heartbeat_recovers_marked_instance() {
        let (discovery, prober) = discovery_with(false);
        discovery.register(ServiceInstance::new("chat-1", "chat", "localhost", 50051));

        discovery.heartbeat_pass().await;
        assert!(discovery.healthy_instances("chat").is_empty());

        prober.alive.store(true, Ordering::SeqCst);
        discovery.heartbeat_pass().await;
        assert_eq!(discovery.healthy_instances("chat").len(), 1);
    }
}
