// Runtime configuration for the gateway and the routing service
//
// Both configs are plain serde structs with defaults that work for local
// development. A JSON file can override any subset of fields.

use crate::error::{GatewayError, Result};
use crate::routing::LoadBalanceStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Gateway process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Framed-TCP listener port
    pub tcp_port: u16,
    /// WebSocket listener port
    pub websocket_port: u16,
    /// HTTP listener port
    pub http_port: u16,
    /// Maximum number of live connections across all listeners
    pub max_connections: usize,
    /// Idle timeout after which a silent connection is closed
    pub idle_timeout_seconds: u64,
    /// Interval between registry cleanup passes
    pub cleanup_interval_seconds: u64,
    /// Whether login/logout handlers enforce authentication
    pub auth_enabled: bool,
    /// Shared secret for token signatures
    pub auth_secret: String,
    /// Token lifetime
    pub auth_token_ttl_seconds: u64,
    /// Routing service RPC endpoint (host:port)
    pub routing_endpoint: String,
    /// Inject permissive CORS headers into every HTTP response
    pub cors_enabled: bool,
    /// Enable debug-level logging
    pub debug_log: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tcp_port: 8888,
            websocket_port: 9999,
            http_port: 8080,
            max_connections: 10_000,
            idle_timeout_seconds: 300,
            cleanup_interval_seconds: 30,
            auth_enabled: true,
            auth_secret: "default_secret_key".to_string(),
            auth_token_ttl_seconds: 3600,
            routing_endpoint: "127.0.0.1:50050".to_string(),
            cors_enabled: false,
            debug_log: false,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON file, falling back to defaults for
    /// any field the file omits.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| GatewayError::Configuration(format!("invalid config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a working gateway.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(GatewayError::Configuration(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.idle_timeout_seconds == 0 {
            return Err(GatewayError::Configuration(
                "idle_timeout_seconds must be at least 1".to_string(),
            ));
        }
        let ports = [self.tcp_port, self.websocket_port, self.http_port];
        for (i, a) in ports.iter().enumerate() {
            for b in &ports[i + 1..] {
                if *a != 0 && a == b {
                    return Err(GatewayError::Configuration(format!(
                        "listener port {} assigned to more than one protocol",
                        a
                    )));
                }
            }
        }
        if self.auth_enabled && self.auth_secret.is_empty() {
            return Err(GatewayError::Configuration(
                "auth_secret must not be empty when auth is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Routing service process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// RPC listener port
    pub rpc_port: u16,
    /// Number of work-queue worker threads
    pub worker_thread_count: usize,
    /// Work-queue capacity; enqueue fails beyond this
    pub queue_max_size: usize,
    /// Instance selection strategy
    pub load_balance_strategy: LoadBalanceStrategy,
    /// Interval between health-probe passes
    pub heartbeat_interval_seconds: u64,
    /// Deadline for a single instance health probe
    pub instance_timeout_seconds: u64,
    /// Seed a few local service instances at startup (development aid)
    pub register_default_services: bool,
    /// Enable debug-level logging
    pub debug_log: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            rpc_port: 50050,
            worker_thread_count: num_cpus::get().max(1),
            queue_max_size: 10_000,
            load_balance_strategy: LoadBalanceStrategy::RoundRobin,
            heartbeat_interval_seconds: 30,
            instance_timeout_seconds: 2,
            register_default_services: false,
            debug_log: false,
        }
    }
}

impl RoutingConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| GatewayError::Configuration(format!("invalid config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a working service.
    pub fn validate(&self) -> Result<()> {
        if self.worker_thread_count == 0 {
            return Err(GatewayError::Configuration(
                "worker_thread_count must be at least 1".to_string(),
            ));
        }
        if self.queue_max_size == 0 {
            return Err(GatewayError::Configuration(
                "queue_max_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
