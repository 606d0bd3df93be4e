// Routing service metrics
//
// Named counters and timers (running total plus sample count, so the mean
// is computable without histograms), exportable as JSON or Prometheus
// text. Reset zeroes everything and restarts the uptime reference.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Messages handled, successful or not.
pub const MESSAGE_COUNT: &str = "message_count";
/// Messages that failed processing.
pub const MESSAGE_ERROR_COUNT: &str = "message_error_count";
/// Time spent routing one message.
pub const MESSAGE_LATENCY: &str = "message_latency";
/// Successful routing decisions.
pub const ROUTE_COUNT: &str = "route_count";
/// Failed routing decisions.
pub const ROUTE_ERROR_COUNT: &str = "route_error_count";
/// Registered service instances.
pub const SERVICE_COUNT: &str = "service_count";

#[derive(Debug, Clone, Copy, Default)]
struct TimerEntry {
    total_ms: u64,
    samples: u64,
}

/// Metric store for the routing service.
pub struct RoutingMetrics {
    counters: RwLock<HashMap<String, i64>>,
    timers: RwLock<HashMap<String, TimerEntry>>,
    started_at: RwLock<(Instant, DateTime<Utc>)>,
}

impl RoutingMetrics {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            timers: RwLock::new(HashMap::new()),
            started_at: RwLock::new((Instant::now(), Utc::now())),
        }
    }

    pub fn increment_counter(&self, name: &str) {
        self.add_counter(name, 1);
    }

    pub fn decrement_counter(&self, name: &str) {
        self.add_counter(name, -1);
    }

    pub fn add_counter(&self, name: &str, delta: i64) {
        let mut counters = self.counters.write();
        *counters.entry(name.to_string()).or_insert(0) += delta;
    }

    pub fn counter(&self, name: &str) -> i64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    /// Record one timer sample.
    pub fn record_timer(&self, name: &str, elapsed: Duration) {
        let mut timers = self.timers.write();
        let entry = timers.entry(name.to_string()).or_default();
        entry.total_ms += elapsed.as_millis() as u64;
        entry.samples += 1;
    }

    pub fn timer_total_ms(&self, name: &str) -> u64 {
        self.timers
            .read()
            .get(name)
            .map(|t| t.total_ms)
            .unwrap_or(0)
    }

    pub fn timer_samples(&self, name: &str) -> u64 {
        self.timers.read().get(name).map(|t| t.samples).unwrap_or(0)
    }

    /// Mean sample duration in milliseconds, 0.0 with no samples.
    pub fn timer_mean_ms(&self, name: &str) -> f64 {
        let timers = self.timers.read();
        match timers.get(name) {
            Some(entry) if entry.samples > 0 => entry.total_ms as f64 / entry.samples as f64,
            _ => 0.0,
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.read().0.elapsed().as_secs()
    }

    /// Zero every metric and restart the uptime reference.
    pub fn reset(&self) {
        self.counters.write().clear();
        self.timers.write().clear();
        *self.started_at.write() = (Instant::now(), Utc::now());
    }

    /// Export as a JSON object.
    pub fn export_json(&self) -> serde_json::Value {
        let counters = self.counters.read();
        let timers = self.timers.read();

        let mut timer_map = serde_json::Map::new();
        for (name, entry) in timers.iter() {
            let mean = if entry.samples > 0 {
                entry.total_ms as f64 / entry.samples as f64
            } else {
                0.0
            };
            timer_map.insert(
                name.clone(),
                serde_json::json!({
                    "total_ms": entry.total_ms,
                    "samples": entry.samples,
                    "mean_ms": mean,
                }),
            );
        }

        serde_json::json!({
            "started_at": self.started_at.read().1.to_rfc3339(),
            "uptime_seconds": self.uptime_seconds(),
            "counters": counters.clone(),
            "timers": timer_map,
        })
    }

    /// Export in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();
        let counters = self.counters.read();
        let mut names: Vec<&String> = counters.keys().collect();
        names.sort();
        for name in names {
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, counters[name]));
        }

        let timers = self.timers.read();
        let mut names: Vec<&String> = timers.keys().collect();
        names.sort();
        for name in names {
            let entry = &timers[name];
            output.push_str(&format!("# TYPE {}_total_ms counter\n", name));
            output.push_str(&format!("{}_total_ms {}\n", name, entry.total_ms));
            output.push_str(&format!("# TYPE {}_samples counter\n", name));
            output.push_str(&format!("{}_samples {}\n", name, entry.samples));
        }

        output.push_str("# TYPE uptime_seconds gauge\n");
        output.push_str(&format!("uptime_seconds {}\n", self.uptime_seconds()));
        output
    }
}

impl Default for RoutingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = RoutingMetrics::new();
        metrics.increment_counter(MESSAGE_COUNT);
        metrics.increment_counter(MESSAGE_COUNT);
        metrics.decrement_counter(MESSAGE_COUNT);
        assert_eq!(metrics.counter(MESSAGE_COUNT), 1);
        assert_eq!(metrics.counter("missing"), 0);
    }

    #[test]
    fn test_timer_mean() {
        let metrics = RoutingMetrics::new();
        metrics.record_timer(MESSAGE_LATENCY, Duration::from_millis(10));
        metrics.record_timer(MESSAGE_LATENCY, Duration::from_millis(30));
        assert_eq!(metrics.timer_total_ms(MESSAGE_LATENCY), 40);
        assert_eq!(metrics.timer_samples(MESSAGE_LATENCY), 2);
        assert!((metrics.timer_mean_ms(MESSAGE_LATENCY) - 20.0).abs() < f64::EPSILON);
        assert_eq!(metrics.timer_mean_ms("missing"), 0.0);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let metrics = RoutingMetrics::new();
        metrics.increment_counter(ROUTE_COUNT);
        metrics.record_timer(MESSAGE_LATENCY, Duration::from_millis(5));
        metrics.reset();
        assert_eq!(metrics.counter(ROUTE_COUNT), 0);
        assert_eq!(metrics.timer_samples(MESSAGE_LATENCY), 0);
    }

    #[test]
    fn test_json_export_shape() {
        let metrics = RoutingMetrics::new();
        metrics.increment_counter(ROUTE_COUNT);
        metrics.record_timer(MESSAGE_LATENCY, Duration::from_millis(7));

        let json = metrics.export_json();
        assert_eq!(json["counters"][ROUTE_COUNT], 1);
        assert_eq!(json["timers"][MESSAGE_LATENCY]["samples"], 1);
        assert!(json["started_at"].is_string());
    }

    #[test]
    fn test_prometheus_export_format() {
        let metrics = RoutingMetrics::new();
        metrics.increment_counter(ROUTE_COUNT);
        metrics.record_timer(MESSAGE_LATENCY, Duration::from_millis(7));

        let text = metrics.export_prometheus();
        assert!(text.contains("# TYPE route_count counter\nroute_count 1\n"));
        assert!(text.contains("message_latency_total_ms 7\n"));
        assert!(text.contains("message_latency_samples 1\n"));
        assert!(text.contains("# TYPE uptime_seconds gauge\n"));
    }
}
