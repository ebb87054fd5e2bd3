use crate::channels::BusStats;
use crate::logging::{LogEvent, LogFields, LogLevel};
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Default, Clone)]
pub struct HostMetrics {
    events: u64,
    blocks_mounted: u64,
    fetches: u64,
    bus: BusStats,
}

impl HostMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&mut self) {
        self.events = self.events.saturating_add(1);
    }

    pub fn record_mounts(&mut self, count: usize) {
        self.blocks_mounted = self.blocks_mounted.saturating_add(count as u64);
    }

    pub fn record_fetch_completed(&mut self) {
        self.fetches = self.fetches.saturating_add(1);
    }

    /// Bus counters are cumulative, so the latest reading replaces the last.
    pub fn observe_bus(&mut self, stats: BusStats) {
        self.bus = stats;
    }

    pub fn snapshot(&self, uptime: Duration) -> MetricSnapshot {
        MetricSnapshot {
            uptime_ms: uptime.as_millis() as u64,
            events: self.events,
            blocks_mounted: self.blocks_mounted,
            fetches: self.fetches,
            emissions: self.bus.emissions,
            deliveries: self.bus.deliveries,
            handler_failures: self.bus.failures,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSnapshot {
    pub uptime_ms: u64,
    pub events: u64,
    pub blocks_mounted: u64,
    pub fetches: u64,
    pub emissions: u64,
    pub deliveries: u64,
    pub handler_failures: u64,
}

impl MetricSnapshot {
    pub fn to_log_event(&self, target: &str) -> LogEvent {
        LogEvent::with_fields(LogLevel::Info, target, "host_metrics", self.as_fields())
    }

    pub fn as_fields(&self) -> LogFields {
        let mut map = LogFields::new();
        map.insert("uptime_ms".to_string(), json!(self.uptime_ms));
        map.insert("events".to_string(), json!(self.events));
        map.insert("blocks_mounted".to_string(), json!(self.blocks_mounted));
        map.insert("fetches".to_string(), json!(self.fetches));
        map.insert("emissions".to_string(), json!(self.emissions));
        map.insert("deliveries".to_string(), json!(self.deliveries));
        map.insert("handler_failures".to_string(), json!(self.handler_failures));
        map
    }
}
