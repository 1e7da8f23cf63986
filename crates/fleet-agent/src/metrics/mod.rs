//! System metrics collection
//!
//! Heartbeats carry a snapshot of host metrics as their `systemInfo`.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;
use sysinfo::System;

/// System metrics for a machine
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    /// Machine hostname
    pub hostname: String,
    /// Operating system name and version
    pub os: String,
    /// CPU architecture
    pub arch: String,
    /// CPU usage percentage (0-100), averaged over all cores
    pub cpu_percent: f32,
    /// Memory in use, in bytes
    pub memory_used: u64,
    /// Total memory, in bytes
    pub memory_total: u64,
    /// Memory usage percentage (0-100)
    pub memory_percent: f32,
    /// System load averages (1, 5, 15 minutes)
    pub load_average: [f64; 3],
    /// Seconds since boot
    pub uptime_secs: u64,
}

impl SystemMetrics {
    /// Convert to the opaque JSON blob sent in heartbeats
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Collects metrics, keeping state between samples
///
/// CPU usage is measured between two refreshes, so the first sample after
/// creation reports 0.
pub struct MetricsCollector {
    system: Mutex<System>,
}

impl MetricsCollector {
    /// Create a new collector
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Collect current system metrics
    pub fn collect(&self) -> SystemMetrics {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu_usage();
        system.refresh_memory();

        let memory_total = system.total_memory();
        let memory_used = system.used_memory();
        let memory_percent = if memory_total > 0 {
            (memory_used as f64 / memory_total as f64 * 100.0) as f32
        } else {
            0.0
        };
        let load = System::load_average();

        SystemMetrics {
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            os: System::long_os_version().unwrap_or_else(|| std::env::consts::OS.to_string()),
            arch: std::env::consts::ARCH.to_string(),
            cpu_percent: system.global_cpu_usage(),
            memory_used,
            memory_total,
            memory_percent,
            load_average: [load.one, load.five, load.fifteen],
            uptime_secs: System::uptime(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
