//! Process metrics for health records.
//!
//! # Panic-Free Guarantees
//!
//! A process that cannot be found reports zero usage.

use std::process;

use sysinfo::{Pid, System};

/// Memory usage warning threshold in MB.
pub const HIGH_MEMORY_THRESHOLD_MB: f64 = 64.0;

/// CPU usage warning threshold (percentage).
pub const HIGH_CPU_THRESHOLD_PERCENT: f32 = 50.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessMetrics {
    pub memory_bytes: u64,
    pub memory_mb: f64,
    pub cpu_percent: f32,
    pub memory_high: bool,
    pub cpu_high: bool,
}

impl ProcessMetrics {
    pub fn is_any_high(&self) -> bool {
        self.memory_high || self.cpu_high
    }
}

/// Samples the daemon's own memory and CPU usage.
///
/// CPU usage is relative to the previous refresh, so the first sample
/// after construction reads zero.
pub struct ProcessMonitor {
    system: System,
    pid: Pid,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(process::id()),
        }
    }

    pub fn refresh(&mut self) -> ProcessMetrics {
        // CPU usage is only computed by a full refresh.
        self.system.refresh_all();

        let (memory_bytes, cpu_percent) = self
            .system
            .process(self.pid)
            .map(|p| (p.memory(), p.cpu_usage()))
            .unwrap_or((0, 0.0));

        let memory_mb = memory_bytes as f64 / (1024.0 * 1024.0);
        ProcessMetrics {
            memory_bytes,
            memory_mb,
            cpu_percent,
            memory_high: memory_mb > HIGH_MEMORY_THRESHOLD_MB,
            cpu_high: cpu_percent > HIGH_CPU_THRESHOLD_PERCENT,
        }
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_finds_own_process() {
        let mut monitor = ProcessMonitor::new();
        let metrics = monitor.refresh();
        assert!(metrics.memory_bytes > 0);
        assert!(metrics.memory_mb > 0.0);
    }

    #[test]
    fn test_thresholds() {
        let metrics = ProcessMetrics {
            memory_mb: HIGH_MEMORY_THRESHOLD_MB + 1.0,
            memory_high: true,
            ..ProcessMetrics::default()
        };
        assert!(metrics.is_any_high());
        assert!(!ProcessMetrics::default().is_any_high());
    }
}
