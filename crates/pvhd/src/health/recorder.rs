//! Periodic health capture and queries.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pvh_core::{is_healthy, HealthRecord, HealthReport, Subsystem, SystemSnapshot};
use tracing::{debug, info, warn};

use super::store::RecordStore;
use super::HealthError;
use crate::monitor::ProcessMonitor;
use crate::safety::SafetyHandle;

/// Records returned when a query gives no limit.
pub const DEFAULT_RECENT: usize = 10;

/// Upper bound on records returned by one query.
pub const MAX_RECENT: usize = 1000;

pub struct HealthRecorder {
    store: Arc<dyn RecordStore>,
    /// Records the store refused, kept until they expire.
    fallback: VecDeque<HealthRecord>,
    fallback_capacity: usize,
    retention: Duration,
    safety: SafetyHandle,
    monitor: ProcessMonitor,
    store_degraded: bool,
}

impl HealthRecorder {
    pub fn new(
        store: Arc<dyn RecordStore>,
        safety: SafetyHandle,
        retention: Duration,
        fallback_capacity: usize,
    ) -> Self {
        Self {
            store,
            fallback: VecDeque::new(),
            fallback_capacity: fallback_capacity.max(1),
            retention,
            safety,
            monitor: ProcessMonitor::new(),
            store_degraded: false,
        }
    }

    pub fn set_retention(&mut self, retention: Duration) {
        self.retention = retention;
    }

    fn cutoff(&self, wall: DateTime<Utc>) -> DateTime<Utc> {
        wall - chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::weeks(5200))
    }

    /// One recording cycle: report liveness, capture, append, purge.
    ///
    /// # Errors
    ///
    /// Only if the safety monitor is gone. Store failures degrade to the
    /// in-memory fallback.
    pub async fn record_cycle(&mut self, wall: DateTime<Utc>) -> Result<HealthRecord, HealthError> {
        self.safety.report_alive(Subsystem::HealthRecorder).await?;
        let snapshot = self.safety.snapshot().await?;
        let mut record = self.capture(&snapshot, wall);

        match self.store.append(&record).await {
            Ok(()) => {
                if self.store_degraded {
                    info!("Health record store recovered");
                    self.store_degraded = false;
                }
            }
            Err(e) => {
                if !self.store_degraded {
                    warn!(error = %e, "Health record store failed, keeping records in memory");
                    self.store_degraded = true;
                }
                record.store_degraded = true;
                self.fallback.push_back(record.clone());
                while self.fallback.len() > self.fallback_capacity {
                    self.fallback.pop_front();
                }
            }
        }

        self.purge(wall).await;
        debug!(healthy = record.healthy, level = %record.alarm_level, "Health record captured");
        Ok(record)
    }

    fn capture(&mut self, snapshot: &SystemSnapshot, wall: DateTime<Utc>) -> HealthRecord {
        let metrics = self.monitor.refresh();
        if metrics.is_any_high() {
            warn!(
                memory_mb = metrics.memory_mb,
                cpu_percent = metrics.cpu_percent,
                "Daemon resource usage high"
            );
        }

        let healthy = is_healthy(snapshot.alarm_level, snapshot.subsystems.values());
        HealthRecord {
            timestamp: wall,
            overall_uptime_secs: snapshot.uptime_secs,
            subsystems: snapshot.subsystems.clone(),
            alarm_flag: snapshot.alarm_level > pvh_core::AlarmLevel::Normal,
            alarm_level: snapshot.alarm_level,
            healthy,
            summary: summarize(snapshot, healthy),
            memory_mb: metrics.memory_mb,
            cpu_percent: metrics.cpu_percent,
            store_degraded: false,
        }
    }

    async fn purge(&mut self, wall: DateTime<Utc>) {
        let cutoff = self.cutoff(wall);
        match self.store.purge_before(cutoff).await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Expired health records purged"),
            Err(e) => warn!(error = %e, "Health record purge failed"),
        }
        self.fallback.retain(|r| r.timestamp >= cutoff);
    }

    /// Up to `limit` records within the retention horizon, oldest first.
    pub async fn recent(&self, limit: usize, wall: DateTime<Utc>) -> Vec<HealthRecord> {
        let limit = limit.min(MAX_RECENT);
        let cutoff = self.cutoff(wall);

        let mut records = match self.store.recent(limit).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Health record store unreadable");
                Vec::new()
            }
        };
        records.extend(self.fallback.iter().cloned());
        records.retain(|r| r.timestamp >= cutoff);
        records.sort_by_key(|r| r.timestamp);

        let skip = records.len().saturating_sub(limit);
        records.split_off(skip)
    }

    /// Live verdict plus recent records.
    pub async fn report(&self, limit: Option<usize>) -> Result<HealthReport, HealthError> {
        let snapshot = self.safety.snapshot().await?;
        let healthy = is_healthy(snapshot.alarm_level, snapshot.subsystems.values());
        let records = self
            .recent(limit.unwrap_or(DEFAULT_RECENT), Utc::now())
            .await;

        Ok(HealthReport {
            healthy,
            alarm_level: snapshot.alarm_level,
            summary: summarize(&snapshot, healthy),
            subsystems: snapshot.subsystems,
            records,
        })
    }
}

/// One-line summary, e.g. `healthy: level normal, 5/5 subsystems fresh`.
pub fn summarize(snapshot: &SystemSnapshot, healthy: bool) -> String {
    let stale: Vec<&str> = snapshot
        .subsystems
        .iter()
        .filter(|(_, status)| !status.is_fresh())
        .map(|(name, _)| name.as_str())
        .collect();
    let total = snapshot.subsystems.len();
    let verdict = if healthy { "healthy" } else { "unhealthy" };

    if stale.is_empty() {
        format!(
            "{verdict}: level {}, {total}/{total} subsystems fresh",
            snapshot.alarm_level
        )
    } else {
        format!(
            "{verdict}: level {}, stale: {}",
            snapshot.alarm_level,
            stale.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::store::tests::record;
    use crate::health::store::MemoryStore;
    use pvh_core::{AlarmLevel, SubsystemStatus};
    use std::collections::BTreeMap;

    fn snapshot(level: AlarmLevel, ages_ms: &[(&str, u64)]) -> SystemSnapshot {
        SystemSnapshot {
            timestamp: Utc::now(),
            alarm_level: level,
            circuits: Vec::new(),
            tanks: Vec::new(),
            link: pvh_core::LinkState::Up,
            alarms: Vec::new(),
            sensors: Vec::new(),
            subsystems: ages_ms
                .iter()
                .map(|(name, age)| {
                    (
                        name.to_string(),
                        SubsystemStatus {
                            uptime_secs: 5,
                            last_report_age_ms: *age,
                            counter: 3,
                            expected_interval_ms: 1000,
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>(),
            uptime_secs: 5,
        }
    }

    #[test]
    fn test_summary_lists_stale_subsystems() {
        let s = snapshot(AlarmLevel::Warning, &[("sensor_hub", 100), ("thermostat", 2500)]);
        let healthy = is_healthy(s.alarm_level, s.subsystems.values());
        assert!(!healthy);
        assert_eq!(summarize(&s, healthy), "unhealthy: level warning, stale: thermostat");
    }

    #[test]
    fn test_summary_all_fresh() {
        let s = snapshot(AlarmLevel::Normal, &[("sensor_hub", 100), ("thermostat", 1999)]);
        assert_eq!(summarize(&s, true), "healthy: level normal, 2/2 subsystems fresh");
    }

    #[tokio::test]
    async fn test_expired_records_are_absent_from_queries() {
        let store = Arc::new(MemoryStore::new(100));
        store.append(&record(120)).await.unwrap();
        store.append(&record(30)).await.unwrap();

        let cancel = tokio_util::sync::CancellationToken::new();
        let (_tx, config) = tokio::sync::watch::channel(Arc::new(
            crate::config::DaemonConfig::from_toml_str(crate::config::tests::SAMPLE).unwrap(),
        ));
        let (safety, _outputs, _join) = crate::safety::spawn_safety_monitor(config, cancel.clone());

        let recorder = HealthRecorder::new(store, safety, Duration::from_secs(60), 10);
        let recent = recorder.recent(10, Utc::now()).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].summary, "age 30");
        cancel.cancel();
    }
}
