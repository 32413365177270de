use serde::Serialize;

use super::cpu::CpuHistoryEntry;
use super::histogram::LagHistogramSnapshot;

/// One aggregation window's metrics in the collector wire shape.
///
/// Memory figures are megabytes; `pcpu*` fields are percentages of the
/// latest CPU sample; `cpuHistory` carries the full window with ratios.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub start_time: i64,
    pub end_time: i64,
    pub memory: f64,
    pub memory_array_buffers: f64,
    pub memory_external: f64,
    pub memory_heap_used: f64,
    pub memory_heap_total: f64,
    pub new_sessions: u64,
    pub active_requests: usize,
    pub active_handles: usize,
    pub pct_evloop_block: f64,
    pub evloop_histogram: LagHistogramSnapshot,
    pub gc_major_duration: f64,
    pub gc_minor_duration: f64,
    pub gc_incremental_duration: f64,
    #[serde(rename = "gcWeakCBDuration")]
    pub gc_weak_cb_duration: f64,
    pub pcpu: f64,
    pub pcpu_user: f64,
    pub pcpu_system: f64,
    pub cpu_history: Vec<CpuHistoryEntry>,
}

/// Envelope the collector accepts.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsPayload {
    #[serde(rename = "systemMetrics")]
    pub system_metrics: Vec<SystemMetrics>,
}

impl MetricsPayload {
    pub fn single(metrics: SystemMetrics) -> Self {
        Self {
            system_metrics: vec![metrics],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metrics() -> SystemMetrics {
        SystemMetrics {
            start_time: 1_700_000_000_000,
            end_time: 1_700_000_020_000,
            memory: 120.5,
            memory_array_buffers: 1.0,
            memory_external: 2.0,
            memory_heap_used: 40.0,
            memory_heap_total: 64.0,
            new_sessions: 3,
            active_requests: 7,
            active_handles: 11,
            pct_evloop_block: 0.4,
            evloop_histogram: LagHistogramSnapshot::default(),
            gc_major_duration: 12.0,
            gc_minor_duration: 3.5,
            gc_incremental_duration: 0.0,
            gc_weak_cb_duration: 0.25,
            pcpu: 42.0,
            pcpu_user: 30.0,
            pcpu_system: 12.0,
            cpu_history: vec![],
        }
    }

    #[test]
    fn test_payload_wire_field_names() {
        let json = serde_json::to_value(MetricsPayload::single(sample_metrics()))
            .expect("serialize");

        let metrics = &json["systemMetrics"][0];
        assert_eq!(metrics["startTime"], 1_700_000_000_000i64);
        assert_eq!(metrics["endTime"], 1_700_000_020_000i64);
        assert_eq!(metrics["memory"], 120.5);
        assert_eq!(metrics["memoryArrayBuffers"], 1.0);
        assert_eq!(metrics["memoryHeapUsed"], 40.0);
        assert_eq!(metrics["newSessions"], 3);
        assert_eq!(metrics["activeRequests"], 7);
        assert_eq!(metrics["activeHandles"], 11);
        assert_eq!(metrics["pctEvloopBlock"], 0.4);
        assert_eq!(metrics["gcMajorDuration"], 12.0);
        assert_eq!(metrics["gcWeakCBDuration"], 0.25);
        assert_eq!(metrics["pcpu"], 42.0);
        assert_eq!(metrics["pcpuUser"], 30.0);
        assert_eq!(metrics["pcpuSystem"], 12.0);
        assert!(metrics["evloopHistogram"].is_object());
        assert!(metrics["cpuHistory"].is_array());
    }

    #[test]
    fn test_cpu_history_entry_field_names() {
        let mut metrics = sample_metrics();
        metrics.cpu_history.push(CpuHistoryEntry {
            time: 1_700_000_010_000,
            usage: 0.5,
            user: 0.4,
            sys: 0.1,
        });

        let json = serde_json::to_value(&metrics).expect("serialize");
        let entry = &json["cpuHistory"][0];
        assert_eq!(entry["time"], 1_700_000_010_000i64);
        assert_eq!(entry["usage"], 0.5);
        assert_eq!(entry["user"], 0.4);
        assert_eq!(entry["sys"], 0.1);
    }
}
