// Copyright 2025 FusionFlow Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Performance monitoring: prometheus counters for the hot paths, rolling
//! latency/throughput tracking per worker, and the pipeline-level frame
//! latency and timestamp recorders fed by the monitoring events.

use std::any::Any;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fusionflow_common::monitor::GLOBAL_METRICS_REGISTRY;
use parking_lot::Mutex;
use prometheus::core::{AtomicI64, AtomicU64, GenericCounterVec, GenericGaugeVec};
use prometheus::{
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry, Registry,
};
use serde::Serialize;

use crate::event::EventListener;

/// Prometheus collectors shared by every pipeline in the process,
/// registered once against the global registry. Labels distinguish nodes,
/// ports and workers.
pub struct PipelineMetrics {
    pub blob_enqueued_total: GenericCounterVec<AtomicU64>,
    pub blob_discarded_total: GenericCounterVec<AtomicU64>,
    pub queue_depth: GenericGaugeVec<AtomicI64>,
    pub worker_process_total: GenericCounterVec<AtomicU64>,
}

pub static GLOBAL_PIPELINE_METRICS: LazyLock<PipelineMetrics> =
    LazyLock::new(|| PipelineMetrics::new(&GLOBAL_METRICS_REGISTRY));

impl PipelineMetrics {
    fn new(registry: &Registry) -> Self {
        let blob_enqueued_total = register_int_counter_vec_with_registry!(
            "port_blob_enqueued_total",
            "Total number of blobs enqueued on an in-port",
            &["node", "port"],
            registry
        )
        .unwrap();
        let blob_discarded_total = register_int_counter_vec_with_registry!(
            "port_blob_discarded_total",
            "Total number of blobs dropped by the discard-if-full policy",
            &["node", "port"],
            registry
        )
        .unwrap();
        let queue_depth = register_int_gauge_vec_with_registry!(
            "port_queue_depth",
            "Current number of blobs queued on an in-port",
            &["node", "port"],
            registry
        )
        .unwrap();
        let worker_process_total = register_int_counter_vec_with_registry!(
            "worker_process_total",
            "Number of completed process invocations per worker",
            &["worker"],
            registry
        )
        .unwrap();
        Self {
            blob_enqueued_total,
            blob_discarded_total,
            queue_depth,
            worker_process_total,
        }
    }

    /// Resolve the per-port handles for an in-port of `node`.
    pub fn for_port(&self, node: &str, port_idx: usize) -> PortMetrics {
        let port = port_idx.to_string();
        PortMetrics {
            enqueued: self.blob_enqueued_total.with_label_values(&[node, &port]),
            discarded: self.blob_discarded_total.with_label_values(&[node, &port]),
            depth: self.queue_depth.with_label_values(&[node, &port]),
        }
    }
}

/// Pre-resolved collectors bound to one in-port.
pub struct PortMetrics {
    enqueued: prometheus::core::GenericCounter<AtomicU64>,
    discarded: prometheus::core::GenericCounter<AtomicU64>,
    depth: prometheus::core::GenericGauge<AtomicI64>,
}

impl PortMetrics {
    pub(crate) fn on_enqueue(&self, depth: usize) {
        self.enqueued.inc();
        self.depth.set(depth as i64);
    }

    pub(crate) fn on_dequeue(&self, depth: usize) {
        self.depth.set(depth as i64);
    }

    pub(crate) fn on_discard(&self) {
        self.discarded.inc();
    }
}

/// Rolling latency/throughput aggregates for one named track.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LatencyInfo {
    /// Average duration between `start_recording` and `stop_recording`, ms.
    pub avg_latency_ms: f32,
    /// Completed recordings per second since the first start.
    pub avg_throughput: f32,
    pub process_cnt: usize,
}

#[derive(Default)]
struct LatencyTrack {
    started_at: Option<Instant>,
    first_start: Option<Instant>,
    last_stop: Option<Instant>,
    total: Duration,
    count: usize,
}

/// Per-worker latency monitor. Workers bracket a unit of work with
/// [`start_recording`](Self::start_recording) /
/// [`stop_recording`](Self::stop_recording) under a free-form track name,
/// typically one per out-port plus the framework's own `process` track.
#[derive(Default)]
pub struct NodeLatencyMonitor {
    tracks: Mutex<HashMap<String, LatencyTrack>>,
}

impl NodeLatencyMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_recording(&self, name: &str) {
        let mut tracks = self.tracks.lock();
        let track = tracks.entry(name.to_owned()).or_default();
        let now = Instant::now();
        track.started_at = Some(now);
        track.first_start.get_or_insert(now);
    }

    /// Close the currently open recording on `name`; without a matching
    /// start this is a no-op.
    pub fn stop_recording(&self, name: &str) {
        let mut tracks = self.tracks.lock();
        let Some(track) = tracks.get_mut(name) else {
            return;
        };
        let Some(started_at) = track.started_at.take() else {
            return;
        };
        let now = Instant::now();
        track.total += now - started_at;
        track.last_stop = Some(now);
        track.count += 1;
    }

    pub fn snapshot(&self) -> HashMap<String, LatencyInfo> {
        let tracks = self.tracks.lock();
        tracks
            .iter()
            .filter(|(_, t)| t.count > 0)
            .map(|(name, t)| {
                let avg_latency_ms = t.total.as_secs_f32() * 1e3 / t.count as f32;
                let span = match (t.first_start, t.last_stop) {
                    (Some(first), Some(last)) => (last - first).as_secs_f32(),
                    _ => 0.0,
                };
                let avg_throughput = if span > 0.0 {
                    t.count as f32 / span
                } else {
                    0.0
                };
                (
                    name.clone(),
                    LatencyInfo {
                        avg_latency_ms,
                        avg_throughput,
                        process_cnt: t.count,
                    },
                )
            })
            .collect()
    }

    pub fn reset(&self) {
        self.tracks.lock().clear();
    }
}

/// The per-executor per-worker performance record exported by
/// [`Pipeline::performance_data`](crate::pipeline::Pipeline::performance_data).
#[derive(Debug, Clone, Serialize, Default)]
pub struct NodePerfData {
    #[serde(rename = "avgThroughput")]
    pub avg_throughputs: HashMap<String, f32>,
    #[serde(rename = "avgLatency")]
    pub avg_latencies: HashMap<String, f32>,
    #[serde(rename = "processCnt")]
    pub process_cnt: usize,
}

impl NodePerfData {
    pub fn from_latency_snapshot(snapshot: &HashMap<String, LatencyInfo>) -> Self {
        let mut data = NodePerfData::default();
        for (name, info) in snapshot {
            data.avg_throughputs.insert(name.clone(), info.avg_throughput);
            data.avg_latencies.insert(name.clone(), info.avg_latency_ms);
            data.process_cnt = data.process_cnt.max(info.process_cnt);
        }
        data
    }
}

/// One timestamp sample recorded through the timestamp-record event.
#[derive(Debug, Clone, Serialize)]
pub struct TimeStampInfo {
    pub frame_id: u32,
    pub name: String,
    /// Milliseconds since the unix epoch, stamped at record time.
    pub timestamp_ms: i64,
}

impl TimeStampInfo {
    pub fn new(frame_id: u32, name: impl Into<String>) -> Self {
        Self {
            frame_id,
            name: name.into(),
            timestamp_ms: 0,
        }
    }
}

/// Pipeline-level frame latency and timestamp recorder.
///
/// Frame latency works in open/close pairs: the first latency-capture
/// event for a frame id opens the measurement, the second closes it and
/// folds the elapsed time into the running average.
#[derive(Default)]
pub struct PipelinePerformanceMonitor {
    open_frames: Mutex<HashMap<u32, Instant>>,
    aggregate: Mutex<(f32, usize)>,
    timestamps: Mutex<HashMap<u32, Vec<TimeStampInfo>>>,
}

impl PipelinePerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_latency(&self, frame_id: u32) {
        let mut open = self.open_frames.lock();
        match open.remove(&frame_id) {
            None => {
                open.insert(frame_id, Instant::now());
            }
            Some(started_at) => {
                let sample_ms = started_at.elapsed().as_secs_f32() * 1e3;
                let mut agg = self.aggregate.lock();
                let (avg, cnt) = *agg;
                let cnt = cnt + 1;
                *agg = (avg + (sample_ms - avg) / cnt as f32, cnt);
            }
        }
    }

    pub fn record_timestamp(&self, mut info: TimeStampInfo) {
        info.timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        self.timestamps
            .lock()
            .entry(info.frame_id)
            .or_default()
            .push(info);
    }

    pub fn avg_latency_ms(&self) -> f32 {
        self.aggregate.lock().0
    }

    pub fn process_cnt(&self) -> usize {
        self.aggregate.lock().1
    }

    pub fn timestamps(&self) -> HashMap<u32, Vec<TimeStampInfo>> {
        self.timestamps.lock().clone()
    }

    pub fn reset(&self) {
        self.open_frames.lock().clear();
        *self.aggregate.lock() = (0.0, 0);
        self.timestamps.lock().clear();
    }
}

/// Listener wired to the latency-capture event; expects a `u32` frame id
/// as event data.
pub(crate) struct LatencyCaptureListener {
    pub monitor: std::sync::Arc<PipelinePerformanceMonitor>,
}

impl EventListener for LatencyCaptureListener {
    fn on_event(&self, data: Option<&(dyn Any + Send + Sync)>) -> bool {
        match data.and_then(|d| d.downcast_ref::<u32>()) {
            Some(frame_id) => {
                self.monitor.record_latency(*frame_id);
                true
            }
            None => false,
        }
    }
}

/// Listener wired to the timestamp-record event; expects a
/// [`TimeStampInfo`] as event data.
pub(crate) struct TimeStampRecordListener {
    pub monitor: std::sync::Arc<PipelinePerformanceMonitor>,
}

impl EventListener for TimeStampRecordListener {
    fn on_event(&self, data: Option<&(dyn Any + Send + Sync)>) -> bool {
        match data.and_then(|d| d.downcast_ref::<TimeStampInfo>()) {
            Some(info) => {
                self.monitor.record_timestamp(info.clone());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_latency_monitor_counts_and_averages() {
        let monitor = NodeLatencyMonitor::new();
        for _ in 0..3 {
            monitor.start_recording("process");
            thread::sleep(Duration::from_millis(2));
            monitor.stop_recording("process");
        }
        let snapshot = monitor.snapshot();
        let info = &snapshot["process"];
        assert_eq!(info.process_cnt, 3);
        assert!(info.avg_latency_ms >= 2.0);
    }

    #[test]
    fn test_unmatched_stop_is_ignored() {
        let monitor = NodeLatencyMonitor::new();
        monitor.stop_recording("nothing");
        assert!(monitor.snapshot().is_empty());
    }

    #[test]
    fn test_pipeline_latency_pairs() {
        let monitor = PipelinePerformanceMonitor::new();
        monitor.record_latency(9);
        thread::sleep(Duration::from_millis(3));
        monitor.record_latency(9);
        assert_eq!(monitor.process_cnt(), 1);
        assert!(monitor.avg_latency_ms() >= 3.0);
    }

    #[test]
    fn test_timestamps_grouped_by_frame() {
        let monitor = PipelinePerformanceMonitor::new();
        monitor.record_timestamp(TimeStampInfo::new(1, "decode"));
        monitor.record_timestamp(TimeStampInfo::new(1, "infer"));
        monitor.record_timestamp(TimeStampInfo::new(2, "decode"));

        let stamps = monitor.timestamps();
        assert_eq!(stamps[&1].len(), 2);
        assert_eq!(stamps[&2].len(), 1);
        assert!(stamps[&1][0].timestamp_ms > 0);
    }

    #[test]
    fn test_perf_data_serializes_to_wire_names() {
        let mut snapshot = HashMap::new();
        snapshot.insert(
            "out0".to_owned(),
            LatencyInfo {
                avg_latency_ms: 1.5,
                avg_throughput: 30.0,
                process_cnt: 45,
            },
        );
        let data = NodePerfData::from_latency_snapshot(&snapshot);
        let json = serde_json::to_value(&data).unwrap();
        assert!(json.get("avgThroughput").is_some());
        assert!(json.get("avgLatency").is_some());
        assert_eq!(json["processCnt"], 45);
    }
}
