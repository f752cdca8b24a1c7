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

//! Batching policies: how a node's workers select input blobs across its
//! in-ports for one `process` invocation.

use std::collections::HashMap;
use std::sync::Arc;

use fusionflow_common::blob::Blob;
use parse_display::Display;

use crate::node::NodeCore;
use crate::port::InPort;

/// Strategy for selecting inputs across a node's in-ports.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default)]
#[display(style = "snake_case")]
pub enum BatchingPolicy {
    /// One blob per requested port, in port order, regardless of stream or
    /// frame id. The batch is empty unless every port can contribute.
    #[default]
    IgnoringStream,
    /// Shard streams across batch indices (`stream_id % batch_size`) and
    /// dispatch each stream's frames in strict succession.
    WithStream,
    /// Same sharding, but frame order within a stream is not enforced.
    WithStreamIgnoreOrder,
}

/// User-supplied replacement for the built-in policies. The algorithm is
/// responsible for its own waiting; the framework invokes it directly from
/// `get_batched_input` without taking the batching lock.
pub type BatchingAlgo = Arc<dyn Fn(usize, &[usize], &NodeCore) -> Vec<Arc<Blob>> + Send + Sync>;

/// A node's batching configuration.
#[derive(Clone, Default)]
pub struct BatchingConfig {
    pub policy: BatchingPolicy,
    /// Number of batch indices work is sharded over under the stream
    /// policies. Zero is treated as one.
    pub batch_size: usize,
    /// Declared number of distinct stream ids feeding the node.
    pub stream_num: usize,
    /// Worker threads cloned per batch index under the stream policies.
    pub threads_per_batch: usize,
    /// Custom batching algorithm overriding `policy` when set.
    pub algo: Option<BatchingAlgo>,
}

impl BatchingConfig {
    pub fn with_stream(batch_size: usize, stream_num: usize) -> Self {
        Self {
            policy: BatchingPolicy::WithStream,
            batch_size,
            stream_num,
            threads_per_batch: 1,
            algo: None,
        }
    }

    pub(crate) fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

impl std::fmt::Debug for BatchingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchingConfig")
            .field("policy", &self.policy)
            .field("batch_size", &self.batch_size)
            .field("stream_num", &self.stream_num)
            .field("threads_per_batch", &self.threads_per_batch)
            .field("custom_algo", &self.algo.is_some())
            .finish()
    }
}

/// Mutable inter-worker coordination state guarded by the node's batching
/// mutex.
#[derive(Default)]
pub(crate) struct BatchingState {
    pub stopped: bool,
    /// Per-stream last dispatched frame id; drives the strict succession
    /// check of [`BatchingPolicy::WithStream`]. A stream absent from the
    /// map is dispatched at whatever frame id arrives first.
    pub last_frame: HashMap<u32, u32>,
}

impl BatchingState {
    pub fn reset(&mut self) {
        self.stopped = false;
        self.last_frame.clear();
    }
}

/// One collection attempt under the node's batching lock. Returns `None`
/// when no complete batch is available; never consumes part of a batch.
pub(crate) fn try_collect(
    config: &BatchingConfig,
    batch_idx: usize,
    in_ports: &[Arc<InPort>],
    port_indices: &[usize],
    state: &mut BatchingState,
) -> Option<Vec<Arc<Blob>>> {
    let eligible = |blob: &Blob| -> bool {
        blob.stream_id as usize % config.effective_batch_size() == batch_idx
    };
    let in_order = |blob: &Blob, state: &BatchingState| -> bool {
        match state.last_frame.get(&blob.stream_id) {
            Some(last) => blob.frame_id == last.wrapping_add(1),
            None => true,
        }
    };

    // Peek phase: every requested port must be able to contribute before
    // anything is consumed.
    let mut picks: Vec<(usize, Arc<Blob>)> = Vec::with_capacity(port_indices.len());
    for &idx in port_indices {
        let port = in_ports.get(idx)?;
        let pick = match config.policy {
            BatchingPolicy::IgnoringStream => port.front(),
            BatchingPolicy::WithStream => {
                port.find_matching(|blob| eligible(blob) && in_order(blob, state))
            }
            BatchingPolicy::WithStreamIgnoreOrder => port.find_matching(eligible),
        };
        picks.push((idx, pick?));
    }

    // Take phase: remove exactly the peeked blobs. Ports are only drained
    // by batching under this same lock, so the picks are still present.
    let mut batch = Vec::with_capacity(picks.len());
    for (idx, pick) in picks {
        let taken = in_ports[idx]
            .take_matching(|blob| std::ptr::eq(blob, pick.as_ref()))
            .expect("peeked blob vanished under the batching lock");
        state.last_frame.insert(taken.stream_id, taken.frame_id);
        batch.push(taken);
    }
    Some(batch)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn port_with(blobs: &[(u32, u32)]) -> Arc<InPort> {
        let port = Arc::new(InPort::with_capacity(64));
        for &(stream, frame) in blobs {
            port.push(Blob::with_ids(stream, frame).share(), Duration::from_millis(1))
                .unwrap();
        }
        port
    }

    #[test]
    fn test_ignoring_stream_needs_all_ports() {
        let ports = vec![port_with(&[(0, 0)]), port_with(&[])];
        let cfg = BatchingConfig::default();
        let mut state = BatchingState::default();

        assert!(try_collect(&cfg, 0, &ports, &[0, 1], &mut state).is_none());
        // Nothing was consumed by the failed attempt.
        assert_eq!(ports[0].len(), 1);

        ports[1]
            .push(Blob::with_ids(0, 0).share(), Duration::from_millis(1))
            .unwrap();
        let batch = try_collect(&cfg, 0, &ports, &[0, 1], &mut state).unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_with_stream_shards_by_batch_index() {
        let ports = vec![port_with(&[(0, 0), (1, 0), (2, 0), (3, 0)])];
        let cfg = BatchingConfig::with_stream(2, 4);
        let mut state = BatchingState::default();

        let first = try_collect(&cfg, 0, &ports, &[0], &mut state).unwrap();
        assert_eq!(first[0].stream_id % 2, 0);
        let second = try_collect(&cfg, 1, &ports, &[0], &mut state).unwrap();
        assert_eq!(second[0].stream_id % 2, 1);
    }

    #[test]
    fn test_with_stream_enforces_frame_succession() {
        // Frame 1 of stream 0 arrives before frame 0 finished dispatching.
        let ports = vec![port_with(&[(0, 0)])];
        let cfg = BatchingConfig::with_stream(1, 1);
        let mut state = BatchingState::default();

        let batch = try_collect(&cfg, 0, &ports, &[0], &mut state).unwrap();
        assert_eq!(batch[0].frame_id, 0);

        // Frame 2 queued while frame 1 is missing: no dispatch.
        ports[0]
            .push(Blob::with_ids(0, 2).share(), Duration::from_millis(1))
            .unwrap();
        assert!(try_collect(&cfg, 0, &ports, &[0], &mut state).is_none());

        ports[0]
            .push(Blob::with_ids(0, 1).share(), Duration::from_millis(1))
            .unwrap();
        let batch = try_collect(&cfg, 0, &ports, &[0], &mut state).unwrap();
        assert_eq!(batch[0].frame_id, 1);
        let batch = try_collect(&cfg, 0, &ports, &[0], &mut state).unwrap();
        assert_eq!(batch[0].frame_id, 2);
    }

    #[test]
    fn test_first_seen_stream_accepts_any_frame() {
        let ports = vec![port_with(&[(0, 5)])];
        let cfg = BatchingConfig::with_stream(1, 1);
        let mut state = BatchingState::default();

        let batch = try_collect(&cfg, 0, &ports, &[0], &mut state).unwrap();
        assert_eq!(batch[0].frame_id, 5);
        assert_eq!(state.last_frame[&0], 5);
    }

    #[test]
    fn test_ignore_order_skips_gaps() {
        let ports = vec![port_with(&[(0, 3), (0, 1)])];
        let cfg = BatchingConfig {
            policy: BatchingPolicy::WithStreamIgnoreOrder,
            batch_size: 1,
            stream_num: 1,
            threads_per_batch: 1,
            algo: None,
        };
        let mut state = BatchingState::default();

        let frames: Vec<u32> = (0..2)
            .map(|_| try_collect(&cfg, 0, &ports, &[0], &mut state).unwrap()[0].frame_id)
            .collect();
        assert_eq!(frames, [3, 1]);
    }
}
