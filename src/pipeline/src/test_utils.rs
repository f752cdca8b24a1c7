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

//! Minimal nodes for exercising the framework: a counting source, a
//! pass-through relay and a collecting sink. They are also handy starting
//! points for node writers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fusionflow_common::blob::Blob;
use fusionflow_common::buffer::Buffer;
use fusionflow_common::error::FlowResult;
use fusionflow_common::state::State;
use parking_lot::Mutex;

use crate::event::EVENT_EOS;
use crate::node::{Node, NodeCore, NodeWorker, WorkerCtx};

/// How long pull-style workers wait for input per `process` round.
const PULL_TIMEOUT: Duration = Duration::from_millis(10);

/// Source emitting `total` numbered blobs round-robin across `stream_num`
/// streams, then EOS. Frame ids count up per stream from zero.
pub struct EmitterNode {
    core: NodeCore,
    total: u32,
    stream_num: u32,
    pacing: Duration,
    counter: AtomicU32,
}

impl EmitterNode {
    pub fn new(out_ports: usize, total: u32) -> Self {
        Self::with_threads(out_ports, total, 1)
    }

    pub fn with_threads(out_ports: usize, total: u32, threads: usize) -> Self {
        let node = Self {
            core: NodeCore::new(0, out_ports, threads),
            total,
            stream_num: 1,
            pacing: Duration::ZERO,
            counter: AtomicU32::new(0),
        };
        node.core
            .transit_state_to(State::Configured)
            .expect("fresh core accepts configuration");
        node
    }

    pub fn with_streams(mut self, stream_num: u32) -> Self {
        self.stream_num = stream_num.max(1);
        self
    }

    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }
}

impl Node for EmitterNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn class_name(&self) -> &str {
        "EmitterNode"
    }

    fn create_worker(self: Arc<Self>) -> Box<dyn NodeWorker> {
        Box::new(EmitterWorker { node: self })
    }

    fn rearm(&self) -> FlowResult<()> {
        self.counter.store(0, Ordering::SeqCst);
        Ok(())
    }
}

struct EmitterWorker {
    node: Arc<EmitterNode>,
}

impl NodeWorker for EmitterWorker {
    fn process(&mut self, ctx: &WorkerCtx, _batch_idx: usize) -> FlowResult<()> {
        if ctx.is_stopped() || self.node.core.state() != State::Running {
            ctx.break_process_loop();
            return Ok(());
        }
        let seq = self.node.counter.fetch_add(1, Ordering::SeqCst);
        if seq >= self.node.total {
            if seq == self.node.total {
                self.node.core.emit_event(EVENT_EOS, None)?;
            }
            ctx.break_process_loop();
            return Ok(());
        }

        let stream_id = seq % self.node.stream_num;
        let frame_id = seq / self.node.stream_num;
        let mut blob = Blob::with_ids(stream_id, frame_id);
        blob.push(Buffer::from_payload(seq, std::mem::size_of::<u32>()));
        let blob = blob.share();
        for port_idx in 0..self.node.core.out_port_num() {
            self.node
                .core
                .send_output(Arc::clone(&blob), port_idx, Duration::ZERO)?;
        }
        if self.node.pacing > Duration::ZERO {
            std::thread::sleep(self.node.pacing);
        }
        Ok(())
    }
}

/// Pass-through node copying every input blob from in-port 0 to every
/// out-port.
pub struct RelayNode {
    core: NodeCore,
}

impl RelayNode {
    pub fn new(out_ports: usize) -> Self {
        let node = Self {
            core: NodeCore::new(1, out_ports, 1),
        };
        node.core
            .transit_state_to(State::Configured)
            .expect("fresh core accepts configuration");
        node
    }
}

impl Node for RelayNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn class_name(&self) -> &str {
        "RelayNode"
    }

    fn create_worker(self: Arc<Self>) -> Box<dyn NodeWorker> {
        Box::new(RelayWorker { node: self })
    }
}

struct RelayWorker {
    node: Arc<RelayNode>,
}

impl NodeWorker for RelayWorker {
    fn process(&mut self, ctx: &WorkerCtx, batch_idx: usize) -> FlowResult<()> {
        let batch = self.node.core.get_batched_input(batch_idx, &[0], PULL_TIMEOUT);
        if batch.is_empty() {
            return Ok(());
        }
        // The popped blobs are in flight until forwarded; keep the node in
        // depleting so the drain check cannot complete under us.
        self.node.core.hold_depleting();
        let mut result = Ok(());
        'forward: for blob in batch {
            if ctx.is_stopped() {
                break;
            }
            for port_idx in 0..self.node.core.out_port_num() {
                if let Err(err) =
                    self.node
                        .core
                        .send_output(Arc::clone(&blob), port_idx, Duration::ZERO)
                {
                    result = Err(err);
                    break 'forward;
                }
            }
        }
        self.node.core.release_depleting();
        result
    }
}

/// One observation made by a collector worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub batch_idx: usize,
    pub stream_id: u32,
    pub frame_id: u32,
}

/// Sink recording every blob it pops, optionally sleeping per blob to
/// simulate a slow consumer.
pub struct CollectorNode {
    core: NodeCore,
    delay: Duration,
    seen: Arc<Mutex<Vec<Observation>>>,
}

impl CollectorNode {
    pub fn new(in_ports: usize) -> Self {
        let node = Self {
            core: NodeCore::new(in_ports, 0, 1),
            delay: Duration::ZERO,
            seen: Arc::new(Mutex::new(Vec::new())),
        };
        node.core
            .transit_state_to(State::Configured)
            .expect("fresh core accepts configuration");
        node
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Shared handle to the observations; survives the pipeline run.
    pub fn observations(&self) -> Arc<Mutex<Vec<Observation>>> {
        Arc::clone(&self.seen)
    }

    /// Frame ids observed so far, in observation order.
    pub fn frames(&self) -> Vec<u32> {
        self.seen.lock().iter().map(|o| o.frame_id).collect()
    }
}

impl Node for CollectorNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn class_name(&self) -> &str {
        "CollectorNode"
    }

    fn create_worker(self: Arc<Self>) -> Box<dyn NodeWorker> {
        Box::new(CollectorWorker { node: self })
    }
}

struct CollectorWorker {
    node: Arc<CollectorNode>,
}

impl NodeWorker for CollectorWorker {
    fn process(&mut self, ctx: &WorkerCtx, batch_idx: usize) -> FlowResult<()> {
        let ports: Vec<usize> = (0..self.node.core.in_port_num()).collect();
        let batch = self.node.core.get_batched_input(batch_idx, &ports, PULL_TIMEOUT);
        if batch.is_empty() {
            return Ok(());
        }
        ctx.latency().start_recording("collect");
        for blob in &batch {
            self.node.seen.lock().push(Observation {
                batch_idx,
                stream_id: blob.stream_id,
                frame_id: blob.frame_id,
            });
        }
        if self.node.delay > Duration::ZERO {
            std::thread::sleep(self.node.delay);
        }
        ctx.latency().stop_recording("collect");
        Ok(())
    }
}
