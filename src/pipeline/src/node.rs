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

//! Nodes and node workers.
//!
//! A [`Node`] is the topology vertex: it owns ports, the batching
//! configuration and everything its workers share. A [`NodeWorker`] is one
//! execution context spawned from a node; all workers of a node share the
//! node's state but nothing of each other's. Node implementations embed a
//! [`NodeCore`] and delegate the framework surface to it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use fusionflow_common::blob::Blob;
use fusionflow_common::error::{FlowError, FlowResult};
use fusionflow_common::state::{State, StateCell};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::batching::{self, BatchingConfig, BatchingState};
use crate::event::{Event, EventData, EventListener, EventManager};
use crate::monitor::NodeLatencyMonitor;
use crate::port::{InPort, OutPort, WakeBatching};

/// Inter-worker batching coordination: one mutex/condvar pair per node.
pub(crate) struct BatchingCtl {
    pub(crate) state: Mutex<BatchingState>,
    pub(crate) cond: Condvar,
}

impl WakeBatching for BatchingCtl {
    fn wake(&self) {
        // Take and release the lock before notifying; otherwise a push
        // landing between a waiter's check and its wait is missed.
        drop(self.state.lock());
        self.cond.notify_all();
    }
}

/// The framework-owned half of every node: ports, batching, lifecycle
/// state, event access and the depleting-hold counter.
pub struct NodeCore {
    in_ports: Vec<Arc<InPort>>,
    out_ports: Vec<Arc<OutPort>>,
    thread_num: usize,
    batching: RwLock<BatchingConfig>,
    batching_ctl: Arc<BatchingCtl>,
    looping_interval: RwLock<Duration>,
    state: StateCell,
    event_manager: OnceLock<Arc<EventManager>>,
    /// Listeners queued by `register_callback` until the pipeline installs
    /// them into its event manager at prepare time.
    callbacks: Mutex<Vec<(Event, Arc<dyn EventListener>)>>,
    config_string: Mutex<String>,
    depleting_hold: AtomicUsize,
}

impl NodeCore {
    /// Create a core with the given port counts and worker thread count.
    /// Ports may be left unconnected.
    pub fn new(in_port_num: usize, out_port_num: usize, thread_num: usize) -> Self {
        let batching_ctl = Arc::new(BatchingCtl {
            state: Mutex::new(BatchingState::default()),
            cond: Condvar::new(),
        });
        let wake: Weak<dyn WakeBatching> =
            Arc::downgrade(&(Arc::clone(&batching_ctl) as Arc<dyn WakeBatching>));
        let in_ports = (0..in_port_num)
            .map(|_| {
                let port = Arc::new(InPort::new());
                port.install_wake_hook(wake.clone());
                port
            })
            .collect();
        let out_ports = (0..out_port_num).map(|_| Arc::new(OutPort::new())).collect();
        Self {
            in_ports,
            out_ports,
            thread_num: thread_num.max(1),
            batching: RwLock::new(BatchingConfig::default()),
            batching_ctl,
            looping_interval: RwLock::new(Duration::ZERO),
            state: StateCell::default(),
            event_manager: OnceLock::new(),
            callbacks: Mutex::new(Vec::new()),
            config_string: Mutex::new(String::new()),
            depleting_hold: AtomicUsize::new(0),
        }
    }

    pub fn in_port_num(&self) -> usize {
        self.in_ports.len()
    }

    pub fn out_port_num(&self) -> usize {
        self.out_ports.len()
    }

    pub fn in_port(&self, idx: usize) -> FlowResult<&Arc<InPort>> {
        self.in_ports
            .get(idx)
            .ok_or_else(|| FlowError::failure(format!("in-port index {idx} out of range")))
    }

    pub fn out_port(&self, idx: usize) -> FlowResult<&Arc<OutPort>> {
        self.out_ports
            .get(idx)
            .ok_or_else(|| FlowError::failure(format!("out-port index {idx} out of range")))
    }

    pub(crate) fn in_ports(&self) -> &[Arc<InPort>] {
        &self.in_ports
    }

    pub fn thread_num(&self) -> usize {
        self.thread_num
    }

    pub fn config_batch(&self, config: BatchingConfig) {
        *self.batching.write() = config;
    }

    pub fn batching_config(&self) -> BatchingConfig {
        self.batching.read().clone()
    }

    /// Interval between successive `process` calls of this node's workers.
    /// Zero (the default) lets workers free-wheel or block inside
    /// `get_batched_input`.
    pub fn config_looping_interval(&self, interval: Duration) {
        *self.looping_interval.write() = interval;
    }

    pub fn looping_interval(&self) -> Duration {
        *self.looping_interval.read()
    }

    /// Pull one batch of inputs for `batch_idx` across `port_indices`.
    ///
    /// Blocks on the node's batching condition variable until a complete
    /// batch is available, `timeout` elapses (`Duration::ZERO` waits
    /// indefinitely), or batching is stopped; the latter two return an
    /// empty vector so workers can observe state transitions.
    pub fn get_batched_input(
        &self,
        batch_idx: usize,
        port_indices: &[usize],
        timeout: Duration,
    ) -> Vec<Arc<Blob>> {
        if port_indices.iter().any(|&idx| idx >= self.in_ports.len()) {
            tracing::warn!(?port_indices, "batched input requested on unknown port");
            return Vec::new();
        }
        let config = self.batching.read().clone();
        if let Some(algo) = &config.algo {
            return algo(batch_idx, port_indices, self);
        }

        let deadline = (timeout > Duration::ZERO).then(|| Instant::now() + timeout);
        let mut state = self.batching_ctl.state.lock();
        loop {
            if state.stopped || self.state.is(State::Stop) {
                return Vec::new();
            }
            if let Some(batch) =
                batching::try_collect(&config, batch_idx, &self.in_ports, port_indices, &mut state)
            {
                return batch;
            }
            match deadline {
                None => self.batching_ctl.cond.wait(&mut state),
                Some(deadline) => {
                    if self
                        .batching_ctl
                        .cond
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return Vec::new();
                    }
                }
            }
        }
    }

    /// Forward `blob` to every in-port linked downstream of out-port
    /// `port_idx`, applying the link's conversion function when installed.
    pub fn send_output(
        &self,
        blob: Arc<Blob>,
        port_idx: usize,
        timeout: Duration,
    ) -> FlowResult<()> {
        self.out_port(port_idx)?.send(blob, timeout)
    }

    /// Synchronously dispatch `event` through the owning pipeline's event
    /// manager.
    pub fn emit_event(&self, event: Event, data: EventData<'_>) -> FlowResult<()> {
        self.event_manager()?.emit_event(event, data)
    }

    fn event_manager(&self) -> FlowResult<&Arc<EventManager>> {
        self.event_manager.get().ok_or(FlowError::NotReady {
            current: self.state.get(),
            required: State::Configured,
        })
    }

    pub(crate) fn attach_event_manager(&self, manager: Arc<EventManager>) {
        let _ = self.event_manager.set(manager);
    }

    /// Queue a listener for `event`; the pipeline installs queued listeners
    /// into its event manager during prepare.
    pub fn register_callback(&self, event: Event, listener: Arc<dyn EventListener>) {
        self.callbacks.lock().push((event, listener));
    }

    pub(crate) fn take_callbacks(&self) -> Vec<(Event, Arc<dyn EventListener>)> {
        std::mem::take(&mut *self.callbacks.lock())
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    /// Controlled transition of the node and its ports.
    ///
    /// Ports follow the node on a best-effort basis: a port whose state
    /// cannot take the same edge (it may still be idle while the node is
    /// configured by its constructor) is left for the pipeline to advance
    /// during prepare.
    pub fn transit_state_to(&self, state: State) -> FlowResult<()> {
        self.state.transit_to(state)?;
        for port in &self.in_ports {
            let _ = port.transit_state_to(state);
        }
        if state == State::Stop {
            self.stop_batching();
        }
        Ok(())
    }

    /// Force the node, its ports and its batching into stop; queued blobs
    /// are cleared and every waiter is woken.
    pub fn transit_state_to_stop_forced(&self) {
        self.state.force_stop();
        self.stop_batching();
        for port in &self.in_ports {
            port.transit_state_to_stop_forced();
            port.clear();
        }
    }

    /// Drop all blobs cached in this node's in-ports.
    pub fn clear_all_ports(&self) {
        for port in &self.in_ports {
            port.clear();
        }
    }

    /// Make every pending and future `get_batched_input` return empty.
    pub fn stop_batching(&self) {
        self.batching_ctl.state.lock().stopped = true;
        self.batching_ctl.cond.notify_all();
    }

    pub fn turn_on_batching(&self) {
        self.batching_ctl.state.lock().stopped = false;
    }

    pub fn wakeup_batching(&self) {
        self.batching_ctl.wake();
    }

    /// Keep the node in depleting while an outstanding asynchronous
    /// callback is in flight. Pair every hold with a release.
    pub fn hold_depleting(&self) {
        self.depleting_hold.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release_depleting(&self) {
        let prev = self.depleting_hold.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            v.checked_sub(1)
        });
        if prev.is_err() {
            tracing::warn!("release_depleting without matching hold");
        }
    }

    pub fn depleting_holds(&self) -> usize {
        self.depleting_hold.load(Ordering::SeqCst)
    }

    /// Whether this node has fully drained: all in-port queues empty and
    /// no depleting hold outstanding.
    pub fn deplete(&self) -> bool {
        self.depleting_holds() == 0 && self.in_ports.iter().all(|port| port.is_empty())
    }

    pub fn save_config_string(&self, config: &str) {
        let mut saved = self.config_string.lock();
        if saved.is_empty() {
            *saved = config.to_owned();
        } else {
            saved.push(' ');
            saved.push_str(config);
        }
    }

    pub fn config_string(&self) -> String {
        self.config_string.lock().clone()
    }

    /// Restore the core for another run from the stop state: queues
    /// cleared, batching re-enabled, holds dropped, state back to prepared.
    pub(crate) fn rearm_core(&self) -> FlowResult<()> {
        for port in &self.in_ports {
            port.clear();
            port.transit_state_to(State::Prepared)?;
        }
        self.batching_ctl.state.lock().reset();
        self.depleting_hold.store(0, Ordering::SeqCst);
        self.state.transit_to(State::Prepared)
    }
}

/// The topology vertex. Implementations embed a [`NodeCore`] and spawn
/// their worker type from `create_worker`.
pub trait Node: Send + Sync {
    /// The framework-owned half of this node.
    fn core(&self) -> &NodeCore;

    /// Human-readable class name shared by all instances; used by the node
    /// registry and for worker naming.
    fn class_name(&self) -> &str;

    /// Construct one worker bound to this node. Called once per worker
    /// thread while the pipeline prepares.
    fn create_worker(self: Arc<Self>) -> Box<dyn NodeWorker>;

    /// Receive a configuration string from the application. May be called
    /// several times; once the node holds its minimum configuration it
    /// must reach the configured state.
    fn configure_by_string(&self, config: &str) -> FlowResult<()> {
        self.core().save_config_string(config);
        self.core().transit_state_to(State::Configured)
    }

    /// Called at pipeline prepare to check the node received everything it
    /// needs. The default accepts any node that reached configured.
    fn validate_configuration(&self) -> FlowResult<()> {
        let current = self.core().state();
        if current >= State::Configured {
            Ok(())
        } else {
            Err(FlowError::NotReady {
                current,
                required: State::Configured,
            })
        }
    }

    /// Allocate whatever the node needs before running. Invoked by the
    /// pipeline, in topological order, during prepare.
    fn prepare(&self) -> FlowResult<()> {
        Ok(())
    }

    /// Restore node-internal state for pipeline reuse. The framework has
    /// already reset the embedded core when this runs.
    fn rearm(&self) -> FlowResult<()> {
        Ok(())
    }

    /// Reset node-internal state without a lifecycle change.
    fn reset(&self) -> FlowResult<()> {
        Ok(())
    }

    /// Last call before the pipeline stops; must not fail.
    fn finalize(&self) {}
}

/// Per-worker context owned by the framework: lifecycle state, the
/// internal stop flag and the latency monitor.
pub struct WorkerCtx {
    name: String,
    state: StateCell,
    stop: AtomicBool,
    latency: NodeLatencyMonitor,
}

impl WorkerCtx {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            state: StateCell::default(),
            stop: AtomicBool::new(false),
            latency: NodeLatencyMonitor::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    /// Workers must re-check this after every blocking call and bail out
    /// when it reports true.
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.state.get() == State::Stop
    }

    /// Ask the executor to stop driving this worker after the current
    /// `process` returns.
    pub fn break_process_loop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn latency(&self) -> &NodeLatencyMonitor {
        &self.latency
    }

    pub(crate) fn transit_state_to(&self, state: State) -> FlowResult<()> {
        self.state.transit_to(state)
    }

    pub(crate) fn transit_state_to_stop_forced(&self) {
        self.state.force_stop();
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn clear_stop(&self) {
        self.stop.store(false, Ordering::Release);
    }

    pub(crate) fn stop_flag(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// One thread of execution spawned from a node.
///
/// Lifecycle: `init` once, `process_first_run` once, `process` repeatedly
/// while the worker is running or depleting, `process_last_run` once after
/// the loop exits, `deinit` once at the end. A worker must not block
/// indefinitely outside the framework without checking
/// [`WorkerCtx::is_stopped`].
pub trait NodeWorker: Send {
    /// The main workload. A flow-control error (`Timeout`, `EndOfStream`)
    /// is treated as an idle round; any other error is fatal to the worker
    /// and force-stops the pipeline.
    fn process(&mut self, ctx: &WorkerCtx, batch_idx: usize) -> FlowResult<()>;

    fn init(&mut self, _ctx: &WorkerCtx) {}

    fn process_first_run(&mut self, _ctx: &WorkerCtx, _batch_idx: usize) {}

    fn process_last_run(&mut self, _ctx: &WorkerCtx, _batch_idx: usize) {}

    fn deinit(&mut self, _ctx: &WorkerCtx) {}

    /// Restore worker-internal state for pipeline reuse.
    fn rearm(&mut self) -> FlowResult<()> {
        Ok(())
    }

    fn reset(&mut self) -> FlowResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_batched_input_ignoring_stream() {
        let core = NodeCore::new(2, 0, 1);
        core.in_port(0)
            .unwrap()
            .push(Blob::with_ids(0, 0).share(), Duration::from_millis(1))
            .unwrap();
        // One empty port: batch not available, bounded wait returns empty.
        let batch = core.get_batched_input(0, &[0, 1], Duration::from_millis(10));
        assert!(batch.is_empty());

        core.in_port(1)
            .unwrap()
            .push(Blob::with_ids(0, 0).share(), Duration::from_millis(1))
            .unwrap();
        let batch = core.get_batched_input(0, &[0, 1], Duration::from_millis(10));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_push_wakes_blocked_batching() {
        let core = Arc::new(NodeCore::new(1, 0, 1));
        let waiter = {
            let core = Arc::clone(&core);
            thread::spawn(move || core.get_batched_input(0, &[0], Duration::ZERO))
        };
        thread::sleep(Duration::from_millis(20));
        core.in_port(0)
            .unwrap()
            .push(Blob::with_ids(3, 9).share(), Duration::from_millis(1))
            .unwrap();
        let batch = waiter.join().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].stream_id, 3);
    }

    #[test]
    fn test_stop_batching_releases_waiters_empty() {
        let core = Arc::new(NodeCore::new(1, 0, 1));
        let waiter = {
            let core = Arc::clone(&core);
            thread::spawn(move || core.get_batched_input(0, &[0], Duration::ZERO))
        };
        thread::sleep(Duration::from_millis(20));
        core.stop_batching();
        assert!(waiter.join().unwrap().is_empty());
    }

    #[test]
    fn test_depleting_holds_gate_drain() {
        let core = NodeCore::new(1, 0, 1);
        assert!(core.deplete());
        core.hold_depleting();
        core.hold_depleting();
        assert!(!core.deplete());
        core.release_depleting();
        core.release_depleting();
        assert!(core.deplete());
        // Unbalanced release is tolerated.
        core.release_depleting();
        assert_eq!(core.depleting_holds(), 0);
    }

    #[test]
    fn test_forced_stop_clears_queues() {
        let core = NodeCore::new(1, 0, 1);
        core.in_port(0)
            .unwrap()
            .push(Blob::with_ids(0, 0).share(), Duration::from_millis(1))
            .unwrap();
        core.transit_state_to_stop_forced();
        assert_eq!(core.state(), State::Stop);
        assert!(core.in_port(0).unwrap().is_empty());
        assert!(core.get_batched_input(0, &[0], Duration::ZERO).is_empty());
    }

    #[test]
    fn test_config_string_accumulates() {
        let core = NodeCore::new(0, 0, 1);
        core.save_config_string("A=1");
        core.save_config_string("B=2");
        assert_eq!(core.config_string(), "A=1 B=2");
    }

    #[test]
    fn test_custom_batching_algo_overrides_policy() {
        let core = NodeCore::new(1, 0, 1);
        let mut config = BatchingConfig::default();
        config.algo = Some(Arc::new(|batch_idx, _ports, _core| {
            vec![Blob::with_ids(batch_idx as u32, 0).share()]
        }));
        core.config_batch(config);
        let batch = core.get_batched_input(5, &[0], Duration::ZERO);
        assert_eq!(batch[0].stream_id, 5);
    }
}
