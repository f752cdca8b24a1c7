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

//! The top-level orchestrator.
//!
//! A [`Pipeline`] owns its nodes in insertion order, the edges linking
//! their ports, the executors built at prepare time, the event manager and
//! the performance monitors. It drives the shared lifecycle: `prepare`
//! validates and wires everything, `start` spawns one thread per executor,
//! an EOS event moves the graph into depleting, and a background watcher
//! completes the transition to stop once every node has drained (or
//! immediately, when a stop is forced by failure or by [`Pipeline::stop`]).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use fusionflow_common::error::{FlowError, FlowResult};
use fusionflow_common::state::{State, StateCell};
use itertools::Itertools;
use parking_lot::Mutex;

use crate::batching::BatchingPolicy;
use crate::event::{
    Event, EventData, EventListener, EventManager, EVENT_EOS, EVENT_PIPELINE_CONFIG,
    EVENT_PIPELINE_LATENCY_CAPTURE, EVENT_PIPELINE_PAUSE, EVENT_PIPELINE_PREPARE,
    EVENT_PIPELINE_RECONFIG, EVENT_PIPELINE_START, EVENT_PIPELINE_STOP,
    EVENT_PIPELINE_TIMESTAMP_RECORD, EVENT_USER_1, EVENT_USER_2, EVENT_USER_3,
};
use crate::executor::{Executor, WorkerHandle};
use crate::monitor::{
    LatencyCaptureListener, PipelinePerformanceMonitor, TimeStampRecordListener,
    GLOBAL_PIPELINE_METRICS,
};
use crate::node::{Node, WorkerCtx};

/// Poll period of the background watcher that completes depletion and
/// forced stops.
const WATCH_INTERVAL: Duration = Duration::from_millis(2);

struct NodeEntry {
    name: String,
    node: Arc<dyn Node>,
    is_source: bool,
    lane: Option<String>,
}

#[derive(Clone, Copy)]
struct EdgeRec {
    from: usize,
    from_port: usize,
    to: usize,
    to_port: usize,
}

#[derive(Default)]
struct ControlShared {
    stop_requested: AtomicBool,
    first_failure: Mutex<Option<String>>,
}

impl ControlShared {
    fn record_failure(&self, msg: String) {
        let mut slot = self.first_failure.lock();
        if slot.is_none() {
            *slot = Some(msg);
        }
        self.stop_requested.store(true, Ordering::SeqCst);
    }
}

/// Listener that moves the whole graph from running into depleting when
/// any node raises EOS.
struct EosListener {
    state: Arc<StateCell>,
    nodes: Vec<Arc<dyn Node>>,
    executors: Vec<Arc<Executor>>,
}

impl EventListener for EosListener {
    fn on_event(&self, _data: EventData<'_>) -> bool {
        if self.state.get() != State::Running {
            return true;
        }
        tracing::info!("EOS received, pipeline entering depleting");
        let _ = self.state.transit_to(State::Depleting);
        for node in &self.nodes {
            let _ = node.core().transit_state_to(State::Depleting);
        }
        for executor in &self.executors {
            let _ = executor.transit_state_to(State::Depleting);
        }
        true
    }
}

/// The top-level pipeline object.
pub struct Pipeline {
    nodes: Vec<NodeEntry>,
    index: HashMap<String, usize>,
    edges: Vec<EdgeRec>,
    executors: Vec<Arc<Executor>>,
    event_manager: Arc<EventManager>,
    perf_monitor: Arc<PipelinePerformanceMonitor>,
    state: Arc<StateCell>,
    shared: Arc<ControlShared>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    worker_name_counts: HashMap<String, usize>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("nodes", &self.nodes.len())
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        let event_manager = Arc::new(EventManager::new());
        for event in [
            EVENT_EOS,
            EVENT_PIPELINE_CONFIG,
            EVENT_PIPELINE_PREPARE,
            EVENT_PIPELINE_START,
            EVENT_PIPELINE_PAUSE,
            EVENT_PIPELINE_STOP,
            EVENT_PIPELINE_RECONFIG,
            EVENT_USER_1,
            EVENT_USER_2,
            EVENT_USER_3,
            EVENT_PIPELINE_LATENCY_CAPTURE,
            EVENT_PIPELINE_TIMESTAMP_RECORD,
        ] {
            event_manager.register_event(event).expect("infallible");
        }
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
            executors: Vec::new(),
            event_manager,
            perf_monitor: Arc::new(PipelinePerformanceMonitor::new()),
            state: Arc::new(StateCell::default()),
            shared: Arc::new(ControlShared::default()),
            watcher: Mutex::new(None),
            worker_name_counts: HashMap::new(),
        }
    }

    /// Register a source node. Source nodes have no upstream link and are
    /// expected to raise EOS when their input material runs out.
    pub fn set_source(&mut self, node: Arc<dyn Node>, name: &str) -> FlowResult<()> {
        self.insert_node(node, name, true)
    }

    /// Register an interior or sink node.
    pub fn add_node(&mut self, node: Arc<dyn Node>, name: &str) -> FlowResult<()> {
        self.insert_node(node, name, false)
    }

    fn insert_node(&mut self, node: Arc<dyn Node>, name: &str, is_source: bool) -> FlowResult<()> {
        if self.index.contains_key(name) {
            return Err(FlowError::DuplicateName(name.into()));
        }
        node.core().attach_event_manager(Arc::clone(&self.event_manager));
        self.index.insert(name.to_owned(), self.nodes.len());
        self.nodes.push(NodeEntry {
            name: name.to_owned(),
            node,
            is_source,
            lane: None,
        });
        if self.state.is(State::Idle) {
            self.state.transit_to(State::Configured)?;
        }
        Ok(())
    }

    /// Assign `node` to a named execution lane. Nodes sharing a lane are
    /// driven by the same executor threads, ancestors before descendants.
    /// Without an assignment every node runs in its own lane.
    pub fn assign_lane(&mut self, node: &str, lane: &str) -> FlowResult<()> {
        let idx = self.node_index(node)?;
        self.nodes[idx].lane = Some(lane.to_owned());
        Ok(())
    }

    /// Connect `prev`'s out-port to `next`'s in-port. Edges are directed;
    /// protocol negotiation over all recorded links runs during
    /// [`Pipeline::prepare`].
    pub fn link_node(
        &mut self,
        prev: &str,
        prev_port: usize,
        next: &str,
        next_port: usize,
    ) -> FlowResult<()> {
        let from = self.node_index(prev)?;
        let to = self.node_index(next)?;
        let out = Arc::clone(self.nodes[from].node.core().out_port(prev_port)?);
        let inp = Arc::clone(self.nodes[to].node.core().in_port(next_port)?);
        out.link_to(inp);
        self.edges.push(EdgeRec {
            from,
            from_port: prev_port,
            to,
            to_port: next_port,
        });
        tracing::debug!(
            from = %prev, from_port = prev_port, to = %next, to_port = next_port,
            "linked nodes"
        );
        Ok(())
    }

    fn node_index(&self, name: &str) -> FlowResult<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| FlowError::UnknownNode(name.into()))
    }

    pub fn node(&self, name: &str) -> FlowResult<Arc<dyn Node>> {
        Ok(Arc::clone(&self.nodes[self.node_index(name)?].node))
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    pub fn event_manager(&self) -> &Arc<EventManager> {
        &self.event_manager
    }

    pub fn performance_monitor(&self) -> &Arc<PipelinePerformanceMonitor> {
        &self.perf_monitor
    }

    pub fn register_event(&self, event: Event) -> FlowResult<()> {
        self.event_manager.register_event(event)
    }

    pub fn register_callback(
        &self,
        event: Event,
        listener: Arc<dyn EventListener>,
    ) -> FlowResult<()> {
        self.event_manager.register_callback(event, listener)
    }

    pub fn emit_event(&self, event: Event, data: EventData<'_>) -> FlowResult<()> {
        self.event_manager.emit_event(event, data)
    }

    /// Block until `event` is emitted.
    ///
    /// A wait for the pipeline-stop event is satisfied by the stop state
    /// itself, so callers arriving after a fast run do not wait for an
    /// emission that already happened.
    pub fn wait_for_event(&self, event: Event) -> FlowResult<()> {
        if event != EVENT_PIPELINE_STOP {
            return self.event_manager.wait_for_event(event);
        }
        loop {
            if self.state.is(State::Stop) {
                return Ok(());
            }
            match self
                .event_manager
                .wait_for_event_timeout(event, Duration::from_millis(50))
            {
                Ok(()) => return Ok(()),
                Err(FlowError::Timeout) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    pub fn wait_for_event_timeout(&self, event: Event, timeout: Duration) -> FlowResult<()> {
        if event != EVENT_PIPELINE_STOP {
            return self.event_manager.wait_for_event_timeout(event, timeout);
        }
        let deadline = Instant::now() + timeout;
        loop {
            if self.state.is(State::Stop) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(FlowError::Timeout);
            }
            let step = (deadline - now).min(Duration::from_millis(50));
            match self.event_manager.wait_for_event_timeout(event, step) {
                Ok(()) => return Ok(()),
                Err(FlowError::Timeout) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Block until the pipeline reaches stop, then surface the first
    /// failure recorded during the run, if any.
    pub fn wait_for_pipeline_stop(&self) -> FlowResult<()> {
        self.wait_for_event(EVENT_PIPELINE_STOP)?;
        match self.shared.first_failure.lock().clone() {
            Some(msg) => Err(FlowError::Failure(msg.into_boxed_str())),
            None => Ok(()),
        }
    }

    /// Validate every node, negotiate link protocols, reject cycles, build
    /// executors and advance the whole graph to prepared.
    ///
    /// Validation runs before any side effect, so a configuration error
    /// leaves the pipeline in its prior state.
    pub fn prepare(&mut self) -> FlowResult<()> {
        if self.state.get() != State::Configured {
            return Err(FlowError::NotReady {
                current: self.state.get(),
                required: State::Configured,
            });
        }
        for entry in &self.nodes {
            entry.node.validate_configuration().map_err(|err| {
                tracing::error!(node = %entry.name, error = %err, "configuration invalid");
                err
            })?;
        }
        for edge in &self.edges {
            let target = &self.nodes[edge.to];
            if target.is_source {
                return Err(FlowError::InvalidConfiguration(
                    format!("source node {} cannot have an upstream link", target.name)
                        .into_boxed_str(),
                ));
            }
        }
        self.negotiate_protocols()?;
        let order = self.topological_order()?;

        for &idx in &order {
            self.nodes[idx].node.prepare()?;
        }

        self.build_executors(&order)?;

        // Advance ports and nodes. Ports may still be idle; nodes reached
        // configured through their own configuration path.
        for entry in &self.nodes {
            let core = entry.node.core();
            for port_idx in 0..core.in_port_num() {
                let port = core.in_port(port_idx)?;
                if port.state() == State::Idle {
                    port.transit_state_to(State::Configured)?;
                }
                port.transit_state_to(State::Prepared)?;
                port.bind_metrics(GLOBAL_PIPELINE_METRICS.for_port(&entry.name, port_idx));
            }
            core.transit_state_to(State::Prepared)?;
        }
        for executor in &self.executors {
            executor.transit_state_to(State::Configured)?;
            executor.transit_state_to(State::Prepared)?;
            executor.init();
        }

        self.install_listeners()?;
        self.state.transit_to(State::Prepared)?;
        self.event_manager.emit_event(EVENT_PIPELINE_PREPARE, None)?;
        tracing::info!(
            nodes = self.nodes.len(),
            executors = self.executors.len(),
            "pipeline prepared"
        );
        Ok(())
    }

    /// Spawn executor threads and begin processing.
    pub fn start(&mut self) -> FlowResult<()> {
        if self.state.get() != State::Prepared {
            return Err(FlowError::NotReady {
                current: self.state.get(),
                required: State::Prepared,
            });
        }
        for entry in &self.nodes {
            entry.node.core().transit_state_to(State::Running)?;
        }
        for executor in &self.executors {
            executor.transit_state_to(State::Running)?;
            executor.start()?;
        }
        self.state.transit_to(State::Running)?;
        self.spawn_watcher();
        self.event_manager.emit_event(EVENT_PIPELINE_START, None)?;
        tracing::info!("pipeline started");
        Ok(())
    }

    /// Force-stop the pipeline: wake every waiter, clear queues, join all
    /// executor threads. Graceful shutdown goes through EOS instead.
    pub fn stop(&mut self) -> FlowResult<()> {
        if self.state.is(State::Stop) {
            self.join_watcher();
            return Ok(());
        }
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        if self.watcher.lock().is_some() {
            self.join_watcher();
        } else {
            // Never started; tear down inline.
            finish_stop(
                &collect_nodes(&self.nodes),
                &self.executors,
                &self.event_manager,
                &self.state,
                true,
            );
        }
        Ok(())
    }

    /// Reset a stopped pipeline instance back to prepared for reuse.
    /// Every node and worker restores its own internal state through its
    /// `rearm` hook.
    pub fn rearm(&mut self) -> FlowResult<()> {
        if self.state.get() != State::Stop {
            return Err(FlowError::NotReady {
                current: self.state.get(),
                required: State::Stop,
            });
        }
        self.join_watcher();
        for executor in &self.executors {
            executor.rearm()?;
        }
        for entry in &self.nodes {
            entry.node.core().rearm_core()?;
            entry.node.core().turn_on_batching();
            entry.node.rearm()?;
        }
        self.perf_monitor.reset();
        self.shared.stop_requested.store(false, Ordering::SeqCst);
        *self.shared.first_failure.lock() = None;
        self.state.transit_to(State::Prepared)?;
        tracing::info!("pipeline rearmed");
        Ok(())
    }

    /// Performance data per executor per worker, in the export wire format.
    pub fn performance_data(&self) -> serde_json::Value {
        let mut by_executor = serde_json::Map::new();
        for executor in &self.executors {
            let workers: serde_json::Map<String, serde_json::Value> = executor
                .performance_data()
                .into_iter()
                .sorted_by(|a, b| a.0.cmp(&b.0))
                .map(|(name, data)| (name, serde_json::to_value(data).unwrap_or_default()))
                .collect();
            by_executor.insert(executor.label().to_owned(), workers.into());
        }
        by_executor.into()
    }

    fn negotiate_protocols(&self) -> FlowResult<()> {
        for edge in &self.edges {
            let out_entry = &self.nodes[edge.from];
            let in_entry = &self.nodes[edge.to];
            let out = out_entry.node.core().out_port(edge.from_port)?;
            let inp = in_entry.node.core().in_port(edge.to_port)?;
            let offered = out.protocol();
            let accepted = inp.protocol();
            if offered.is_empty() && accepted.is_empty() {
                continue;
            }
            let common = offered.overlap(&accepted);
            let Some(selected) = common.iter().min().cloned() else {
                return Err(FlowError::ProtocolMismatch {
                    from: format!("{}[{}] {offered}", out_entry.name, edge.from_port).into(),
                    to: format!("{}[{}] {accepted}", in_entry.name, edge.to_port).into(),
                });
            };
            out.select_protocol(&selected);
            inp.select_protocol(&selected);

            let offered_keys: Vec<&str> = offered.keys().sorted().collect();
            let accepted_keys: Vec<&str> = accepted.keys().sorted().collect();
            if offered_keys != accepted_keys && !out.has_convert_fn() {
                return Err(FlowError::InvalidConfiguration(
                    format!(
                        "link {}[{}] -> {}[{}] joins differing protocols and needs a convert \
                         function",
                        out_entry.name, edge.from_port, in_entry.name, edge.to_port
                    )
                    .into_boxed_str(),
                ));
            }
            tracing::debug!(
                from = %out_entry.name, to = %in_entry.name, selected = %selected,
                "protocol negotiated"
            );
        }
        Ok(())
    }

    /// Kahn's algorithm over the recorded edges; insertion order breaks
    /// ties so executor layout is deterministic.
    fn topological_order(&self) -> FlowResult<Vec<usize>> {
        let n = self.nodes.len();
        let mut indegree = vec![0usize; n];
        let mut adjacent: Vec<Vec<usize>> = vec![Vec::new(); n];
        for edge in &self.edges {
            adjacent[edge.from].push(edge.to);
            indegree[edge.to] += 1;
        }
        let mut ready: VecDeque<usize> =
            (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(idx) = ready.pop_front() {
            order.push(idx);
            for &next in &adjacent[idx] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }
        if order.len() != n {
            return Err(FlowError::CycleDetected);
        }
        Ok(order)
    }

    /// Group nodes into execution lanes and build one executor per
    /// (lane, batch index, thread-per-batch clone).
    fn build_executors(&mut self, order: &[usize]) -> FlowResult<()> {
        self.executors.clear();
        let fault_hook: crate::executor::FaultHook = {
            let shared = Arc::clone(&self.shared);
            Arc::new(move |msg| shared.record_failure(msg))
        };

        // Lanes keyed by explicit assignment, defaulting to one per node;
        // members stay in topological order.
        let mut lane_order: Vec<String> = Vec::new();
        let mut lanes: HashMap<String, Vec<usize>> = HashMap::new();
        for &idx in order {
            let key = self.nodes[idx]
                .lane
                .clone()
                .unwrap_or_else(|| format!("node:{}", self.nodes[idx].name));
            if !lanes.contains_key(&key) {
                lane_order.push(key.clone());
            }
            lanes.entry(key).or_default().push(idx);
        }

        for lane in &lane_order {
            let members = &lanes[lane];
            let mut duplicates = 1usize;
            let mut threads_per_batch = 1usize;
            let mut interval = Duration::ZERO;
            for &idx in members {
                let core = self.nodes[idx].node.core();
                let config = core.batching_config();
                let (dup, tpb) = match config.policy {
                    BatchingPolicy::IgnoringStream => (core.thread_num(), 1),
                    BatchingPolicy::WithStream | BatchingPolicy::WithStreamIgnoreOrder => {
                        (config.effective_batch_size(), config.threads_per_batch.max(1))
                    }
                };
                duplicates = duplicates.max(dup);
                threads_per_batch = threads_per_batch.max(tpb);
                interval = interval.max(core.looping_interval());
            }

            for batch_idx in 0..duplicates {
                for clone_idx in 0..threads_per_batch {
                    let label = if threads_per_batch > 1 {
                        format!("{lane}-{batch_idx}.{clone_idx}")
                    } else {
                        format!("{lane}-{batch_idx}")
                    };
                    let executor =
                        Executor::new(label, batch_idx, interval, Arc::clone(&fault_hook));
                    for &idx in members {
                        let node = Arc::clone(&self.nodes[idx].node);
                        let class = node.class_name().to_owned();
                        let count = self.worker_name_counts.entry(class.clone()).or_insert(0);
                        let worker_name = format!("{class}#{count}");
                        *count += 1;
                        let ctx = Arc::new(WorkerCtx::new(worker_name));
                        let worker = node.create_worker();
                        executor.add_worker(WorkerHandle { worker, ctx });
                    }
                    self.executors.push(Arc::new(executor));
                }
            }
        }
        Ok(())
    }

    fn install_listeners(&self) -> FlowResult<()> {
        self.event_manager.register_callback(
            EVENT_EOS,
            Arc::new(EosListener {
                state: Arc::clone(&self.state),
                nodes: collect_nodes(&self.nodes),
                executors: self.executors.clone(),
            }),
        )?;
        self.event_manager.register_callback(
            EVENT_PIPELINE_LATENCY_CAPTURE,
            Arc::new(LatencyCaptureListener {
                monitor: Arc::clone(&self.perf_monitor),
            }),
        )?;
        self.event_manager.register_callback(
            EVENT_PIPELINE_TIMESTAMP_RECORD,
            Arc::new(TimeStampRecordListener {
                monitor: Arc::clone(&self.perf_monitor),
            }),
        )?;
        for entry in &self.nodes {
            for (event, listener) in entry.node.core().take_callbacks() {
                self.event_manager.register_event(event)?;
                self.event_manager.register_callback(event, listener)?;
            }
        }
        Ok(())
    }

    fn spawn_watcher(&self) {
        let nodes = collect_nodes(&self.nodes);
        let executors = self.executors.clone();
        let event_manager = Arc::clone(&self.event_manager);
        let state = Arc::clone(&self.state);
        let shared = Arc::clone(&self.shared);

        let handle = std::thread::Builder::new()
            .name("fusionflow-watchdog".to_owned())
            .spawn(move || {
                // The drain condition must hold on two consecutive samples:
                // a blob popped upstream but not yet pushed downstream makes
                // every queue look empty for an instant.
                let mut drained_streak = 0u32;
                loop {
                    if shared.stop_requested.load(Ordering::SeqCst) {
                        finish_stop(&nodes, &executors, &event_manager, &state, true);
                        return;
                    }
                    if state.get() == State::Depleting
                        && nodes.iter().all(|node| node.core().deplete())
                    {
                        drained_streak += 1;
                        if drained_streak >= 2 {
                            finish_stop(&nodes, &executors, &event_manager, &state, false);
                            return;
                        }
                    } else {
                        drained_streak = 0;
                    }
                    std::thread::sleep(WATCH_INTERVAL);
                }
            })
            .expect("failed to spawn pipeline watcher");
        *self.watcher.lock() = Some(handle);
    }

    fn join_watcher(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            if handle.join().is_err() {
                tracing::error!("pipeline watcher panicked");
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.stop();
        self.join_watcher();
    }
}

fn collect_nodes(entries: &[NodeEntry]) -> Vec<Arc<dyn Node>> {
    entries.iter().map(|e| Arc::clone(&e.node)).collect()
}

/// Complete the transition to stop: move every entity over, wake all
/// waiters, join executor threads, run node finalizers and announce the
/// pipeline-stop event.
fn finish_stop(
    nodes: &[Arc<dyn Node>],
    executors: &[Arc<Executor>],
    event_manager: &Arc<EventManager>,
    state: &Arc<StateCell>,
    forced: bool,
) {
    for node in nodes {
        if forced {
            node.core().transit_state_to_stop_forced();
        } else if node.core().transit_state_to(State::Stop).is_err() {
            node.core().transit_state_to_stop_forced();
        }
    }
    for executor in executors {
        if forced || executor.transit_state_to(State::Stop).is_err() {
            executor.transit_state_to_stop_forced();
        }
    }
    for executor in executors {
        executor.join();
    }
    for node in nodes {
        node.finalize();
    }
    state.force_stop();
    if let Err(err) = event_manager.emit_event(EVENT_PIPELINE_STOP, None) {
        tracing::error!(error = %err, "failed to announce pipeline stop");
    }
    tracing::info!(forced, "pipeline stopped");
}
