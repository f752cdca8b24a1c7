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

//! Executors: one OS thread driving an ordered group of node workers.
//!
//! All workers inside one executor run sequentially on its thread, in
//! topological order (ancestors before descendants); workers in different
//! executors run concurrently. The executor also owns the per-worker
//! performance counters exported through the pipeline.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use fusionflow_common::error::{FlowError, FlowResult};
use fusionflow_common::state::{State, StateCell};
use parking_lot::Mutex;

use crate::monitor::{NodePerfData, GLOBAL_PIPELINE_METRICS};
use crate::node::{NodeWorker, WorkerCtx};

/// Invoked when a worker faults (error return or panic) so the pipeline
/// can record the failure and initiate a forced stop.
pub(crate) type FaultHook = Arc<dyn Fn(String) + Send + Sync>;

pub(crate) struct WorkerHandle {
    pub worker: Box<dyn NodeWorker>,
    pub ctx: Arc<WorkerCtx>,
}

/// A thread-bound group of node workers sharing one batch index.
pub struct Executor {
    label: String,
    batch_idx: usize,
    looping_interval: Duration,
    state: StateCell,
    workers: Arc<Mutex<Vec<WorkerHandle>>>,
    ctxs: Mutex<Vec<Arc<WorkerCtx>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    fault_hook: FaultHook,
}

impl Executor {
    pub(crate) fn new(
        label: String,
        batch_idx: usize,
        looping_interval: Duration,
        fault_hook: FaultHook,
    ) -> Self {
        Self {
            label,
            batch_idx,
            looping_interval,
            state: StateCell::default(),
            workers: Arc::new(Mutex::new(Vec::new())),
            ctxs: Mutex::new(Vec::new()),
            thread: Mutex::new(None),
            fault_hook,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn batch_idx(&self) -> usize {
        self.batch_idx
    }

    pub(crate) fn add_worker(&self, handle: WorkerHandle) {
        self.ctxs.lock().push(Arc::clone(&handle.ctx));
        self.workers.lock().push(handle);
    }

    pub(crate) fn worker_ctxs(&self) -> Vec<Arc<WorkerCtx>> {
        self.ctxs.lock().clone()
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    /// Walk the executor and its workers through a controlled transition.
    pub(crate) fn transit_state_to(&self, state: State) -> FlowResult<()> {
        self.state.transit_to(state)?;
        for ctx in self.ctxs.lock().iter() {
            let _ = ctx.transit_state_to(state);
        }
        Ok(())
    }

    /// Force the executor and all its workers straight into stop.
    pub(crate) fn transit_state_to_stop_forced(&self) {
        self.state.force_stop();
        for ctx in self.ctxs.lock().iter() {
            ctx.transit_state_to_stop_forced();
        }
    }

    /// Run every worker's `init` hook. Called once while the pipeline
    /// prepares, before any thread exists.
    pub(crate) fn init(&self) {
        let mut workers = self.workers.lock();
        for handle in workers.iter_mut() {
            handle.worker.init(&handle.ctx);
        }
    }

    /// Spawn the executor thread and start driving workers.
    pub(crate) fn start(&self) -> FlowResult<()> {
        if self.state.get() != State::Running {
            return Err(FlowError::NotReady {
                current: self.state.get(),
                required: State::Running,
            });
        }
        let workers = Arc::clone(&self.workers);
        let batch_idx = self.batch_idx;
        let interval = self.looping_interval;
        let fault_hook = Arc::clone(&self.fault_hook);
        let label = self.label.clone();

        let handle = std::thread::Builder::new()
            .name(format!("fusionflow-exec-{label}"))
            .spawn(move || {
                let mut owned = std::mem::take(&mut *workers.lock());
                run_workers(&mut owned, batch_idx, interval, &fault_hook);
                *workers.lock() = owned;
            })
            .map_err(|e| FlowError::failure(format!("failed to spawn executor thread: {e}")))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Block until the executor thread exits. Idempotent.
    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!(executor = %self.label, "executor thread panicked");
            }
        }
    }

    /// Reset the executor and its workers from stop back to prepared for
    /// pipeline reuse. Worker `rearm` hooks run first, then `init`, since
    /// the previous run already called `deinit`.
    pub(crate) fn rearm(&self) -> FlowResult<()> {
        self.join();
        let mut workers = self.workers.lock();
        for handle in workers.iter_mut() {
            handle.worker.rearm()?;
            handle.ctx.transit_state_to(State::Prepared)?;
            handle.ctx.clear_stop();
            handle.ctx.latency().reset();
            handle.worker.init(&handle.ctx);
        }
        drop(workers);
        self.state.transit_to(State::Prepared)
    }

    /// Per-worker performance counters recorded so far.
    pub fn performance_data(&self) -> HashMap<String, NodePerfData> {
        self.ctxs
            .lock()
            .iter()
            .map(|ctx| {
                (
                    ctx.name().to_owned(),
                    NodePerfData::from_latency_snapshot(&ctx.latency().snapshot()),
                )
            })
            .collect()
    }
}

/// The executor thread body: first-run hooks, the process loop, last-run
/// hooks, deinit.
fn run_workers(
    workers: &mut [WorkerHandle],
    batch_idx: usize,
    interval: Duration,
    fault_hook: &FaultHook,
) {
    for handle in workers.iter_mut() {
        handle.worker.process_first_run(&handle.ctx, batch_idx);
    }

    loop {
        let mut any_active = false;
        for handle in workers.iter_mut() {
            let state = handle.ctx.state();
            let runnable = matches!(state, State::Running | State::Depleting);
            if !runnable || handle.ctx.stop_flag() {
                continue;
            }
            any_active = true;

            handle.ctx.latency().start_recording("process");
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                handle.worker.process(&handle.ctx, batch_idx)
            }));
            handle.ctx.latency().stop_recording("process");

            match outcome {
                Ok(Ok(())) => {
                    GLOBAL_PIPELINE_METRICS
                        .worker_process_total
                        .with_label_values(&[handle.ctx.name()])
                        .inc();
                }
                Ok(Err(err)) if err.is_flow_control() => {
                    tracing::debug!(worker = %handle.ctx.name(), error = %err, "idle round");
                }
                Ok(Err(err)) => {
                    tracing::error!(worker = %handle.ctx.name(), error = %err, "worker failed");
                    handle.ctx.transit_state_to_stop_forced();
                    fault_hook(format!("worker {} failed: {err}", handle.ctx.name()));
                }
                Err(panic) => {
                    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                        (*s).to_owned()
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "non-string panic payload".to_owned()
                    };
                    tracing::error!(worker = %handle.ctx.name(), error = %msg, "worker panicked");
                    handle.ctx.transit_state_to_stop_forced();
                    fault_hook(format!("worker {} panicked: {msg}", handle.ctx.name()));
                }
            }
        }

        if !any_active {
            break;
        }
        if interval > Duration::ZERO {
            std::thread::sleep(interval);
        }
    }

    for handle in workers.iter_mut() {
        handle.worker.process_last_run(&handle.ctx, batch_idx);
    }
    for handle in workers.iter_mut() {
        handle.worker.deinit(&handle.ctx);
    }
}
