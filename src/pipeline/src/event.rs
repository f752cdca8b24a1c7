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

//! The per-pipeline event bus.
//!
//! Dispatch is synchronous: every listener registered for a code runs on
//! the emitter's thread, in registration order, before `emit_event`
//! returns. Listeners must therefore be brief and must never block on the
//! pipeline's own data path. A panicking listener is caught and logged; it
//! never unwinds past `emit_event`.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fusionflow_common::error::{FlowError, FlowResult};
use parking_lot::{Condvar, Mutex};

/// A 64-bit event code. Codes below `EVENT_USER_BASE` are reserved for the
/// framework.
pub type Event = u64;

pub const EVENT_NULL: Event = 0x0;
/// End of stream: drives the pipeline from running into depleting.
pub const EVENT_EOS: Event = 0x1;
pub const EVENT_PIPELINE_CONFIG: Event = 0x2;
pub const EVENT_PIPELINE_PREPARE: Event = 0x3;
pub const EVENT_PIPELINE_START: Event = 0x4;
pub const EVENT_PIPELINE_PAUSE: Event = 0x5;
/// Emitted once the whole pipeline has reached stop and every executor
/// thread has been joined.
pub const EVENT_PIPELINE_STOP: Event = 0x6;
pub const EVENT_PIPELINE_RECONFIG: Event = 0x7;
pub const EVENT_USER_BASE: Event = 0x8;
pub const EVENT_USER_1: Event = 0x8;
pub const EVENT_USER_2: Event = 0x9;
pub const EVENT_USER_3: Event = 0xA;
/// Carries a `u32` frame id; opens or closes a frame latency measurement.
pub const EVENT_PIPELINE_LATENCY_CAPTURE: Event = 0xB;
/// Carries a [`TimeStampInfo`](crate::monitor::TimeStampInfo).
pub const EVENT_PIPELINE_TIMESTAMP_RECORD: Event = 0xC;

/// Data attached to an emission; listeners downcast to the concrete type
/// agreed for the event code.
pub type EventData<'a> = Option<&'a (dyn Any + Send + Sync)>;

/// Callback invoked synchronously on the emitter's thread.
pub trait EventListener: Send + Sync {
    /// Handle one emission. The return value reports whether the listener
    /// considered the event handled; it does not affect dispatch.
    fn on_event(&self, data: EventData<'_>) -> bool;
}

/// Blanket adapter so plain closures can listen.
pub struct FnListener<F>(pub F);

impl<F> EventListener for FnListener<F>
where
    F: Fn(EventData<'_>) -> bool + Send + Sync,
{
    fn on_event(&self, data: EventData<'_>) -> bool {
        (self.0)(data)
    }
}

struct EventGate {
    generation: Mutex<u64>,
    cond: Condvar,
}

#[derive(Default)]
struct Registrations {
    known: HashSet<Event>,
    listeners: HashMap<Event, Vec<Arc<dyn EventListener>>>,
}

/// Per-pipeline registry of event codes, listeners and waiters.
#[derive(Default)]
pub struct EventManager {
    regs: Mutex<Registrations>,
    gates: Mutex<HashMap<Event, Arc<EventGate>>>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `event` to the known set. Emitting an unregistered code is an
    /// error; registering twice is a no-op.
    pub fn register_event(&self, event: Event) -> FlowResult<()> {
        self.regs.lock().known.insert(event);
        Ok(())
    }

    pub fn is_registered(&self, event: Event) -> bool {
        self.regs.lock().known.contains(&event)
    }

    /// Append a listener; multiple listeners per code run in registration
    /// order.
    pub fn register_callback(
        &self,
        event: Event,
        listener: Arc<dyn EventListener>,
    ) -> FlowResult<()> {
        let mut regs = self.regs.lock();
        if !regs.known.contains(&event) {
            return Err(FlowError::UnregisteredEvent(event));
        }
        regs.listeners.entry(event).or_default().push(listener);
        Ok(())
    }

    /// Remove every listener bound to `event`.
    pub fn reset_callback(&self, event: Event) -> FlowResult<()> {
        self.regs.lock().listeners.remove(&event);
        Ok(())
    }

    pub fn reset_all_callbacks(&self) -> FlowResult<()> {
        self.regs.lock().listeners.clear();
        Ok(())
    }

    /// Synchronously invoke every listener for `event` on the calling
    /// thread, then release any `wait_for_event` callers.
    ///
    /// Listener panics are contained here: they are logged and dispatch
    /// continues with the next listener.
    pub fn emit_event(&self, event: Event, data: EventData<'_>) -> FlowResult<()> {
        let listeners = {
            let regs = self.regs.lock();
            if !regs.known.contains(&event) {
                return Err(FlowError::UnregisteredEvent(event));
            }
            regs.listeners.get(&event).cloned().unwrap_or_default()
        };

        for listener in &listeners {
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(data)));
            match outcome {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(event, "listener declined event");
                }
                Err(panic) => {
                    let msg = panic_message(&panic);
                    tracing::error!(
                        event,
                        error = %msg,
                        "event listener panicked; dispatch continues"
                    );
                }
            }
        }

        let gate = self.gate(event);
        {
            let mut generation = gate.generation.lock();
            *generation += 1;
        }
        gate.cond.notify_all();
        Ok(())
    }

    /// Block until any thread emits `event`.
    pub fn wait_for_event(&self, event: Event) -> FlowResult<()> {
        self.wait_inner(event, None)
    }

    /// Block until `event` is emitted or `timeout` elapses.
    pub fn wait_for_event_timeout(&self, event: Event, timeout: Duration) -> FlowResult<()> {
        self.wait_inner(event, Some(Instant::now() + timeout))
    }

    fn wait_inner(&self, event: Event, deadline: Option<Instant>) -> FlowResult<()> {
        if !self.is_registered(event) {
            return Err(FlowError::UnregisteredEvent(event));
        }
        let gate = self.gate(event);
        let mut generation = gate.generation.lock();
        let seen = *generation;
        while *generation == seen {
            match deadline {
                None => gate.cond.wait(&mut generation),
                Some(deadline) => {
                    if gate.cond.wait_until(&mut generation, deadline).timed_out() {
                        return Err(FlowError::Timeout);
                    }
                }
            }
        }
        Ok(())
    }

    fn gate(&self, event: Event) -> Arc<EventGate> {
        Arc::clone(self.gates.lock().entry(event).or_insert_with(|| {
            Arc::new(EventGate {
                generation: Mutex::new(0),
                cond: Condvar::new(),
            })
        }))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn test_emit_unregistered_is_error() {
        let mgr = EventManager::new();
        assert!(matches!(
            mgr.emit_event(EVENT_USER_1, None),
            Err(FlowError::UnregisteredEvent(EVENT_USER_1))
        ));
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let mgr = EventManager::new();
        mgr.register_event(EVENT_USER_1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            let order = Arc::clone(&order);
            mgr.register_callback(
                EVENT_USER_1,
                Arc::new(FnListener(move |_: EventData<'_>| {
                    order.lock().push(tag);
                    true
                })),
            )
            .unwrap();
        }
        mgr.emit_event(EVENT_USER_1, None).unwrap();
        assert_eq!(*order.lock(), [0, 1, 2]);
    }

    #[test]
    fn test_listener_receives_typed_data() {
        let mgr = EventManager::new();
        mgr.register_event(EVENT_USER_2).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&seen);
        mgr.register_callback(
            EVENT_USER_2,
            Arc::new(FnListener(move |data: EventData<'_>| {
                if let Some(v) = data.and_then(|d| d.downcast_ref::<usize>()) {
                    sink.store(*v, Ordering::SeqCst);
                }
                true
            })),
        )
        .unwrap();
        mgr.emit_event(EVENT_USER_2, Some(&42usize)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let mgr = EventManager::new();
        mgr.register_event(EVENT_USER_1).unwrap();
        let reached = Arc::new(AtomicUsize::new(0));
        mgr.register_callback(
            EVENT_USER_1,
            Arc::new(FnListener(|_: EventData<'_>| panic!("listener bug"))),
        )
        .unwrap();
        let sink = Arc::clone(&reached);
        mgr.register_callback(
            EVENT_USER_1,
            Arc::new(FnListener(move |_: EventData<'_>| {
                sink.fetch_add(1, Ordering::SeqCst);
                true
            })),
        )
        .unwrap();

        mgr.emit_event(EVENT_USER_1, None).unwrap();
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_for_event_cross_thread() {
        let mgr = Arc::new(EventManager::new());
        mgr.register_event(EVENT_PIPELINE_STOP).unwrap();

        let waiter = {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || mgr.wait_for_event(EVENT_PIPELINE_STOP))
        };
        thread::sleep(Duration::from_millis(20));
        mgr.emit_event(EVENT_PIPELINE_STOP, None).unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_wait_timeout() {
        let mgr = EventManager::new();
        mgr.register_event(EVENT_USER_3).unwrap();
        assert!(matches!(
            mgr.wait_for_event_timeout(EVENT_USER_3, Duration::from_millis(10)),
            Err(FlowError::Timeout)
        ));
    }

    #[test]
    fn test_reset_callback_removes_listeners() {
        let mgr = EventManager::new();
        mgr.register_event(EVENT_USER_1).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&hits);
        mgr.register_callback(
            EVENT_USER_1,
            Arc::new(FnListener(move |_: EventData<'_>| {
                sink.fetch_add(1, Ordering::SeqCst);
                true
            })),
        )
        .unwrap();

        mgr.emit_event(EVENT_USER_1, None).unwrap();
        mgr.reset_callback(EVENT_USER_1).unwrap();
        mgr.emit_event(EVENT_USER_1, None).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
