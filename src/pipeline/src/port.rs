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

//! In- and out-ports connecting successive nodes.
//!
//! An [`InPort`] owns the only shared mutable structure between producer
//! and consumer threads: a bounded blob queue guarded by its own mutex with
//! separate not-empty / not-full condition variables. An [`OutPort`] fans a
//! blob out to every connected in-port, converting it first when link
//! negotiation installed a conversion function.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use fusionflow_common::blob::Blob;
use fusionflow_common::error::{FlowError, FlowResult};
use fusionflow_common::protocol::Protocol;
use fusionflow_common::state::{State, StateCell};
use parking_lot::{Condvar, Mutex, RwLock};
use parse_display::Display;

use crate::monitor::PortMetrics;

/// Default bound of an in-port queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4;

/// What `push` does when the queue is at capacity.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default)]
#[display(style = "snake_case")]
pub enum QueuePolicy {
    /// Wait (up to the caller's timeout) for space; backpressure.
    #[default]
    BlockIfFull,
    /// Drop the incoming blob and report success; discard-tail.
    DiscardIfFull,
}

/// Blob conversion installed on an out-port when the two sides of a link
/// negotiate different key-strings.
pub type ConvertFn = Arc<dyn Fn(Arc<Blob>) -> Arc<Blob> + Send + Sync>;

/// Hook an in-port pokes whenever its queue gains data or its state
/// changes, so the owning node's batching wait can re-examine the ports.
pub(crate) trait WakeBatching: Send + Sync {
    fn wake(&self);
}

struct Queue {
    items: VecDeque<Arc<Blob>>,
    capacity: usize,
    policy: QueuePolicy,
}

/// A node's inbound attachment point: a bounded FIFO of blobs.
pub struct InPort {
    queue: Mutex<Queue>,
    not_empty: Condvar,
    not_full: Condvar,
    state: StateCell,
    protocol: RwLock<Protocol>,
    prev: RwLock<Option<Weak<OutPort>>>,
    wake_hook: OnceLock<Weak<dyn WakeBatching>>,
    metrics: OnceLock<PortMetrics>,
}

impl InPort {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(Queue {
                items: VecDeque::with_capacity(capacity),
                capacity,
                policy: QueuePolicy::default(),
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            state: StateCell::default(),
            protocol: RwLock::new(Protocol::new()),
            prev: RwLock::new(None),
            wake_hook: OnceLock::new(),
            metrics: OnceLock::new(),
        }
    }

    pub fn set_queue_capacity(&self, capacity: usize) {
        self.queue.lock().capacity = capacity.max(1);
    }

    pub fn set_queue_policy(&self, policy: QueuePolicy) {
        self.queue.lock().policy = policy;
    }

    pub fn set_protocol(&self, protocol: Protocol) {
        *self.protocol.write() = protocol;
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol.read().clone()
    }

    pub fn select_protocol(&self, key: &str) -> bool {
        self.protocol.write().select(key)
    }

    pub(crate) fn set_prev(&self, prev: &Arc<OutPort>) {
        *self.prev.write() = Some(Arc::downgrade(prev));
    }

    pub(crate) fn prev(&self) -> Option<Arc<OutPort>> {
        self.prev.read().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn install_wake_hook(&self, hook: Weak<dyn WakeBatching>) {
        let _ = self.wake_hook.set(hook);
    }

    pub(crate) fn bind_metrics(&self, metrics: PortMetrics) {
        let _ = self.metrics.set(metrics);
    }

    fn wake_batching(&self) {
        if let Some(hook) = self.wake_hook.get().and_then(Weak::upgrade) {
            hook.wake();
        }
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    /// Controlled state transition; wakes every waiter so blocked producers
    /// and consumers observe the change.
    pub fn transit_state_to(&self, state: State) -> FlowResult<()> {
        self.state.transit_to(state)?;
        self.not_empty.notify_all();
        self.not_full.notify_all();
        self.wake_batching();
        Ok(())
    }

    pub fn transit_state_to_stop_forced(&self) {
        self.state.force_stop();
        self.not_empty.notify_all();
        self.not_full.notify_all();
        self.wake_batching();
    }

    /// Enqueue without blocking; `Timeout` when the queue is full under the
    /// blocking policy.
    pub fn try_push(&self, blob: Arc<Blob>) -> FlowResult<()> {
        self.push_inner(blob, None)
    }

    /// Enqueue a blob.
    ///
    /// With `QueuePolicy::BlockIfFull` and a full queue this waits on the
    /// not-full condition until space frees up; `timeout == Duration::ZERO`
    /// waits indefinitely, otherwise `Timeout` is returned once the
    /// deadline elapses. Reaching the stop state while waiting yields
    /// `EndOfStream`. With `QueuePolicy::DiscardIfFull` a full queue drops
    /// the incoming blob and reports success.
    pub fn push(&self, blob: Arc<Blob>, timeout: Duration) -> FlowResult<()> {
        self.push_inner(blob, Some(timeout))
    }

    fn push_inner(&self, blob: Arc<Blob>, timeout: Option<Duration>) -> FlowResult<()> {
        let deadline = timeout.and_then(|t| (t > Duration::ZERO).then(|| Instant::now() + t));
        let mut queue = self.queue.lock();
        loop {
            if self.state.is(State::Stop) {
                return Err(FlowError::EndOfStream);
            }
            if queue.items.len() < queue.capacity {
                queue.items.push_back(blob);
                if let Some(m) = self.metrics.get() {
                    m.on_enqueue(queue.items.len());
                }
                drop(queue);
                self.not_empty.notify_one();
                self.wake_batching();
                return Ok(());
            }
            match queue.policy {
                QueuePolicy::DiscardIfFull => {
                    if let Some(m) = self.metrics.get() {
                        m.on_discard();
                    }
                    return Ok(());
                }
                QueuePolicy::BlockIfFull => match (timeout, deadline) {
                    // Non-blocking probe.
                    (None, _) => return Err(FlowError::Timeout),
                    // Zero timeout waits until space or stop.
                    (Some(_), None) => self.not_full.wait(&mut queue),
                    (Some(_), Some(deadline)) => {
                        if self.not_full.wait_until(&mut queue, deadline).timed_out() {
                            return Err(FlowError::Timeout);
                        }
                    }
                },
            }
        }
    }

    /// Clone of the blob at the head of the queue, if any.
    pub fn front(&self) -> Option<Arc<Blob>> {
        self.queue.lock().items.front().cloned()
    }

    /// Remove and return the head of the queue.
    pub fn pop(&self) -> Option<Arc<Blob>> {
        let mut queue = self.queue.lock();
        let blob = queue.items.pop_front();
        if blob.is_some() {
            if let Some(m) = self.metrics.get() {
                m.on_dequeue(queue.items.len());
            }
            drop(queue);
            self.not_full.notify_one();
        }
        blob
    }

    /// Clone of the first queued blob satisfying `pred`, without removing
    /// it. Used by the peek phase of batching.
    pub(crate) fn find_matching(&self, mut pred: impl FnMut(&Blob) -> bool) -> Option<Arc<Blob>> {
        self.queue
            .lock()
            .items
            .iter()
            .find(|blob| pred(blob.as_ref()))
            .cloned()
    }

    /// Remove and return the first queued blob satisfying `pred`,
    /// preserving the order of the rest. Used by stream batching, which
    /// must skip over blobs destined for other batch indices.
    pub(crate) fn take_matching(
        &self,
        mut pred: impl FnMut(&Blob) -> bool,
    ) -> Option<Arc<Blob>> {
        let mut queue = self.queue.lock();
        let idx = queue.items.iter().position(|blob| pred(blob.as_ref()))?;
        let blob = queue.items.remove(idx);
        if let Some(m) = self.metrics.get() {
            m.on_dequeue(queue.items.len());
        }
        drop(queue);
        self.not_full.notify_one();
        blob
    }

    pub fn len(&self) -> usize {
        self.queue.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().items.is_empty()
    }

    /// Drop every queued blob and wake all waiters; producers blocked on a
    /// full queue observe the port state (end-of-stream during teardown).
    pub fn clear(&self) {
        let mut queue = self.queue.lock();
        queue.items.clear();
        if let Some(m) = self.metrics.get() {
            m.on_dequeue(0);
        }
        drop(queue);
        self.not_full.notify_all();
        self.not_empty.notify_all();
        self.wake_batching();
    }
}

impl Default for InPort {
    fn default() -> Self {
        Self::new()
    }
}

/// A node's outbound attachment point, fanning blobs out to every linked
/// downstream in-port.
pub struct OutPort {
    next: RwLock<Vec<Arc<InPort>>>,
    convert: RwLock<Option<ConvertFn>>,
    protocol: RwLock<Protocol>,
}

impl OutPort {
    pub fn new() -> Self {
        Self {
            next: RwLock::new(Vec::new()),
            convert: RwLock::new(None),
            protocol: RwLock::new(Protocol::new()),
        }
    }

    pub fn set_protocol(&self, protocol: Protocol) {
        *self.protocol.write() = protocol;
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol.read().clone()
    }

    pub fn select_protocol(&self, key: &str) -> bool {
        self.protocol.write().select(key)
    }

    pub fn set_convert_fn(&self, convert: ConvertFn) {
        *self.convert.write() = Some(convert);
    }

    pub fn has_convert_fn(&self) -> bool {
        self.convert.read().is_some()
    }

    pub(crate) fn link_to(self: &Arc<Self>, next: Arc<InPort>) {
        next.set_prev(self);
        self.next.write().push(next);
    }

    pub fn next_ports(&self) -> Vec<Arc<InPort>> {
        self.next.read().clone()
    }

    /// Forward `blob` to every linked in-port, converting first when a
    /// conversion function is installed. The conversion runs once per send;
    /// each in-port receives a shared reference to the same blob.
    pub fn send(&self, blob: Arc<Blob>, timeout: Duration) -> FlowResult<()> {
        let blob = match &*self.convert.read() {
            Some(convert) => convert(blob),
            None => blob,
        };
        for port in self.next.read().iter() {
            port.push(Arc::clone(&blob), timeout)?;
        }
        Ok(())
    }
}

impl Default for OutPort {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn blob(frame_id: u32) -> Arc<Blob> {
        Blob::with_ids(0, frame_id).share()
    }

    #[test]
    fn test_fifo_order() {
        let port = InPort::new();
        for i in 0..4 {
            port.push(blob(i), Duration::from_millis(10)).unwrap();
        }
        let popped: Vec<u32> = std::iter::from_fn(|| port.pop()).map(|b| b.frame_id).collect();
        assert_eq!(popped, [0, 1, 2, 3]);
    }

    #[test]
    fn test_pop_returns_pushed_reference() {
        let port = InPort::new();
        let pushed = blob(1);
        port.push(Arc::clone(&pushed), Duration::from_millis(1)).unwrap();
        let popped = port.pop().unwrap();
        assert!(Arc::ptr_eq(&pushed, &popped));
    }

    #[test]
    fn test_block_if_full_times_out() {
        let port = InPort::with_capacity(1);
        port.push(blob(0), Duration::from_millis(5)).unwrap();
        let started = Instant::now();
        let err = port.push(blob(1), Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, FlowError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_blocked_producer_resumes_after_pop() {
        let port = Arc::new(InPort::with_capacity(1));
        port.push(blob(0), Duration::ZERO).unwrap();

        let producer = {
            let port = Arc::clone(&port);
            thread::spawn(move || port.push(blob(1), Duration::ZERO))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(port.pop().unwrap().frame_id, 0);
        producer.join().unwrap().unwrap();
        assert_eq!(port.pop().unwrap().frame_id, 1);
    }

    #[test]
    fn test_discard_policy_keeps_first_k() {
        let port = InPort::with_capacity(3);
        port.set_queue_policy(QueuePolicy::DiscardIfFull);
        for i in 0..10 {
            port.push(blob(i), Duration::from_millis(1)).unwrap();
        }
        assert_eq!(port.len(), 3);
        let kept: Vec<u32> = std::iter::from_fn(|| port.pop()).map(|b| b.frame_id).collect();
        assert_eq!(kept, [0, 1, 2]);
    }

    #[test]
    fn test_stop_wakes_blocked_producer_with_eos() {
        let port = Arc::new(InPort::with_capacity(1));
        port.push(blob(0), Duration::ZERO).unwrap();

        let producer = {
            let port = Arc::clone(&port);
            thread::spawn(move || port.push(blob(1), Duration::ZERO))
        };
        thread::sleep(Duration::from_millis(20));
        port.transit_state_to_stop_forced();
        let err = producer.join().unwrap().unwrap_err();
        assert!(matches!(err, FlowError::EndOfStream));
    }

    #[test]
    fn test_push_after_stop_is_eos() {
        let port = InPort::new();
        port.transit_state_to_stop_forced();
        assert!(matches!(
            port.push(blob(0), Duration::from_millis(1)),
            Err(FlowError::EndOfStream)
        ));
    }

    #[test]
    fn test_take_matching_preserves_rest() {
        let port = InPort::new();
        for i in 0..4 {
            port.push(blob(i), Duration::from_millis(1)).unwrap();
        }
        let taken = port.take_matching(|b| b.frame_id == 2).unwrap();
        assert_eq!(taken.frame_id, 2);
        let rest: Vec<u32> = std::iter::from_fn(|| port.pop()).map(|b| b.frame_id).collect();
        assert_eq!(rest, [0, 1, 3]);
    }

    #[test]
    fn test_out_port_fans_out_shared_blob() {
        let out = Arc::new(OutPort::new());
        let a = Arc::new(InPort::new());
        let b = Arc::new(InPort::new());
        out.link_to(Arc::clone(&a));
        out.link_to(Arc::clone(&b));

        out.send(blob(7), Duration::from_millis(5)).unwrap();
        let from_a = a.pop().unwrap();
        let from_b = b.pop().unwrap();
        assert!(Arc::ptr_eq(&from_a, &from_b));
    }

    #[test]
    fn test_out_port_convert_applied_once() {
        let out = Arc::new(OutPort::new());
        let sink = Arc::new(InPort::new());
        out.link_to(Arc::clone(&sink));
        out.set_convert_fn(Arc::new(|blob| {
            let mut converted = Blob::with_ids(blob.stream_id, blob.frame_id + 100);
            converted.context = blob.context;
            converted.share()
        }));

        out.send(blob(1), Duration::from_millis(5)).unwrap();
        assert_eq!(sink.pop().unwrap().frame_id, 101);
    }

    #[test]
    fn test_clear_empties_queue() {
        let port = InPort::new();
        for i in 0..3 {
            port.push(blob(i), Duration::from_millis(1)).unwrap();
        }
        port.clear();
        assert!(port.is_empty());
        assert!(port.pop().is_none());
    }
}
