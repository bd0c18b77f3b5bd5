// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! CPU/GPU epoch tracking.
//!
//! The CPU epoch counts signalled submissions.  Every submission that should be tracked takes an
//! event from [GpuEpochTracker::get_event], asks the backend to set it when the submission completes,
//! and reports it with [GpuEpochTracker::on_event_submission], which bumps the CPU epoch and records
//! `(event, epoch)` in a ring.  When the oldest event in the ring is observed set, the GPU is known
//! to have finished everything up to that epoch.
//!
//! Invariants every cache relies on:
//!
//! - the GPU epoch never decreases,
//! - the GPU epoch never exceeds the CPU epoch.

use crate::backend::{Backend, WaitResult};
use crate::handles::EventHandle;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
#[cfg(not(target_arch = "wasm32"))]
use std::time::Instant;
use wasm_safe_mutex::Mutex;
#[cfg(target_arch = "wasm32")]
use web_time::Instant;

#[derive(Debug, Default)]
struct EventRing {
    in_flight: VecDeque<(EventHandle, u64)>,
    idle: Vec<EventHandle>,
    num_created: usize,
}

pub struct GpuEpochTracker<B: Backend> {
    backend: Arc<B>,
    capacity: usize,
    events: Mutex<EventRing>,
    cpu_epoch: AtomicU64,
    gpu_epoch: AtomicU64,
}

impl<B: Backend> GpuEpochTracker<B> {
    /// `max_events_in_flight` bounds both the event pool and the ring of outstanding submissions;
    /// size it for the deepest frame pipelining you expect.
    pub fn new(backend: Arc<B>, max_events_in_flight: usize) -> Self {
        assert!(max_events_in_flight > 0, "epoch tracker needs at least one event");
        GpuEpochTracker {
            backend,
            capacity: max_events_in_flight,
            events: Mutex::new(EventRing {
                in_flight: VecDeque::with_capacity(max_events_in_flight),
                ..Default::default()
            }),
            cpu_epoch: AtomicU64::new(0),
            gpu_epoch: AtomicU64::new(0),
        }
    }

    /**
    Returns an event to signal at the end of the next submission.

    If the oldest outstanding event has been set, the GPU epoch advances to its epoch and that event
    is recycled.  Otherwise an idle event is reused, or a new one created.

    # Panics
    If the pool would grow past its capacity.  More events are alive than frames can be in flight,
    so somebody is leaking them.
    */
    pub fn get_event(&self) -> EventHandle {
        let mut ring = self.events.lock_sync();
        if let Some(&(event, epoch)) = ring.in_flight.front() {
            if self.backend.clear_event(event) {
                ring.in_flight.pop_front();
                self.advance_gpu_epoch(epoch);
                return event;
            }
        }
        if let Some(event) = ring.idle.pop() {
            return event;
        }
        assert!(
            ring.num_created < self.capacity,
            "GPU event pool exhausted ({capacity} events); events are leaking upstream",
            capacity = self.capacity
        );
        ring.num_created += 1;
        self.backend.create_event()
    }

    /**
    Records that `event` was submitted to be set on completion.  Returns the new CPU epoch, which is
    the epoch the GPU reaches once the event is observed set.

    # Panics
    If the ring is full, i.e. more submissions are outstanding than the configured maximum.
    */
    pub fn on_event_submission(&self, event: EventHandle) -> u64 {
        let mut ring = self.events.lock_sync();
        assert!(
            ring.in_flight.len() < self.capacity,
            "GPU epoch ring full ({capacity} submissions outstanding)",
            capacity = self.capacity
        );
        let epoch = self.cpu_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        ring.in_flight.push_back((event, epoch));
        epoch
    }

    /// Retires every set event at the front of the ring and returns the GPU epoch.
    pub fn poll(&self) -> u64 {
        let mut ring = self.events.lock_sync();
        while let Some(&(event, epoch)) = ring.in_flight.front() {
            if !self.backend.clear_event(event) {
                break;
            }
            ring.in_flight.pop_front();
            ring.idle.push(event);
            self.advance_gpu_epoch(epoch);
        }
        self.current_gpu_epoch()
    }

    fn advance_gpu_epoch(&self, epoch: u64) {
        debug_assert!(epoch <= self.current_cpu_epoch());
        self.gpu_epoch.fetch_max(epoch, Ordering::AcqRel);
    }

    pub fn current_cpu_epoch(&self) -> u64 {
        self.cpu_epoch.load(Ordering::Acquire)
    }

    pub fn current_gpu_epoch(&self) -> u64 {
        self.gpu_epoch.load(Ordering::Acquire)
    }

    /// Number of submissions whose completion has not been observed yet.
    pub fn num_outstanding(&self) -> usize {
        self.events.lock_sync().in_flight.len()
    }

    /// Polls until the GPU epoch reaches `epoch` or `timeout` elapses.
    pub fn wait_for_gpu_epoch(&self, epoch: u64, timeout: Duration) -> WaitResult {
        let start = Instant::now();
        loop {
            if self.poll() >= epoch {
                return WaitResult::Ready;
            }
            if start.elapsed() >= timeout {
                return WaitResult::TimedOut;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    /// Resolves once the GPU epoch reaches `epoch`.
    pub async fn gpu_epoch_reached(&self, epoch: u64) {
        while self.poll() < epoch {
            portable_async_sleep::async_sleep(Duration::from_millis(1)).await;
        }
    }
}

impl<B: Backend> Drop for GpuEpochTracker<B> {
    fn drop(&mut self) {
        let mut ring = self.events.lock_sync();
        let in_flight = ring.in_flight.drain(..).map(|(e, _)| e).collect::<Vec<_>>();
        let idle = std::mem::take(&mut ring.idle);
        for event in in_flight.into_iter().chain(idle) {
            self.backend.free_event(event);
        }
    }
}

impl<B: Backend> Debug for GpuEpochTracker<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuEpochTracker")
            .field("cpu_epoch", &self.current_cpu_epoch())
            .field("gpu_epoch", &self.current_gpu_epoch())
            .field("capacity", &self.capacity)
            .finish()
    }
}
