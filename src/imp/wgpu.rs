// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
A [Fence] over a wgpu queue.

wgpu has no user-visible timeline semaphores.  Instead we register an
[wgpu::Queue::on_submitted_work_done] callback per signal, which raises a shared counter once the
GPU finishes everything submitted before it.  Callbacks only run while the device is polled, so
reads and waits poll.
*/

use crate::backend::{Fence, WaitResult};
use crate::handles::QueueType;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use wgpu::PollType;

#[derive(Debug)]
pub struct WgpuFence {
    device: wgpu::Device,
    queue: wgpu::Queue,
    completed: Arc<AtomicU64>,
}

impl WgpuFence {
    /// wgpu exposes a single queue per device, so every [QueueType] signals through `queue`.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        WgpuFence {
            device,
            queue,
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    fn poll(&self) {
        if let Err(e) = self.device.poll(PollType::Poll) {
            logwise::warn_sync!("wgpu poll failed: {e}", e = logwise::privacy::LogIt(&e));
        }
    }
}

impl Fence for WgpuFence {
    fn signal_gpu(&self, value: u64, _queue: QueueType) {
        let completed = self.completed.clone();
        //covers everything submitted to the queue so far
        self.queue.on_submitted_work_done(move || {
            completed.fetch_max(value, Ordering::AcqRel);
        });
    }

    fn current_value(&self) -> u64 {
        self.poll();
        self.completed.load(Ordering::Acquire)
    }

    fn wait_cpu(&self, value: u64, timeout: Duration) -> WaitResult {
        let start = Instant::now();
        let _interval = logwise::perfwarn_begin!("WgpuFence::wait_cpu");
        loop {
            if self.current_value() >= value {
                return WaitResult::Ready;
            }
            if start.elapsed() >= timeout {
                return WaitResult::TimedOut;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }
}
