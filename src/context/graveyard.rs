// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Objects waiting for the GPU before they can be destroyed.

use std::collections::VecDeque;

/// FIFO of `(epoch, T)`.  An entry may be destroyed once the GPU epoch reaches its epoch.
#[derive(Debug)]
pub(crate) struct Graveyard<T> {
    entries: VecDeque<(u64, T)>,
}

impl<T> Graveyard<T> {
    pub(crate) fn new() -> Self {
        Graveyard {
            entries: VecDeque::new(),
        }
    }

    pub(crate) fn bury(&mut self, epoch: u64, item: T) {
        //epochs arrive in CPU order, but keep the queue sorted if two freeing threads raced
        let position = self
            .entries
            .iter()
            .rposition(|(e, _)| *e <= epoch)
            .map_or(0, |p| p + 1);
        self.entries.insert(position, (epoch, item));
    }

    /// Destroys every entry whose epoch is `<= gpu_epoch`, oldest first.
    pub(crate) fn drain(&mut self, gpu_epoch: u64, mut destroy: impl FnMut(T)) -> usize {
        let mut count = 0;
        while let Some((epoch, _)) = self.entries.front() {
            if *epoch > gpu_epoch {
                break;
            }
            if let Some((_, item)) = self.entries.pop_front() {
                destroy(item);
                count += 1;
            }
        }
        count
    }

    /// Destroys everything.  The GPU must be idle.
    pub(crate) fn drain_all(&mut self, destroy: impl FnMut(T)) -> usize {
        self.drain(u64::MAX, destroy)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
