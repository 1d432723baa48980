//! Deferred destruction keyed by frame serial.

use std::collections::VecDeque;

/// Resources waiting for every frame that may reference them to finish.
///
/// Tag each item with the serial of the newest frame that could have used
/// it (usually [`super::FrameScheduler::current_serial`]), then drain with
/// [`super::FrameScheduler::completed_serial`] after each `acquire`.
#[derive(Debug)]
pub struct RetireQueue<T> {
    items: VecDeque<(u64, T)>,
}

impl<T> Default for RetireQueue<T> {
    fn default() -> Self {
        Self { items: VecDeque::new() }
    }
}

impl<T> RetireQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `item` for release once frame `last_use_serial` has completed.
    pub fn retire(&mut self, last_use_serial: u64, item: T) {
        self.items.push_back((last_use_serial, item));
    }

    /// Remove and return every item whose frames have all completed.
    pub fn drain_completed(&mut self, completed_serial: u64) -> Vec<T> {
        let mut released = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for (serial, item) in self.items.drain(..) {
            if serial <= completed_serial {
                released.push(item);
            } else {
                kept.push_back((serial, item));
            }
        }
        self.items = kept;
        released
    }

    /// Remove everything, regardless of serial. Only valid after device idle.
    pub fn drain_all(&mut self) -> Vec<T> {
        self.items.drain(..).map(|(_, item)| item).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
