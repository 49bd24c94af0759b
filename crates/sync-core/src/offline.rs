/// Outbound diffs produced while the relay is unreachable.
/// Drained FIFO after the reconnect handshake completes.
use std::collections::VecDeque;

use crate::FileDiff;

#[derive(Debug, Default)]
pub struct PendingQueue {
    diffs: VecDeque<FileDiff>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, diff: FileDiff) {
        self.diffs.push_back(diff);
    }

    /// Take everything, oldest first.
    pub fn drain(&mut self) -> Vec<FileDiff> {
        self.diffs.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }
}
