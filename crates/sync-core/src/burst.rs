/// Classifies a client's current author type from write cadence.
///
/// Agents save in rapid spurts; humans do not. Three consecutive writes with
/// sub-50ms gaps flip the classification to agent until two quiet seconds pass.
use std::collections::VecDeque;

use crate::constants::{
    AI_BURST_COUNT, AI_BURST_DEBOUNCE_MS, AI_BURST_SILENCE_MS, AI_BURST_THRESHOLD_MS,
    AI_BURST_WINDOW, DEBOUNCE_MS,
};
use crate::{AuthorKind, LockKind};

#[derive(Debug, Default)]
pub struct BurstDetector {
    writes: VecDeque<i64>,
    burst_until: Option<i64>,
}

impl BurstDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one filesystem write and re-evaluate the burst state.
    pub fn record_write(&mut self, now_ms: i64) {
        self.writes.push_back(now_ms);
        while self.writes.len() > AI_BURST_WINDOW {
            self.writes.pop_front();
        }

        if self.writes.len() >= AI_BURST_COUNT {
            let tail: Vec<i64> = self
                .writes
                .iter()
                .skip(self.writes.len() - AI_BURST_COUNT)
                .copied()
                .collect();
            let rapid = tail
                .windows(2)
                .all(|pair| pair[1] - pair[0] < AI_BURST_THRESHOLD_MS);
            if rapid {
                self.burst_until = Some(now_ms + AI_BURST_SILENCE_MS);
            }
        }
    }

    pub fn in_burst(&self, now_ms: i64) -> bool {
        self.burst_until.is_some_and(|until| now_ms < until)
    }

    pub fn author_kind(&self, now_ms: i64) -> AuthorKind {
        if self.in_burst(now_ms) {
            AuthorKind::Agent
        } else {
            AuthorKind::Human
        }
    }

    pub fn lock_kind(&self, now_ms: i64) -> LockKind {
        if self.in_burst(now_ms) {
            LockKind::AgentWriting
        } else {
            LockKind::Editing
        }
    }

    /// Debounce duration for the next flush: shortened while agents generate.
    pub fn debounce_ms(&self, now_ms: i64) -> u64 {
        if self.in_burst(now_ms) {
            AI_BURST_DEBOUNCE_MS
        } else {
            DEBOUNCE_MS
        }
    }
}
