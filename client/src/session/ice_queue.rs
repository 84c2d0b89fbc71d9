use std::collections::VecDeque;

use serde_json::Value;

/// Remote candidates that arrived before the remote description was set.
#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    pending: VecDeque<Value>,
}

impl IceCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: Value) {
        self.pending.push_back(candidate);
    }

    /// Takes every queued candidate in arrival order, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<Value> {
        self.pending.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
