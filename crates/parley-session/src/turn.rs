//! Turn bookkeeping for barge-in.
//!
//! Two independent filters keep a cancelled turn silent: the epoch stamped
//! on each inbound event at read time, and the id of every response that was
//! cancelled. The epoch covers audio already in flight when the user spoke;
//! the response id covers deltas the service emits before it processes the
//! cancel.

use std::collections::VecDeque;

use parley_core::types::{Epoch, EpochGate};

/// Cancelled response ids remembered for filtering late deltas.
const CANCELLED_HISTORY: usize = 16;

/// Fixed-capacity set of recently seen ids; the oldest is evicted first.
#[derive(Debug)]
pub struct RecentIds {
    ids: VecDeque<String>,
    capacity: usize,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn insert(&mut self, id: impl Into<String>) {
        let id = id.into();
        if self.capacity == 0 || self.contains(&id) {
            return;
        }
        if self.ids.len() == self.capacity {
            self.ids.pop_front();
        }
        self.ids.push_back(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|c| c == id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

pub struct TurnTracker {
    gate: EpochGate,
    response_id: Option<String>,
    cancelled: RecentIds,
}

/// Why an audio delta was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    StaleEpoch,
    CancelledResponse,
}

impl TurnTracker {
    pub fn new(gate: EpochGate) -> Self {
        Self {
            gate,
            response_id: None,
            cancelled: RecentIds::new(CANCELLED_HISTORY),
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.gate.current()
    }

    /// The response currently producing output, if known.
    pub fn response_id(&self) -> Option<&str> {
        self.response_id.as_deref()
    }

    pub fn response_started(&mut self, id: Option<&str>) {
        if let Some(id) = id.filter(|id| !self.is_cancelled(id)) {
            self.response_id = Some(id.to_string());
        }
    }

    pub fn response_finished(&mut self, id: Option<&str>) {
        if id.is_none() || id == self.response_id.as_deref() {
            self.response_id = None;
        }
    }

    pub fn is_cancelled(&self, id: &str) -> bool {
        self.cancelled.contains(id)
    }

    /// Decide whether audio stamped with `epoch` for `response_id` may play.
    pub fn check_audio(&mut self, epoch: Epoch, response_id: Option<&str>) -> Result<(), Rejection> {
        if !self.gate.is_current(epoch) {
            return Err(Rejection::StaleEpoch);
        }
        if let Some(id) = response_id {
            if self.is_cancelled(id) {
                return Err(Rejection::CancelledResponse);
            }
            if self.response_id.is_none() {
                self.response_id = Some(id.to_string());
            }
        }
        Ok(())
    }

    /// Invalidate the current turn. Returns the new epoch.
    pub fn interrupt(&mut self) -> Epoch {
        if let Some(id) = self.response_id.take() {
            self.cancelled.insert(id);
        }
        self.gate.advance()
    }
}
