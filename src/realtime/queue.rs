//! Bounded push-event queue with coalescing and drop-oldest backpressure.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

use super::PushEvent;

/// What happened to a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
  Queued,
  /// Replaced a pending event with the same type and key
  Coalesced,
  /// Queued after dropping the oldest pending event
  DroppedOldest,
  /// Queue is closed; event discarded
  Closed,
}

/// Counters for queue diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
  pub pending: usize,
  pub coalesced: u64,
  pub dropped: u64,
}

#[derive(Default)]
struct State {
  events: VecDeque<PushEvent>,
  closed: bool,
  coalesced: u64,
  dropped: u64,
}

pub struct PushQueue {
  state: Mutex<State>,
  notify: Notify,
  capacity: usize,
}

impl PushQueue {
  /// A capacity of zero is treated as one.
  pub fn new(capacity: usize) -> Self {
    Self {
      state: Mutex::new(State::default()),
      notify: Notify::new(),
      capacity: capacity.max(1),
    }
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Enqueue an event. With `coalesce`, a pending event with the same type
  /// and key is replaced in place and keeps its position.
  pub fn push(&self, event: PushEvent, coalesce: bool) -> PushOutcome {
    let outcome = {
      let mut state = self.lock();
      if state.closed {
        return PushOutcome::Closed;
      }
      let pending = if coalesce {
        state
          .events
          .iter()
          .position(|e| e.kind == event.kind && e.key == event.key)
      } else {
        None
      };
      if let Some(i) = pending {
        state.events[i] = event;
        state.coalesced += 1;
        PushOutcome::Coalesced
      } else if state.events.len() >= self.capacity {
        if let Some(old) = state.events.pop_front() {
          debug!(kind = %old.kind, "push queue full, dropping oldest event");
        }
        state.events.push_back(event);
        state.dropped += 1;
        PushOutcome::DroppedOldest
      } else {
        state.events.push_back(event);
        PushOutcome::Queued
      }
    };
    self.notify.notify_one();
    outcome
  }

  pub fn try_pop(&self) -> Option<PushEvent> {
    self.lock().events.pop_front()
  }

  /// Wait for the next event. Returns `None` once the queue is closed and drained.
  pub async fn pop(&self) -> Option<PushEvent> {
    loop {
      let notified = self.notify.notified();
      {
        let mut state = self.lock();
        if let Some(event) = state.events.pop_front() {
          return Some(event);
        }
        if state.closed {
          return None;
        }
      }
      notified.await;
    }
  }

  /// Stop accepting events. Pending events can still be drained.
  pub fn close(&self) {
    self.lock().closed = true;
    self.notify.notify_waiters();
  }

  pub fn is_closed(&self) -> bool {
    self.lock().closed
  }

  pub fn len(&self) -> usize {
    self.lock().events.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn stats(&self) -> QueueStats {
    let state = self.lock();
    QueueStats {
      pending: state.events.len(),
      coalesced: state.coalesced,
      dropped: state.dropped,
    }
  }
}
