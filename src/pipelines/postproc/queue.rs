// SPDX-License-Identifier: GPL-3.0-only

//! Thread-safe FIFO job queue with an admission switch
//!
//! A queue starts inactive. While inactive every enqueue is refused and the
//! item is handed back to the caller, who owns its cleanup. `flush` drains
//! the queue, deactivates it and returns whatever was pending.

use parking_lot::Mutex;
use std::collections::VecDeque;

struct State<T> {
    items: VecDeque<T>,
    active: bool,
}

pub struct JobQueue<T> {
    name: &'static str,
    state: Mutex<State<T>>,
}

impl<T> JobQueue<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(State {
                items: VecDeque::new(),
                active: false,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Start accepting jobs
    pub fn init(&self) {
        self.state.lock().active = true;
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Append `item`; an inactive queue returns it untouched
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(item);
        }
        state.items.push_back(item);
        Ok(())
    }

    pub fn dequeue(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Remove the most recently enqueued job
    pub fn dequeue_last(&self) -> Option<T> {
        self.state.lock().items.pop_back()
    }

    /// Inspect the head without removing it
    pub fn peek_with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        f(self.state.lock().items.front())
    }

    /// Remove the head only if `admit` accepts it
    pub fn dequeue_if(&self, admit: impl FnOnce(&T) -> bool) -> Option<T> {
        let mut state = self.state.lock();
        match state.items.front() {
            Some(head) if admit(head) => state.items.pop_front(),
            _ => None,
        }
    }

    /// Remove every job matching `pred`, keeping the order of the rest
    pub fn take_matching(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut state = self.state.lock();
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(state.items.len());
        for item in state.items.drain(..) {
            if pred(&item) {
                taken.push(item);
            } else {
                kept.push_back(item);
            }
        }
        state.items = kept;
        taken
    }

    /// Drain and deactivate
    pub fn flush(&self) -> Vec<T> {
        let mut state = self.state.lock();
        state.active = false;
        state.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}

impl<T> std::fmt::Debug for JobQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("JobQueue")
            .field("name", &self.name)
            .field("len", &state.items.len())
            .field("active", &state.active)
            .finish()
    }
}
