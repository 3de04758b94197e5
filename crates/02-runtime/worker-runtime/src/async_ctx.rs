//! Asynchronous event delivery with a blockable critical window.
//!
//! Transports may raise events (connection requests, for instance) from a
//! context other than the worker's progress loop. While a [`AsyncBlockGuard`]
//! is alive those events are parked as *missed* and replayed when the last
//! guard drops, so code holding a block never races with event handlers.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;

pub type AsyncEvent = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct AsyncState {
    blocked: u32,
    missed: VecDeque<AsyncEvent>,
}

#[derive(Default)]
pub struct AsyncContext {
    state: Mutex<AsyncState>,
}

impl AsyncContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defers event delivery until the returned guard (and every other
    /// outstanding guard) is dropped. Guards nest.
    pub fn block(&self) -> AsyncBlockGuard<'_> {
        self.state.lock().blocked += 1;
        AsyncBlockGuard { ctx: self }
    }

    pub fn is_blocked(&self) -> bool {
        self.state.lock().blocked > 0
    }

    /// Number of events parked while blocked.
    pub fn missed_count(&self) -> usize {
        self.state.lock().missed.len()
    }

    /// Runs `event` now, or parks it if delivery is blocked.
    pub fn deliver<F>(&self, event: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.blocked > 0 {
            state.missed.push_back(Box::new(event));
            tracing::trace!(missed = state.missed.len(), "async delivery blocked, event parked");
            return;
        }
        drop(state);
        event();
    }

    fn unblock(&self) {
        let missed = {
            let mut state = self.state.lock();
            state.blocked -= 1;
            if state.blocked > 0 || state.missed.is_empty() {
                return;
            }
            std::mem::take(&mut state.missed)
        };
        tracing::trace!(count = missed.len(), "dispatching missed async events");
        for event in missed {
            event();
        }
    }
}

impl fmt::Debug for AsyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AsyncContext")
            .field("blocked", &state.blocked)
            .field("missed", &state.missed.len())
            .finish()
    }
}

/// Keeps async delivery blocked while alive.
#[must_use = "async delivery is unblocked as soon as the guard drops"]
pub struct AsyncBlockGuard<'a> {
    ctx: &'a AsyncContext,
}

impl Drop for AsyncBlockGuard<'_> {
    fn drop(&mut self) {
        self.ctx.unblock();
    }
}
