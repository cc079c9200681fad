// Single-deadline debouncer for index change bursts.
//
// One logical write shows up as several filesystem events (temp create,
// data write, rename). Every event pushes the deadline out to
// `now + window`; reconciliation runs once the deadline passes quietly.
// Window defaults to 100ms, clamped to 20–2000ms.

use std::time::Duration;

use tokio::time::Instant;

const DEFAULT_DEBOUNCE_MS: u64 = 100;
const MIN_DEBOUNCE_MS: u64 = 20;
const MAX_DEBOUNCE_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    pub window: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self { window: Duration::from_millis(DEFAULT_DEBOUNCE_MS) }
    }
}

impl DebounceConfig {
    /// Window in milliseconds, clamped to [20, 2000].
    pub fn with_millis(ms: u64) -> Self {
        Self { window: Duration::from_millis(ms.clamp(MIN_DEBOUNCE_MS, MAX_DEBOUNCE_MS)) }
    }
}

#[derive(Debug)]
pub struct Debouncer {
    config: DebounceConfig,
    deadline: Option<Instant>,
    coalesced: usize,
}

impl Debouncer {
    pub fn new(config: DebounceConfig) -> Self {
        Self { config, deadline: None, coalesced: 0 }
    }

    /// Record a change and restart the timer.
    pub fn push(&mut self) {
        self.push_at(Instant::now());
    }

    /// Like `push` but with a specific timestamp (for testing).
    pub(crate) fn push_at(&mut self, now: Instant) {
        self.deadline = Some(now + self.config.window);
        self.coalesced += 1;
    }

    /// When the pending burst becomes ready, if one is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// If the window has elapsed, clear it and return how many changes the
    /// burst coalesced.
    pub fn take_ready(&mut self) -> Option<usize> {
        self.take_ready_at(Instant::now())
    }

    /// Like `take_ready` but with a specific timestamp (for testing).
    pub(crate) fn take_ready_at(&mut self, now: Instant) -> Option<usize> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                Some(std::mem::take(&mut self.coalesced))
            }
            _ => None,
        }
    }

    /// Drop any pending burst.
    pub fn cancel(&mut self) {
        self.deadline = None;
        self.coalesced = 0;
    }
}
