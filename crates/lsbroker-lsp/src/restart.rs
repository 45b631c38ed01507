//! Per-project crash counting within a time window.
use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::types::ProjectPath;

/// Default number of restarts allowed inside one window.
pub const DEFAULT_RESTART_LIMIT: u32 = 5;

/// Default window length.
pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(3 * 60);

#[derive(Debug, Clone, Copy)]
struct Counter {
    crashes: u32,
    expires_at: Instant,
}

/// Counts crashes per project. The window opens at the first crash and
/// a project starts from a clean slate once it has elapsed.
#[derive(Debug)]
pub struct RestartTracker {
    limit: u32,
    window: Duration,
    counters: HashMap<ProjectPath, Counter>,
}

impl RestartTracker {
    /// Allow `limit` restarts per project inside each `window`.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            counters: HashMap::new(),
        }
    }

    /// Restarts allowed per window.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Length of each window.
    pub fn window(&self) -> Duration {
        self.window
    }

    fn live(&self, project: &ProjectPath) -> Option<&Counter> {
        self.counters
            .get(project)
            .filter(|counter| Instant::now() < counter.expires_at)
    }

    /// Count one crash for `project`. Returns true once the crashes in
    /// the current window exceed the limit. Expired counters of every
    /// project are dropped on the way.
    pub fn record_crash(&mut self, project: &ProjectPath) -> bool {
        let now = Instant::now();
        self.counters.retain(|_, counter| now < counter.expires_at);
        let window = self.window;
        let counter = self
            .counters
            .entry(project.clone())
            .or_insert(Counter {
                crashes: 0,
                expires_at: now + window,
            });
        counter.crashes += 1;
        counter.crashes > self.limit
    }

    /// Crashes counted in the current window.
    pub fn crashes(&self, project: &ProjectPath) -> u32 {
        self.live(project).map_or(0, |counter| counter.crashes)
    }

    /// True while `project` is over the limit and its window is open.
    pub fn is_blocked(&self, project: &ProjectPath) -> bool {
        self.crashes(project) > self.limit
    }

    /// Projects with a counter still held.
    pub fn tracked(&self) -> usize {
        self.counters.len()
    }

    /// Forget every counter.
    pub fn clear(&mut self) {
        self.counters.clear();
    }
}

/// [`DEFAULT_RESTART_LIMIT`] restarts per [`DEFAULT_RESTART_WINDOW`].
impl Default for RestartTracker {
    fn default() -> Self {
        Self::new(DEFAULT_RESTART_LIMIT, DEFAULT_RESTART_WINDOW)
    }
}
