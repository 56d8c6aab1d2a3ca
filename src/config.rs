//! Pipeline configuration

use std::time::Duration;

/// Tunables for the agent hierarchy
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of the coordinator's sub-coordinator pool
    pub sub_coordinators: usize,
    /// Workers owned by each sub-coordinator
    pub workers_per_sub: usize,
    /// Heartbeat ticker period for every agent
    pub heartbeat_interval: Duration,
    /// Sub-coordinator fan-in deadline
    pub dispatch_timeout: Duration,
    /// Coordinator-level deadline before a task is finalized as timed out
    pub task_timeout: Duration,
    /// Character budget for the fallback sentence-accumulation chunker
    pub chunk_char_budget: usize,
    /// Context snippets requested per chunk (`k`)
    pub context_snippets: usize,
    /// Bullet cap for each per-document summary in the final report
    pub max_report_bullets: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sub_coordinators: 2,
            workers_per_sub: 3,
            heartbeat_interval: Duration::from_secs(5),
            dispatch_timeout: Duration::from_secs(30),
            task_timeout: Duration::from_secs(30),
            chunk_char_budget: 200,
            context_snippets: 3,
            max_report_bullets: 8,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sub_coordinators(mut self, count: usize) -> Self {
        self.sub_coordinators = count;
        self
    }

    pub fn workers_per_sub(mut self, count: usize) -> Self {
        self.workers_per_sub = count;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn chunk_char_budget(mut self, budget: usize) -> Self {
        self.chunk_char_budget = budget;
        self
    }

    pub fn context_snippets(mut self, k: usize) -> Self {
        self.context_snippets = k;
        self
    }

    pub fn max_report_bullets(mut self, cap: usize) -> Self {
        self.max_report_bullets = cap;
        self
    }
}
