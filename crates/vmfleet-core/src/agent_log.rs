use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;

use crate::time::log_stamp;

/// Default number of lines retained per agent.
pub const DEFAULT_LOG_LINES: usize = 500;

/// Operational log owned by one agent.
///
/// This is what the owner of a node sees when a launch or shutdown goes
/// wrong; the system-wide log receives the same failures through `tracing`.
/// Oldest lines are dropped once `capacity` is reached.
#[derive(Debug)]
pub struct AgentLog {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Default for AgentLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_LINES)
    }
}

impl AgentLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
        }
    }

    /// Append one line.
    pub fn println(&self, msg: impl AsRef<str>) {
        let line = format!("[{}] {}", log_stamp(Utc::now()), msg.as_ref());
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Append a failure line.
    pub fn fatal_error(&self, msg: impl AsRef<str>) {
        self.println(format!("FATAL: {}", msg.as_ref()));
    }

    /// Snapshot of the retained lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }

    /// Number of retained lines containing `needle`.
    pub fn count_containing(&self, needle: &str) -> usize {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().filter(|l| l.contains(needle)).count()
    }
}
