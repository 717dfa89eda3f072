//! Scripted task behaviour

use chrono::{DateTime, Utc};
use std::time::Duration;

/// What a simulated task does once launched.
///
/// Timings are relative to the launch: the log stream appears after
/// `log_delay`, line `i` is written at `log_delay + i * line_interval`, and
/// the task stops after `run_time` (never before its last line).
#[derive(Debug, Clone, PartialEq)]
pub struct TaskScript {
    pub lines: Vec<String>,
    pub exit_code: i32,
    /// Before `describe_task` sees the task at all
    pub visibility_delay: Duration,
    /// Before the task leaves PENDING
    pub pending_for: Duration,
    /// Before the log stream exists
    pub log_delay: Duration,
    pub line_interval: Duration,
    pub run_time: Duration,
}

impl Default for TaskScript {
    fn default() -> Self {
        Self {
            lines: Vec::new(),
            exit_code: 0,
            visibility_delay: Duration::ZERO,
            pending_for: Duration::from_millis(20),
            log_delay: Duration::from_millis(50),
            line_interval: Duration::from_millis(10),
            run_time: Duration::from_millis(150),
        }
    }
}

impl TaskScript {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Prints its command line once, like `echo`
    pub fn echo(command: &[String]) -> Self {
        Self::new([command.join(" ")])
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_visibility_delay(mut self, delay: Duration) -> Self {
        self.visibility_delay = delay;
        self
    }

    pub fn with_pending_for(mut self, pending: Duration) -> Self {
        self.pending_for = pending;
        self
    }

    pub fn with_log_delay(mut self, delay: Duration) -> Self {
        self.log_delay = delay;
        self
    }

    pub fn with_line_interval(mut self, interval: Duration) -> Self {
        self.line_interval = interval;
        self
    }

    pub fn with_run_time(mut self, run_time: Duration) -> Self {
        self.run_time = run_time;
        self
    }

    /// Offset of line `index` from the launch
    pub fn line_offset(&self, index: usize) -> Duration {
        self.log_delay + self.line_interval * index as u32
    }

    /// Offset at which the task stops on its own
    pub fn stop_offset(&self) -> Duration {
        let last_line = self.line_offset(self.lines.len()) + self.line_interval;
        self.run_time.max(last_line)
    }
}

pub(crate) fn at(started: DateTime<Utc>, offset: Duration) -> DateTime<Utc> {
    started + chrono::Duration::from_std(offset).unwrap_or(chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_waits_for_last_line() {
        let script = TaskScript::new(["a", "b", "c"])
            .with_log_delay(Duration::from_millis(100))
            .with_line_interval(Duration::from_millis(50))
            .with_run_time(Duration::from_millis(10));
        assert_eq!(script.line_offset(0), Duration::from_millis(100));
        assert_eq!(script.line_offset(2), Duration::from_millis(200));
        assert_eq!(script.stop_offset(), Duration::from_millis(300));

        let slow = script.with_run_time(Duration::from_secs(1));
        assert_eq!(slow.stop_offset(), Duration::from_secs(1));
    }

    #[test]
    fn test_echo() {
        let script = TaskScript::echo(&["echo".to_string(), "hi".to_string()]);
        assert_eq!(script.lines, vec!["echo hi".to_string()]);
        assert_eq!(script.exit_code, 0);
    }
}
