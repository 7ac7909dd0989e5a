//! Quiescence-based framing of an unterminated response.
//!
//! The interpreter never says "response complete"; it just goes quiet.
//! Every line re-arms a deadline one quiescence window into the future,
//! and the deadline firing means the buffered lines are the response.

use std::time::Duration;

use tokio::time::Instant;

pub(crate) struct ResponseAggregator {
    lines: Vec<String>,
    window: Duration,
    deadline: Instant,
}

impl ResponseAggregator {
    /// The deadline is armed immediately: a command that produces no
    /// output at all (not even a prompt echo) still finalizes after one
    /// window instead of wedging the session.
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            lines: Vec::new(),
            window,
            deadline: Instant::now() + window,
        }
    }

    pub(crate) fn push(&mut self, line: String) {
        self.lines.push(line);
        self.deadline = Instant::now() + self.window;
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

/// True for lines that carry no information: empty lines and lines that
/// are nothing but one or more prompt echoes. Such lines still count for
/// quiescence (they reset the timer on arrival) but are kept away from
/// logging and from structured parsers.
pub(crate) fn is_prompt_echo(line: &str, prompt: &str) -> bool {
    let mut rest = line.trim();
    if prompt.is_empty() {
        return rest.is_empty();
    }
    while let Some(stripped) = rest.strip_prefix(prompt) {
        rest = stripped.trim_start();
    }
    rest.is_empty()
}
