//! Session tunables.
//!
//! The two timing knobs trade responsiveness against correctness margin:
//! a shorter quiescence window finalizes faster but risks splitting one
//! response in two on a slow host, so both are configuration rather than
//! constants.

use std::time::Duration;

use pty_session::PtyConfig;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interpreter binary to spawn.
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
    /// Prompt token the interpreter prints between responses.
    pub prompt: String,
    /// The enumeration command: its response is parsed into the device
    /// table, and its carried parameter becomes the active output port.
    pub init_command: String,
    /// Command that asks the interpreter to terminate itself.
    pub quit_command: String,
    /// Silence on the output stream for this long means "response complete".
    pub quiescence_ms: u64,
    /// Upper bound a caller waits for a command's finalization.
    pub reply_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: "sclang".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
            prompt: "sc3>".to_string(),
            init_command: "MIDIClient.init;".to_string(),
            quit_command: "0.exit;".to_string(),
            quiescence_ms: default_quiescence_ms(),
            reply_timeout_secs: default_reply_timeout_secs(),
        }
    }
}

fn default_quiescence_ms() -> u64 {
    100
}

fn default_reply_timeout_secs() -> u64 {
    5
}

impl SessionConfig {
    pub fn quiescence_window(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    pub(crate) fn pty_config(&self) -> PtyConfig {
        PtyConfig {
            command: self.command.clone(),
            args: self.args.clone(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            rows: self.rows,
            cols: self.cols,
        }
    }
}
