use std::fmt;

/// Errors that can occur during PTY operations
#[derive(Debug)]
pub enum PtyError {
    /// Failed to create PTY or spawn the child process
    CreateFailed(String),
    /// Failed to write to the child's input stream
    WriteFailed(String),
    /// Failed to kill the child process
    KillFailed(String),
    /// The child process has exited
    ProcessExited,
    /// Channel communication error
    ChannelError(String),
}

impl fmt::Display for PtyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PtyError::CreateFailed(msg) => write!(f, "Failed to create PTY: {}", msg),
            PtyError::WriteFailed(msg) => write!(f, "Failed to write to PTY: {}", msg),
            PtyError::KillFailed(msg) => write!(f, "Failed to kill PTY process: {}", msg),
            PtyError::ProcessExited => write!(f, "PTY process has exited"),
            PtyError::ChannelError(msg) => write!(f, "Channel error: {}", msg),
        }
    }
}

impl std::error::Error for PtyError {}

impl From<anyhow::Error> for PtyError {
    fn from(err: anyhow::Error) -> Self {
        PtyError::CreateFailed(err.to_string())
    }
}
