use crate::devices::DeviceParseError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: pty_session::PtyError,
    },

    /// The interpreter terminated; the session is permanently unusable
    /// and must be restarted by the owning application.
    #[error("interpreter exited (code {code:?})")]
    ProcessExited { code: Option<i32> },

    /// The session actor is gone (process exit or write failure already
    /// tore it down).
    #[error("session is stopped")]
    Stopped,

    /// Writing to the interpreter's input stream failed; fatal for the
    /// session.
    #[error("failed to write to interpreter: {0}")]
    Write(String),

    /// The enumeration response was malformed. Contained at the command
    /// boundary: the session itself is back to idle and usable.
    #[error(transparent)]
    Parse(#[from] DeviceParseError),

    /// The caller stopped waiting. The command may still complete behind
    /// the scenes; treat this as "result unknown", not "command failed".
    #[error("no reply within the configured timeout (result unknown)")]
    ReplyTimeout,

    /// A playback was requested before any enumeration command ran.
    #[error("no active MIDI output port; initialize the session first")]
    NoActivePort,

    #[error(transparent)]
    Pty(#[from] pty_session::PtyError),

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}
