use anyhow::Context;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, info, warn};

use crate::error::PtyError;

/// Configuration for spawning an interpreter under a PTY
#[derive(Clone, Debug)]
pub struct PtyConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            command: "/bin/sh".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
        }
    }
}

/// Output event from a PTY session.
///
/// `Exited` is broadcast exactly once, after the last `Line`.
#[derive(Clone, Debug)]
pub enum PtyEvent {
    /// One complete output line, `\r\n` stripped
    Line { text: String, timestamp: i64 },
    /// The child process terminated
    Exited { code: Option<i32> },
}

/// Messages that can be sent to the PTY actor
pub(crate) enum PtyMessage {
    WriteLine {
        text: String,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    Kill {
        signal: Option<String>,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
}

/// Handle to communicate with a PTY session actor
#[derive(Clone)]
pub struct PtyHandle {
    sender: mpsc::Sender<PtyMessage>,
    event_tx: broadcast::Sender<PtyEvent>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Write `text` plus a trailing newline to the child's input stream
    pub async fn write_line(&self, text: &str) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::WriteLine {
                text: text.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelError("Failed to send write message".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelError("Failed to receive write response".into()))?
    }

    /// Kill the child process (SIGTERM by default, or "SIGKILL")
    pub async fn kill(&self, signal: Option<&str>) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Kill {
                signal: signal.map(|s| s.to_string()),
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelError("Failed to send kill message".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelError("Failed to receive kill response".into()))?
    }

    /// Subscribe to output lines and the exit event
    pub fn subscribe(&self) -> broadcast::Receiver<PtyEvent> {
        self.event_tx.subscribe()
    }

    /// PID of the child process, if the OS reported one
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// The actor that owns one PTY session
pub struct PtySession {
    master: Box<dyn MasterPty + Send>,
    writer: Option<Box<dyn Write + Send>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    receiver: mpsc::Receiver<PtyMessage>,
    event_rx: broadcast::Receiver<PtyEvent>,
    exited: bool,
}

impl PtySession {
    /// Spawn the configured command under a fresh PTY and return a handle to it.
    ///
    /// The PTY matters beyond I/O plumbing: interpreters like sclang only
    /// line-buffer (and prompt) when attached to a terminal.
    pub fn spawn(config: PtyConfig) -> Result<PtyHandle, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")
            .map_err(PtyError::from)?;

        let mut cmd = CommandBuilder::new(&config.command);
        for arg in &config.args {
            cmd.arg(arg);
        }

        if let Some(dir) = &config.working_dir {
            info!("Setting working directory: {}", dir);
            cmd.cwd(dir);
        }

        // Set environment for proper terminal behavior
        cmd.env("TERM", "xterm-256color");

        // Inherit PATH and other essential environment variables
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", home);
        }
        if let Ok(user) = std::env::var("USER") {
            cmd.env("USER", user);
        }

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        info!(
            "Spawning PTY command: {} with args: {:?}",
            config.command, config.args
        );

        let mut child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn command '{}': {}", config.command, e);
            PtyError::CreateFailed(e.to_string())
        })?;

        let pid = child.process_id();
        info!("PTY process started with PID: {:?}", pid);

        let killer = child.clone_killer();
        let (event_tx, event_rx) = broadcast::channel(1024);
        let (msg_tx, msg_rx) = mpsc::channel(32);

        let mut actor = Self {
            master: pair.master,
            writer: None,
            killer,
            pid,
            receiver: msg_rx,
            event_rx,
            exited: false,
        };

        let event_tx_clone = event_tx.clone();
        let mut reader = actor
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")
            .map_err(PtyError::from)?;

        // Blocking thread: split the raw output into lines, then (after EOF)
        // reap the child so the exit event is ordered after the last line.
        std::thread::spawn(move || {
            let mut pending: Vec<u8> = Vec::new();
            let mut buffer = vec![0u8; 4096];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        info!("PTY EOF detected - process has exited");
                        break;
                    }
                    Ok(n) => {
                        pending.extend_from_slice(&buffer[..n]);
                        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                            let mut raw: Vec<u8> = pending.drain(..=pos).collect();
                            raw.pop();
                            if raw.last() == Some(&b'\r') {
                                raw.pop();
                            }
                            let _ = event_tx_clone.send(PtyEvent::Line {
                                text: String::from_utf8_lossy(&raw).to_string(),
                                timestamp: chrono::Utc::now().timestamp_millis(),
                            });
                        }
                    }
                    Err(e) => {
                        warn!("Error reading PTY output: {}", e);
                        break;
                    }
                }
            }
            if !pending.is_empty() {
                let _ = event_tx_clone.send(PtyEvent::Line {
                    text: String::from_utf8_lossy(&pending).to_string(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
            }
            let code = match child.wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(e) => {
                    warn!("Failed to reap PTY child: {}", e);
                    None
                }
            };
            info!("PTY process exited with code: {:?}", code);
            let _ = event_tx_clone.send(PtyEvent::Exited { code });
        });

        // Spawn the actor task
        tokio::spawn(async move {
            actor.run().await;
        });

        Ok(PtyHandle {
            sender: msg_tx,
            event_tx,
            pid,
        })
    }

    async fn run(&mut self) {
        info!("PTY actor started with PID: {:?}", self.pid);

        // Take the writer immediately to keep the PTY stdin open
        if self.writer.is_none() {
            match self.master.take_writer() {
                Ok(writer) => {
                    self.writer = Some(writer);
                }
                Err(e) => {
                    error!("Failed to get PTY writer: {}", e);
                }
            }
        }

        loop {
            tokio::select! {
                msg = self.receiver.recv() => match msg {
                    Some(PtyMessage::WriteLine { text, respond_to }) => {
                        let result = if self.exited {
                            Err(PtyError::ProcessExited)
                        } else {
                            self.handle_write_line(&text)
                        };
                        let _ = respond_to.send(result);
                    }
                    Some(PtyMessage::Kill { signal, respond_to }) => {
                        // Killing an already-reaped child is a no-op success.
                        if self.exited {
                            let _ = respond_to.send(Ok(()));
                            break;
                        }
                        let result = self.handle_kill(signal);
                        let is_ok = result.is_ok();
                        let _ = respond_to.send(result);
                        if is_ok {
                            break;
                        }
                    }
                    None => break,
                },
                ev = self.event_rx.recv() => match ev {
                    // Stay alive to answer later writes with ProcessExited;
                    // the dead child itself must not be touched again.
                    Ok(PtyEvent::Exited { .. }) => self.exited = true,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }

        info!("PTY actor shutting down");
    }

    fn handle_write_line(&mut self, text: &str) -> Result<(), PtyError> {
        if self.writer.is_none() {
            self.writer = Some(
                self.master
                    .take_writer()
                    .map_err(|e| PtyError::WriteFailed(e.to_string()))?,
            );
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PtyError::WriteFailed("No PTY writer available".into()))?;

        writer
            .write_all(text.as_bytes())
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        writer
            .write_all(b"\n")
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;

        Ok(())
    }

    fn handle_kill(&mut self, signal: Option<String>) -> Result<(), PtyError> {
        match signal.as_deref() {
            Some("SIGTERM") | None => {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{Signal, kill};
                    use nix::unistd::Pid;

                    if let Some(pid) = self.pid {
                        kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                            .map_err(|e| PtyError::KillFailed(e.to_string()))?;
                    }
                }
                #[cfg(not(unix))]
                {
                    self.killer
                        .kill()
                        .map_err(|e| PtyError::KillFailed(e.to_string()))?;
                }
            }
            Some("SIGKILL") => {
                self.killer
                    .kill()
                    .map_err(|e| PtyError::KillFailed(e.to_string()))?;
            }
            Some(sig) => {
                return Err(PtyError::KillFailed(format!("Unsupported signal: {}", sig)));
            }
        }

        Ok(())
    }
}
