//! The externally visible session object.
//!
//! `SclangSession` is an explicit, cloneable handle; nothing here is a
//! process-wide singleton. Each session owns exactly one interpreter
//! process, and all state mutations are serialized through the session
//! core's single task.

use std::sync::Arc;

use pty_session::{PtyEvent, PtyHandle, PtySession};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::correlator::{CoreHandle, CoreQuery, LineEvent, Submission, spawn_core};
use crate::devices::DeviceTable;
use crate::error::SessionError;

/// Drives note-on/off events for an already-decoded sequence against a
/// named output port. Timing is entirely the player's concern; the
/// session only supplies the port.
pub trait SequencePlayer {
    type Sequence;

    fn play(&self, sequence: &Self::Sequence, port: &str) -> anyhow::Result<()>;
}

/// Renders synth-program command lines with device parameters bound in.
/// The session sends the rendered lines one by one, fire-and-forget.
pub trait ProgramLoader {
    fn render(&self, devices: &DeviceTable) -> anyhow::Result<Vec<String>>;
}

/// A running interpreter session.
///
/// Cheap to clone; all clones talk to the same underlying process. Once
/// the process exits the session is permanently stopped and every call
/// returns an error; restarting is the owning application's job.
#[derive(Clone)]
pub struct SclangSession {
    core: CoreHandle,
    pty: PtyHandle,
    lines_out: broadcast::Sender<String>,
    config: SessionConfig,
}

impl SclangSession {
    /// Spawn the interpreter under a PTY and start the session actor.
    pub async fn start(config: SessionConfig) -> Result<Self, SessionError> {
        let pty = PtySession::spawn(config.pty_config()).map_err(|source| {
            SessionError::Spawn {
                command: config.command.clone(),
                source,
            }
        })?;

        let (event_tx, event_rx) = mpsc::channel(256);
        let (outbox_tx, mut outbox_rx) = mpsc::channel::<String>(32);
        let (lines_out, _) = broadcast::channel(1024);

        // Interpreter output, in arrival order, into the state machine.
        let mut pty_events = pty.subscribe();
        let events = event_tx.clone();
        tokio::spawn(async move {
            loop {
                match pty_events.recv().await {
                    Ok(PtyEvent::Line { text, .. }) => {
                        if events.send(LineEvent::Line(text)).await.is_err() {
                            break;
                        }
                    }
                    Ok(PtyEvent::Exited { code }) => {
                        let _ = events.send(LineEvent::Exited(code)).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "dropped interpreter output");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = events.send(LineEvent::Exited(None)).await;
                        break;
                    }
                }
            }
        });

        // Dispatched commands onto the interpreter's input stream. A
        // failed write is fatal for the session.
        let writer = pty.clone();
        tokio::spawn(async move {
            while let Some(text) = outbox_rx.recv().await {
                if let Err(err) = writer.write_line(&text).await {
                    let _ = event_tx
                        .send(LineEvent::WriteFailed(err.to_string()))
                        .await;
                    break;
                }
            }
        });

        let core = spawn_core(config.clone(), event_rx, outbox_tx, lines_out.clone());
        info!(command = %config.command, "sclang session started");

        Ok(Self {
            core,
            pty,
            lines_out,
            config,
        })
    }

    /// Submit a command without observing its completion. This is the
    /// default mode: most commands need no waiter.
    pub async fn send(&self, command: impl Into<String>) -> Result<(), SessionError> {
        self.core
            .submissions
            .send(Submission {
                command: command.into(),
                parameter: None,
                respond_to: None,
            })
            .await
            .map_err(|_| SessionError::Stopped)
    }

    /// Submit a command and suspend until its response is fully
    /// aggregated, up to the configured reply timeout. A timeout means
    /// "result unknown": the command may still complete afterwards.
    pub async fn send_and_wait(&self, command: impl Into<String>) -> Result<(), SessionError> {
        self.submit_waiting(command.into(), None).await
    }

    /// Run the enumeration command, carrying `port` as the virtual output
    /// port created by the caller beforehand. On completion the device
    /// table has been rebuilt from the response and `port` is the
    /// session's active output port.
    pub async fn init_midi(
        &self,
        port: impl Into<String>,
    ) -> Result<Arc<DeviceTable>, SessionError> {
        self.submit_waiting(self.config.init_command.clone(), Some(port.into()))
            .await?;
        self.devices().await
    }

    /// Immutable snapshot of the device table as of the last completed
    /// enumeration. Never a partially rebuilt table.
    pub async fn devices(&self) -> Result<Arc<DeviceTable>, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.core
            .queries
            .send(CoreQuery::Devices { respond_to: tx })
            .await
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    /// The output port identifier stored by the last enumeration, if any.
    pub async fn active_port(&self) -> Result<Option<String>, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.core
            .queries
            .send(CoreQuery::ActivePort { respond_to: tx })
            .await
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    /// Subscribe to interpreter response lines (prompt echoes filtered),
    /// for operator visibility.
    pub fn subscribe_lines(&self) -> broadcast::Receiver<String> {
        self.lines_out.subscribe()
    }

    /// Render a synth program against the current device table and send
    /// each resulting command line in order.
    pub async fn load_program<L: ProgramLoader>(&self, loader: &L) -> Result<(), SessionError> {
        let devices = self.devices().await?;
        for line in loader.render(&devices)? {
            self.send(line).await?;
        }
        Ok(())
    }

    /// Hand a decoded sequence and the active output port to the player.
    /// Fails if no enumeration command has completed yet.
    pub async fn play<P: SequencePlayer>(
        &self,
        player: &P,
        sequence: &P::Sequence,
    ) -> Result<(), SessionError> {
        let port = self
            .active_port()
            .await?
            .ok_or(SessionError::NoActivePort)?;
        player.play(sequence, &port)?;
        Ok(())
    }

    /// Ask the interpreter to terminate itself; fall back to SIGKILL if
    /// it does not exit within the reply timeout. Returns the exit code
    /// when one was observed.
    pub async fn quit(self) -> Result<Option<i32>, SessionError> {
        let mut events = self.pty.subscribe();
        self.send(self.config.quit_command.clone()).await?;

        let wait_exit = async {
            loop {
                match events.recv().await {
                    Ok(PtyEvent::Exited { code }) => break code,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break None,
                }
            }
        };

        match timeout(self.config.reply_timeout(), wait_exit).await {
            Ok(code) => {
                info!(code = ?code, "interpreter exited");
                Ok(code)
            }
            Err(_) => {
                warn!("interpreter ignored the quit command, killing it");
                self.pty.kill(Some("SIGKILL")).await?;
                Ok(None)
            }
        }
    }

    async fn submit_waiting(
        &self,
        command: String,
        parameter: Option<String>,
    ) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.core
            .submissions
            .send(Submission {
                command,
                parameter,
                respond_to: Some(tx),
            })
            .await
            .map_err(|_| SessionError::Stopped)?;

        match timeout(self.config.reply_timeout(), rx).await {
            Err(_) => Err(SessionError::ReplyTimeout),
            Ok(Err(_)) => Err(SessionError::Stopped),
            Ok(Ok(result)) => result,
        }
    }
}
