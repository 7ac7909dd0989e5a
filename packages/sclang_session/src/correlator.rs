//! The session state machine.
//!
//! One actor owns all mutable session state: the pending command, its
//! side-channel parameter, the optional waiter, the response buffer, the
//! quiescence deadline, the active output port, and the device table.
//! Submissions, output lines, snapshot queries, and the quiescence timer
//! all feed the same `select!` loop, so no two transitions can interleave.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Duration, Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::aggregator::{ResponseAggregator, is_prompt_echo};
use crate::config::SessionConfig;
use crate::devices::{DeviceTable, parse_device_table};
use crate::error::SessionError;

/// Events flowing from the process into the state machine.
pub(crate) enum LineEvent {
    Line(String),
    WriteFailed(String),
    Exited(Option<i32>),
}

/// One command submission. `respond_to` is the completion target: absent
/// for fire-and-forget commands, present when the caller must observe
/// finalization.
pub(crate) struct Submission {
    pub command: String,
    pub parameter: Option<String>,
    pub respond_to: Option<oneshot::Sender<Result<(), SessionError>>>,
}

/// Snapshot queries, answered from any state.
pub(crate) enum CoreQuery {
    Devices {
        respond_to: oneshot::Sender<Arc<DeviceTable>>,
    },
    ActivePort {
        respond_to: oneshot::Sender<Option<String>>,
    },
}

#[derive(Clone)]
pub(crate) struct CoreHandle {
    pub submissions: mpsc::Sender<Submission>,
    pub queries: mpsc::Sender<CoreQuery>,
}

enum Correlator {
    Idle,
    Awaiting {
        command: String,
        parameter: Option<String>,
        waiter: Option<oneshot::Sender<Result<(), SessionError>>>,
        aggregator: ResponseAggregator,
    },
}

pub(crate) struct SessionCore {
    config: SessionConfig,
    submissions: mpsc::Receiver<Submission>,
    queries: mpsc::Receiver<CoreQuery>,
    events: mpsc::Receiver<LineEvent>,
    outbox: mpsc::Sender<String>,
    lines_out: broadcast::Sender<String>,
    state: Correlator,
    active_port: Option<String>,
    devices: Arc<DeviceTable>,
}

/// Start the state machine on its own task and return the handle the
/// facade talks through. `events` carries interpreter output in arrival
/// order; dispatched command text goes out through `outbox`.
pub(crate) fn spawn_core(
    config: SessionConfig,
    events: mpsc::Receiver<LineEvent>,
    outbox: mpsc::Sender<String>,
    lines_out: broadcast::Sender<String>,
) -> CoreHandle {
    let (submission_tx, submission_rx) = mpsc::channel(32);
    let (query_tx, query_rx) = mpsc::channel(32);

    let core = SessionCore {
        config,
        submissions: submission_rx,
        queries: query_rx,
        events,
        outbox,
        lines_out,
        state: Correlator::Idle,
        active_port: None,
        devices: Arc::new(DeviceTable::default()),
    };

    tokio::spawn(core.run());

    CoreHandle {
        submissions: submission_tx,
        queries: query_tx,
    }
}

impl SessionCore {
    async fn run(mut self) {
        debug!("session core started");
        loop {
            let deadline = match &self.state {
                Correlator::Awaiting { aggregator, .. } => Some(aggregator.deadline()),
                Correlator::Idle => None,
            };
            let awaiting = deadline.is_some();
            let quiet_at =
                deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                // Strictly request/response: while a command is in flight,
                // the next submission stays queued and is not written to
                // the process.
                submission = self.submissions.recv(), if !awaiting => match submission {
                    Some(submission) => self.dispatch(submission).await,
                    None => break,
                },
                query = self.queries.recv() => match query {
                    Some(query) => self.answer(query),
                    None => break,
                },
                event = self.events.recv() => match event {
                    Some(LineEvent::Line(text)) => self.on_line(text),
                    Some(LineEvent::WriteFailed(msg)) => {
                        self.stop(SessionError::Write(msg));
                        break;
                    }
                    Some(LineEvent::Exited(code)) => {
                        self.stop(SessionError::ProcessExited { code });
                        break;
                    }
                    None => {
                        self.stop(SessionError::Stopped);
                        break;
                    }
                },
                _ = sleep_until(quiet_at), if awaiting => self.finalize(),
            }
        }
        debug!("session core stopped");
    }

    async fn dispatch(&mut self, submission: Submission) {
        let Submission {
            command,
            parameter,
            respond_to,
        } = submission;

        debug!(command = %command, "dispatching command");
        if self.outbox.send(command.clone()).await.is_err() {
            if let Some(tx) = respond_to {
                let _ = tx.send(Err(SessionError::Stopped));
            }
            return;
        }

        self.state = Correlator::Awaiting {
            aggregator: ResponseAggregator::new(self.config.quiescence_window()),
            command,
            parameter,
            waiter: respond_to,
        };
    }

    fn answer(&self, query: CoreQuery) {
        match query {
            CoreQuery::Devices { respond_to } => {
                let _ = respond_to.send(Arc::clone(&self.devices));
            }
            CoreQuery::ActivePort { respond_to } => {
                let _ = respond_to.send(self.active_port.clone());
            }
        }
    }

    fn on_line(&mut self, text: String) {
        match &mut self.state {
            Correlator::Awaiting { aggregator, .. } => aggregator.push(text),
            // Unsolicited output (the interpreter posts asynchronously,
            // e.g. late server messages): surface it, nothing to correlate.
            Correlator::Idle => self.emit(&text),
        }
    }

    /// Quiescence fired: the buffered lines are the response.
    fn finalize(&mut self) {
        let Correlator::Awaiting {
            command,
            parameter,
            waiter,
            aggregator,
        } = std::mem::replace(&mut self.state, Correlator::Idle)
        else {
            return;
        };

        let lines: Vec<String> = aggregator
            .into_lines()
            .into_iter()
            .filter(|line| !is_prompt_echo(line, &self.config.prompt))
            .collect();

        for line in &lines {
            self.emit(line);
        }

        let result = if command == self.config.init_command {
            match parse_device_table(&lines) {
                Ok(table) => {
                    // The port only becomes active once enumeration actually
                    // succeeded; a malformed response must not flip it.
                    if let Some(port) = parameter {
                        info!(port = %port, "MIDI output port active");
                        self.active_port = Some(port);
                    }
                    info!(devices = table.len(), "device table rebuilt");
                    self.devices = Arc::new(table);
                    Ok(())
                }
                Err(err) => {
                    warn!(%err, "device enumeration response was malformed");
                    Err(SessionError::Parse(err))
                }
            }
        } else {
            Ok(())
        };

        if let Some(tx) = waiter {
            // A caller that timed out already dropped its receiver; the
            // send is then a no-op.
            let _ = tx.send(result);
        }
    }

    fn emit(&self, line: &str) {
        if is_prompt_echo(line, &self.config.prompt) {
            return;
        }
        info!(target: "sclang", "{line}");
        let _ = self.lines_out.send(line.to_string());
    }

    /// Terminal: release any suspended waiter with a failure and let the
    /// channels close so later submissions fail fast.
    fn stop(&mut self, err: SessionError) {
        info!(%err, "session core stopping");
        if let Correlator::Awaiting {
            waiter: Some(tx), ..
        } = std::mem::replace(&mut self.state, Correlator::Idle)
        {
            let _ = tx.send(Err(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        core: CoreHandle,
        events: mpsc::Sender<LineEvent>,
        outbox: mpsc::Receiver<String>,
        lines: broadcast::Receiver<String>,
    }

    fn harness_with(config: SessionConfig) -> Harness {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (outbox_tx, outbox_rx) = mpsc::channel(64);
        let (lines_out, lines) = broadcast::channel(64);
        let core = spawn_core(config, event_rx, outbox_tx, lines_out);
        Harness {
            core,
            events: event_tx,
            outbox: outbox_rx,
            lines,
        }
    }

    fn harness() -> Harness {
        harness_with(SessionConfig::default())
    }

    async fn submit(h: &Harness, command: &str) {
        h.core
            .submissions
            .send(Submission {
                command: command.to_string(),
                parameter: None,
                respond_to: None,
            })
            .await
            .unwrap();
    }

    async fn submit_waiting(
        h: &Harness,
        command: &str,
        parameter: Option<&str>,
    ) -> oneshot::Receiver<Result<(), SessionError>> {
        let (tx, rx) = oneshot::channel();
        h.core
            .submissions
            .send(Submission {
                command: command.to_string(),
                parameter: parameter.map(str::to_string),
                respond_to: Some(tx),
            })
            .await
            .unwrap();
        rx
    }

    async fn feed_line(h: &Harness, line: &str) {
        h.events
            .send(LineEvent::Line(line.to_string()))
            .await
            .unwrap();
    }

    /// Let the core task process everything already queued without
    /// advancing the (paused) clock.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn drain_lines(lines: &mut broadcast::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = lines.try_recv() {
            out.push(line);
        }
        out
    }

    async fn devices_snapshot(h: &Harness) -> Arc<DeviceTable> {
        let (tx, rx) = oneshot::channel();
        h.core
            .queries
            .send(CoreQuery::Devices { respond_to: tx })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    async fn active_port(h: &Harness) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        h.core
            .queries
            .send(CoreQuery::ActivePort { respond_to: tx })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn quiescence_gap_frames_exactly_one_response() {
        let mut h = harness();

        let mut rx = submit_waiting(&h, "TempoClock.default.tempo;", None).await;
        assert_eq!(h.outbox.recv().await.unwrap(), "TempoClock.default.tempo;");

        // Gaps smaller than the 100ms window: no finalization yet.
        for line in ["one", "two", "three"] {
            feed_line(&h, line).await;
            settle().await;
            tokio::time::advance(Duration::from_millis(50)).await;
            assert!(rx.try_recv().is_err(), "finalized during a short gap");
            assert!(h.lines.try_recv().is_err());
        }

        // One gap larger than the window: exactly one finalization with
        // everything buffered so far.
        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
        assert_eq!(drain_lines(&mut h.lines), vec!["one", "two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_submission_is_not_dispatched_until_first_finalizes() {
        let mut h = harness();

        submit(&h, "first").await;
        submit(&h, "second").await;

        assert_eq!(h.outbox.recv().await.unwrap(), "first");
        feed_line(&h, "first output").await;
        settle().await;
        assert!(
            h.outbox.try_recv().is_err(),
            "second command written while first was in flight"
        );

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(h.outbox.recv().await.unwrap(), "second");
    }

    #[tokio::test(start_paused = true)]
    async fn enumeration_builds_device_table_and_stores_port() {
        let mut h = harness();
        let init = SessionConfig::default().init_command;

        let rx = submit_waiting(&h, &init, Some("synthport-out")).await;
        assert_eq!(h.outbox.recv().await.unwrap(), init);

        feed_line(&h, "sc3>").await;
        feed_line(&h, "MIDI Destination 0: 0 'synthport', MIDI uid 42").await;
        feed_line(&h, "MIDI Destination 1: 1 'IAC Bus 1', MIDI uid -7").await;
        feed_line(&h, "sc3> sc3>").await;
        settle().await;
        tokio::time::advance(Duration::from_millis(150)).await;

        assert!(matches!(rx.await, Ok(Ok(()))));

        let table = devices_snapshot(&h).await;
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("synthport").unwrap().uid, 42);
        assert_eq!(active_port(&h).await, Some("synthport-out".to_string()));

        // Prompt echoes were counted for quiescence but never surfaced.
        let surfaced = drain_lines(&mut h.lines);
        assert_eq!(surfaced.len(), 2);
        assert!(surfaced.iter().all(|l| l.starts_with("MIDI Destination")));
    }

    #[tokio::test(start_paused = true)]
    async fn parse_failure_is_contained_at_the_command_boundary() {
        let mut h = harness();
        let init = SessionConfig::default().init_command;

        let rx = submit_waiting(&h, &init, Some("synthport-out")).await;
        h.outbox.recv().await.unwrap();
        feed_line(&h, "MIDI Destination garbage").await;
        settle().await;
        tokio::time::advance(Duration::from_millis(150)).await;

        match rx.await {
            Ok(Err(SessionError::Parse(_))) => {}
            other => panic!("expected parse error, got {other:?}"),
        }
        assert!(devices_snapshot(&h).await.is_empty());
        // The carried port never took effect.
        assert_eq!(active_port(&h).await, None);

        // The session is back to idle and unaffected.
        let rx = submit_waiting(&h, "s.boot;", None).await;
        assert_eq!(h.outbox.recv().await.unwrap(), "s.boot;");
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(matches!(rx.await, Ok(Ok(()))));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_waiter_does_not_corrupt_later_commands() {
        let mut h = harness();

        let rx = submit_waiting(&h, "slow", None).await;
        h.outbox.recv().await.unwrap();
        // Caller gives up; the completion target becomes stale.
        drop(rx);

        feed_line(&h, "slow output").await;
        settle().await;
        tokio::time::advance(Duration::from_millis(150)).await;
        settle().await;
        assert_eq!(drain_lines(&mut h.lines), vec!["slow output"]);

        // An unrelated later command finalizes normally.
        let rx = submit_waiting(&h, "later", None).await;
        assert_eq!(h.outbox.recv().await.unwrap(), "later");
        feed_line(&h, "later output").await;
        settle().await;
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(matches!(rx.await, Ok(Ok(()))));
        assert_eq!(drain_lines(&mut h.lines), vec!["later output"]);
    }

    #[tokio::test(start_paused = true)]
    async fn process_exit_releases_the_suspended_waiter() {
        let mut h = harness();

        let rx = submit_waiting(&h, "s.boot;", None).await;
        // The command is in flight (it reached the outbox) when the
        // process dies.
        h.outbox.recv().await.unwrap();
        h.events.send(LineEvent::Exited(Some(1))).await.unwrap();

        match rx.await {
            Ok(Err(SessionError::ProcessExited { code: Some(1) })) => {}
            other => panic!("expected exit failure, got {other:?}"),
        }

        // The core is gone; later submissions fail fast instead of hanging.
        settle().await;
        let (tx, _rx) = oneshot::channel();
        assert!(
            h.core
                .submissions
                .send(Submission {
                    command: "anything".into(),
                    parameter: None,
                    respond_to: Some(tx),
                })
                .await
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_stops_the_session() {
        let mut h = harness();

        let rx = submit_waiting(&h, "s.boot;", None).await;
        h.outbox.recv().await.unwrap();
        h.events
            .send(LineEvent::WriteFailed("broken pipe".into()))
            .await
            .unwrap();

        match rx.await {
            Ok(Err(SessionError::Write(_))) => {}
            other => panic!("expected write failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_commands_finalize_independently() {
        let mut h = harness();

        submit(&h, "first").await;
        assert_eq!(h.outbox.recv().await.unwrap(), "first");
        feed_line(&h, "first output").await;
        settle().await;
        tokio::time::advance(Duration::from_millis(150)).await;
        settle().await;
        assert_eq!(drain_lines(&mut h.lines), vec!["first output"]);

        submit(&h, "second").await;
        assert_eq!(h.outbox.recv().await.unwrap(), "second");
        feed_line(&h, "second output").await;
        settle().await;
        tokio::time::advance(Duration::from_millis(150)).await;
        settle().await;
        assert_eq!(drain_lines(&mut h.lines), vec!["second output"]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_command_still_finalizes() {
        let mut h = harness();

        let rx = submit_waiting(&h, "nothing to say", None).await;
        h.outbox.recv().await.unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;

        assert!(matches!(rx.await, Ok(Ok(()))));
        assert!(h.lines.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_output_is_surfaced_but_not_correlated() {
        let mut h = harness();

        feed_line(&h, "late server notice").await;
        feed_line(&h, "sc3>").await;
        settle().await;

        assert_eq!(drain_lines(&mut h.lines), vec!["late server notice"]);
    }
}
