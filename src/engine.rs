//! The per-task engine: output capture, viewer fan-out, status state machine
//! and end-of-task archival.
//!
//! A [`TaskEngine`] owns every piece of mutable task state. The output
//! buffer, the viewer registry and the output log share one lock so that
//! appending a chunk, persisting the lines it finalized and broadcasting them
//! happen as one step; an attaching viewer therefore sees either the state
//! before a chunk or after it, never half of it.
//!
//! Two long-running loops feed on channels:
//! - [`run_ingestion`] drains interpreter output into the buffer. It is the
//!   only writer of buffer content and stops when the output channel closes.
//! - [`run_status_broadcast`] fans status changes out to viewers until a
//!   terminal status has gone out, then closes every viewer and marks the
//!   broadcast side as drained.
//!
//! Status transitions are serialized by an async lock so the trace log, the
//! controlling-process report and the viewer broadcast observe transitions in
//! the same order.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::archive::archive_task_files;
use crate::error::{AgentError, Result};
use crate::hub::{BroadcastReport, ViewerBatch, ViewerId, ViewerRegistry};
use crate::logs::{OutputLog, TaskFiles, TraceEntry, TraceLog};
use crate::notify::{StatusNotifier, TaskStatusReport};
use crate::output_buffer::OutputBuffer;
use crate::protocol::{MessageKind, WireMessage};
use crate::status::{format_timestamp, Command, Task, TaskStatus};

/// Capacity of the interpreter output channel, in chunks.
pub const DEFAULT_INGEST_QUEUE: usize = 256;

pub struct EngineSettings {
    pub task: Task,
    pub log_dir: PathBuf,
    pub notifier: StatusNotifier,
    pub ingest_queue: usize,
}

impl EngineSettings {
    pub fn new(task: Task, log_dir: impl Into<PathBuf>, notifier: StatusNotifier) -> Self {
        Self {
            task,
            log_dir: log_dir.into(),
            notifier,
            ingest_queue: DEFAULT_INGEST_QUEUE,
        }
    }
}

/// Channel ends held by the interpreter side.
pub struct InterpreterChannels {
    /// Raw console output produced by the job. Dropping every sender ends
    /// ingestion.
    pub stdout: mpsc::Sender<Vec<u8>>,
    /// Bytes to feed to the job's standard input.
    pub stdin: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Control commands to apply to the job.
    pub control: mpsc::UnboundedReceiver<Command>,
}

/// Receiving ends of the engine's own loops, for callers that drive the
/// loops themselves instead of using [`TaskEngine::start`].
pub struct EngineQueues {
    pub stdout: mpsc::Receiver<Vec<u8>>,
    pub status: mpsc::UnboundedReceiver<WireMessage>,
}

/// Result of a remote control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The command changed the status to the given value.
    Applied(TaskStatus),
    /// The command does not apply in the current status, or is unknown.
    Ignored,
    /// Termination has started and will end with the exit signal.
    Terminating,
}

struct EngineState {
    buffer: OutputBuffer,
    viewers: ViewerRegistry,
    // `None` once the task has been archived.
    output_log: Option<OutputLog>,
    // Last status message fanned out to viewers; the catch-up status for
    // new viewers. Transitions still queued for broadcast are not in it.
    last_status: WireMessage,
    // Set when the broadcast side has shut down; no more viewers are taken.
    closed: bool,
}

#[derive(Default)]
struct TransitionState {
    // Status to return to on resume.
    before_suspend: Option<TaskStatus>,
}

struct Shared {
    task_id: u32,
    files: TaskFiles,
    task: RwLock<Task>,
    state: Mutex<EngineState>,
    trace: Mutex<Option<TraceLog>>,
    transitions: tokio::sync::Mutex<TransitionState>,
    notifier: StatusNotifier,
    status_tx: mpsc::UnboundedSender<WireMessage>,
    control_tx: mpsc::UnboundedSender<Command>,
    stdin_tx: mpsc::UnboundedSender<Vec<u8>>,
    // Weak so the output channel still closes when the interpreter is done.
    mirror_tx: mpsc::WeakSender<Vec<u8>>,
    drained: watch::Sender<bool>,
    exit: watch::Sender<Option<i32>>,
}

#[derive(Clone)]
pub struct TaskEngine {
    shared: Arc<Shared>,
}

impl TaskEngine {
    /// Creates the task logs and the engine. Failing to create either log is
    /// fatal: no task runs without them.
    pub fn new(settings: EngineSettings) -> Result<(Self, InterpreterChannels, EngineQueues)> {
        let EngineSettings {
            mut task,
            log_dir,
            notifier,
            ingest_queue,
        } = settings;
        task.status = TaskStatus::Active;

        fs::create_dir_all(&log_dir).map_err(|err| AgentError::log_file(&log_dir, err))?;
        let files = TaskFiles::new(&log_dir, &task);
        let trace = TraceLog::create(&files.trace, &task)?;
        let output_log = OutputLog::create(&files.output)?;

        let last_status =
            WireMessage::status(task.id, task.status, Some(task.message.clone()), None);
        let (stdout_tx, stdout_rx) = mpsc::channel(ingest_queue.max(1));
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();

        tracing::info!(
            target = "task_agent::engine",
            task_id = task.id,
            name = %task.name,
            trace = %files.trace.display(),
            output = %files.output.display(),
            "task engine initialized"
        );

        let shared = Shared {
            task_id: task.id,
            files,
            task: RwLock::new(task),
            state: Mutex::new(EngineState {
                buffer: OutputBuffer::new(),
                viewers: ViewerRegistry::new(),
                output_log: Some(output_log),
                last_status,
                closed: false,
            }),
            trace: Mutex::new(Some(trace)),
            transitions: tokio::sync::Mutex::new(TransitionState::default()),
            notifier,
            status_tx,
            control_tx,
            stdin_tx,
            mirror_tx: stdout_tx.downgrade(),
            drained: watch::Sender::new(false),
            exit: watch::Sender::new(None),
        };

        Ok((
            Self {
                shared: Arc::new(shared),
            },
            InterpreterChannels {
                stdout: stdout_tx,
                stdin: stdin_rx,
                control: control_rx,
            },
            EngineQueues {
                stdout: stdout_rx,
                status: status_rx,
            },
        ))
    }

    /// Creates the engine and spawns both loops. The returned handle
    /// completes once all interpreter output has been ingested.
    pub fn start(settings: EngineSettings) -> Result<(Self, InterpreterChannels, JoinHandle<()>)> {
        let (engine, interpreter, queues) = Self::new(settings)?;
        tokio::spawn(run_status_broadcast(engine.clone(), queues.status));
        let ingestion = tokio::spawn(run_ingestion(engine.clone(), queues.stdout));
        Ok((engine, interpreter, ingestion))
    }

    pub fn task_id(&self) -> u32 {
        self.shared.task_id
    }

    pub fn task(&self) -> Task {
        self.shared.task.read().clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.shared.task.read().status
    }

    pub fn files(&self) -> &TaskFiles {
        &self.shared.files
    }

    pub fn viewer_count(&self) -> usize {
        self.shared.state.lock().viewers.len()
    }

    /// Finalized lines and the displayed open line.
    pub fn output_snapshot(&self) -> (Vec<String>, String) {
        let state = self.shared.state.lock();
        (state.buffer.lines().to_vec(), state.buffer.tail().to_string())
    }

    pub fn check_task_id(&self, task_id: u32) -> Result<()> {
        if task_id == self.shared.task_id {
            Ok(())
        } else {
            Err(AgentError::WrongTaskId {
                expected: self.shared.task_id,
                got: task_id,
            })
        }
    }

    // ------------------------------------------------------------------
    // Output and viewers
    // ------------------------------------------------------------------

    /// Appends a chunk of interpreter output, persists the lines it
    /// finalized and pushes them to every viewer.
    pub fn ingest(&self, chunk: &[u8]) -> BroadcastReport {
        let mut guard = self.shared.state.lock();
        let EngineState {
            buffer,
            viewers,
            output_log,
            ..
        } = &mut *guard;

        let finalized = buffer.append(chunk);
        if let Some(log) = output_log.as_mut() {
            for line in &buffer.lines()[finalized] {
                if let Err(error) = log.write_line(line) {
                    tracing::error!(
                        target = "task_agent::engine",
                        path = %log.path().display(),
                        error = %error,
                        "failed to persist output line"
                    );
                }
            }
        }

        let report = viewers.broadcast_lines(self.shared.task_id, buffer);
        report.log("output");
        report
    }

    /// Registers a viewer and queues its catch-up: the last broadcast
    /// status, all finalized lines and the open line. A transition that has
    /// not been broadcast yet reaches the viewer as a live update instead. Returns `None` if the catch-up
    /// could not be queued or the task has already shut its viewers down.
    pub fn attach(&self, tx: mpsc::Sender<ViewerBatch>) -> Option<ViewerId> {
        let mut guard = self.shared.state.lock();
        if guard.closed {
            return None;
        }
        let EngineState {
            buffer,
            viewers,
            last_status,
            ..
        } = &mut *guard;
        let status = last_status.clone();
        let id = viewers.attach(self.shared.task_id, status, buffer, tx);
        if let Some(id) = id {
            tracing::debug!(
                target = "task_agent::engine",
                viewer = id,
                viewers = viewers.len(),
                "viewer attached"
            );
        }
        id
    }

    pub fn detach(&self, id: ViewerId) -> bool {
        self.shared.state.lock().viewers.detach(id)
    }

    fn status_message(&self, task: &Task) -> WireMessage {
        let finish = task
            .status
            .is_terminal()
            .then(|| format_timestamp(task.finish_time));
        WireMessage::status(
            task.id,
            task.status,
            Some(task.message.clone()),
            finish,
        )
    }

    // ------------------------------------------------------------------
    // Status state machine
    // ------------------------------------------------------------------

    /// General status entry point, also used for normal completion.
    /// Returns `false` when the task is already in a terminal status.
    pub async fn set_status(&self, status: TaskStatus, message: &str) -> bool {
        let _transition = self.shared.transitions.lock().await;
        self.transition(status, message).await
    }

    // Caller holds the transition lock.
    async fn transition(&self, status: TaskStatus, message: &str) -> bool {
        let now = Local::now().timestamp();
        let wire = {
            let mut task = self.shared.task.write();
            if task.status.is_terminal() {
                tracing::debug!(
                    target = "task_agent::engine",
                    current = %task.status,
                    requested = %status,
                    "status change rejected, task already ended"
                );
                return false;
            }
            task.status = status;
            if !message.is_empty() {
                task.message = message.to_string();
            }
            if status.is_terminal() {
                task.finish_time = now;
            }
            self.status_message(&task)
        };

        tracing::info!(
            target = "task_agent::engine",
            task_id = self.shared.task_id,
            status = %status,
            message = message,
            "task status changed"
        );

        if let Some(trace) = self.shared.trace.lock().as_mut() {
            let entry = TraceEntry {
                time: now,
                status,
                message: message.to_string(),
            };
            if let Err(error) = trace.record(&entry) {
                tracing::error!(
                    target = "task_agent::engine",
                    path = %trace.path().display(),
                    error = %error,
                    "failed to write trace entry"
                );
            }
        }

        self.shared
            .notifier
            .notify(&TaskStatusReport {
                task_id: self.shared.task_id,
                status,
                message: message.to_string(),
                time: now,
            })
            .await;

        let _ = self.shared.status_tx.send(wire);
        true
    }

    /// Applies a remote control command given by its wire code.
    pub async fn apply_command(&self, task_id: u32, code: i64) -> Result<CommandOutcome> {
        self.check_task_id(task_id)?;
        let Some(command) = Command::from_code(code) else {
            tracing::debug!(target = "task_agent::engine", code, "unknown command ignored");
            return Ok(CommandOutcome::Ignored);
        };

        match command {
            Command::Terminate => {
                if self.status().is_terminal() {
                    return Ok(CommandOutcome::Ignored);
                }
                let engine = self.clone();
                tokio::spawn(async move {
                    engine.terminate().await;
                });
                Ok(CommandOutcome::Terminating)
            }
            Command::Suspend => {
                let mut transition = self.shared.transitions.lock().await;
                let current = self.status();
                if current.is_terminal() || current == TaskStatus::Suspended {
                    return Ok(CommandOutcome::Ignored);
                }
                transition.before_suspend = Some(current);
                self.forward(Command::Suspend);
                if self.transition(TaskStatus::Suspended, "").await {
                    Ok(CommandOutcome::Applied(TaskStatus::Suspended))
                } else {
                    Ok(CommandOutcome::Ignored)
                }
            }
            Command::Resume => {
                let mut transition = self.shared.transitions.lock().await;
                if self.status() != TaskStatus::Suspended {
                    return Ok(CommandOutcome::Ignored);
                }
                let previous = transition
                    .before_suspend
                    .take()
                    .unwrap_or(TaskStatus::Active);
                self.forward(Command::Resume);
                if self.transition(previous, "").await {
                    Ok(CommandOutcome::Applied(previous))
                } else {
                    Ok(CommandOutcome::Ignored)
                }
            }
        }
    }

    fn forward(&self, command: Command) {
        if self.shared.control_tx.send(command).is_err() {
            tracing::warn!(
                target = "task_agent::engine",
                command = ?command,
                code = command.code(),
                "interpreter no longer accepts control commands"
            );
        }
    }

    /// Feeds a line to the job's stdin and mirrors it into the output stream
    /// as if the job had printed it.
    pub async fn inject_stdin(&self, task_id: u32, message: &str) -> Result<()> {
        self.check_task_id(task_id)?;
        let mut bytes = message.as_bytes().to_vec();
        bytes.push(b'\n');

        self.shared
            .stdin_tx
            .send(bytes.clone())
            .map_err(|_| AgentError::InterpreterGone)?;
        match self.shared.mirror_tx.upgrade() {
            Some(tx) => tx
                .send(bytes)
                .await
                .map_err(|_| AgentError::InterpreterGone)?,
            None => {
                self.ingest(&bytes);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Termination and archival
    // ------------------------------------------------------------------

    /// Forced termination: marks the task terminated, stops the job,
    /// archives the logs, waits for viewers to be closed and then signals
    /// exit with code 1. Returns `false` if the task had already ended.
    pub async fn terminate(&self) -> bool {
        if !self.set_status(TaskStatus::Terminated, "").await {
            return false;
        }
        self.forward(Command::Terminate);
        self.complete(1).await;
        true
    }

    /// Normal end of the job with `Finished` or `Failed`. Signals exit code
    /// 0 for `Finished` and 1 otherwise.
    pub async fn finish(&self, status: TaskStatus, message: &str) -> bool {
        debug_assert!(status.is_terminal());
        if !self.set_status(status, message).await {
            return false;
        }
        let code = if status == TaskStatus::Finished { 0 } else { 1 };
        self.complete(code).await;
        true
    }

    async fn complete(&self, code: i32) {
        let engine = self.clone();
        if let Err(error) = tokio::task::spawn_blocking(move || engine.archive()).await {
            tracing::error!(target = "task_agent::engine", error = %error, "archival task failed");
        }
        self.wait_drained().await;
        tracing::info!(
            target = "task_agent::engine",
            task_id = self.shared.task_id,
            code,
            "task complete"
        );
        self.shared.exit.send_replace(Some(code));
    }

    /// Flushes the output still held in the buffer, closes both logs and
    /// packages them. Runs once; later calls return `false`.
    pub fn archive(&self) -> bool {
        let output_log = {
            let mut guard = self.shared.state.lock();
            let EngineState {
                buffer, output_log, ..
            } = &mut *guard;
            let Some(mut log) = output_log.take() else {
                return false;
            };
            let rest = buffer.finish();
            for line in &buffer.lines()[rest] {
                if let Err(error) = log.write_line(line) {
                    tracing::error!(
                        target = "task_agent::engine",
                        error = %error,
                        "failed to flush output line"
                    );
                }
            }
            log
        };
        tracing::debug!(
            target = "task_agent::engine",
            lines = output_log.lines_written(),
            "output log closed"
        );
        output_log.close();
        if let Some(trace) = self.shared.trace.lock().take() {
            trace.close();
        }

        match archive_task_files(&self.shared.files) {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(
                    target = "task_agent::engine",
                    archive = %self.shared.files.archive.display(),
                    error = %error,
                    "failed to archive task logs, keeping originals"
                );
                false
            }
        }
    }

    async fn wait_drained(&self) {
        let mut rx = self.shared.drained.subscribe();
        let _ = rx.wait_for(|drained| *drained).await;
    }

    /// Resolves with the process exit code once the task has fully ended.
    pub async fn wait_exit(&self) -> i32 {
        let mut rx = self.shared.exit.subscribe();
        let code = match rx.wait_for(Option::is_some).await {
            Ok(code) => *code,
            Err(_) => None,
        };
        code.unwrap_or(1)
    }

    fn close_viewers(&self) -> usize {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.viewers.detach_all(self.shared.task_id)
    }
}

/// Drains interpreter output into the engine until the channel closes.
pub async fn run_ingestion(engine: TaskEngine, mut stdout: mpsc::Receiver<Vec<u8>>) {
    while let Some(chunk) = stdout.recv().await {
        engine.ingest(&chunk);
    }
    tracing::debug!(
        target = "task_agent::engine",
        task_id = engine.task_id(),
        "interpreter output closed"
    );
}

/// Broadcasts status changes to viewers. After a terminal status has been
/// delivered every viewer is closed and the engine is marked drained.
pub async fn run_status_broadcast(
    engine: TaskEngine,
    mut status: mpsc::UnboundedReceiver<WireMessage>,
) {
    while let Some(message) = status.recv().await {
        let terminal = matches!(
            message.kind,
            MessageKind::Status { status, .. } if status.is_terminal()
        );
        let report = {
            let mut state = engine.shared.state.lock();
            let report = state.viewers.broadcast_status(&message);
            state.last_status = message;
            report
        };
        report.log("status");
        if terminal {
            break;
        }
    }
    let closed = engine.close_viewers();
    tracing::info!(
        target = "task_agent::engine",
        viewers = closed,
        "viewer connections closed"
    );
    engine.shared.drained.send_replace(true);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::prelude::*;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::{CommandOutcome, EngineSettings, InterpreterChannels, TaskEngine};
    use crate::error::AgentError;
    use crate::hub::ViewerBatch;
    use crate::logs::OutputLog;
    use crate::notify::{StatusNotifier, STATUS_PATH};
    use crate::protocol::{MessageKind, WireMessage};
    use crate::status::{Command, Task, TaskStatus};

    const TASK_ID: u32 = 0x2a;

    fn start() -> (TempDir, TaskEngine, InterpreterChannels) {
        let temp = tempdir().expect("tempdir");
        let settings = EngineSettings::new(
            Task::new(TASK_ID, 1, "test", 0),
            temp.path(),
            StatusNotifier::disabled(),
        );
        let (engine, channels, _ingestion) = TaskEngine::start(settings).expect("engine");
        (temp, engine, channels)
    }

    async fn next_batch(rx: &mut mpsc::Receiver<ViewerBatch>) -> ViewerBatch {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("batch in time")
            .expect("viewer open")
    }

    fn statuses(batch: &ViewerBatch) -> Vec<TaskStatus> {
        batch
            .iter()
            .filter_map(|msg| match msg.kind {
                MessageKind::Status { status, .. } => Some(status),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn ingest_persists_and_broadcasts() {
        let (_temp, engine, _channels) = start();
        let (tx, mut rx) = mpsc::channel(16);
        engine.attach(tx).expect("attach");
        let catch_up = next_batch(&mut rx).await;
        assert_eq!(statuses(&catch_up), [TaskStatus::Active]);

        let report = engine.ingest(b"foo\rbar\nbaz");
        assert_eq!(report.delivered, 1);
        let batch = next_batch(&mut rx).await;
        assert_eq!(
            batch,
            vec![
                WireMessage::stdout(TASK_ID, "bar"),
                WireMessage::stdbuf(TASK_ID, "baz"),
            ]
        );
        let body = std::fs::read_to_string(&engine.files().output).expect("out");
        assert_eq!(body, "bar\r\n");
    }

    #[tokio::test]
    async fn suspend_then_resume_restores_previous_status() {
        let (_temp, engine, mut channels) = start();
        let (tx, mut rx) = mpsc::channel(16);
        engine.attach(tx).expect("attach");
        next_batch(&mut rx).await;

        let outcome = engine
            .apply_command(TASK_ID, Command::SUSPEND_CODE)
            .await
            .expect("suspend");
        assert_eq!(outcome, CommandOutcome::Applied(TaskStatus::Suspended));
        assert_eq!(engine.status(), TaskStatus::Suspended);
        assert_eq!(channels.control.recv().await, Some(Command::Suspend));
        assert_eq!(statuses(&next_batch(&mut rx).await), [TaskStatus::Suspended]);

        let again = engine
            .apply_command(TASK_ID, Command::SUSPEND_CODE)
            .await
            .expect("second suspend");
        assert_eq!(again, CommandOutcome::Ignored);

        let outcome = engine
            .apply_command(TASK_ID, Command::RESUME_CODE)
            .await
            .expect("resume");
        assert_eq!(outcome, CommandOutcome::Applied(TaskStatus::Active));
        assert_eq!(channels.control.recv().await, Some(Command::Resume));
        assert_eq!(statuses(&next_batch(&mut rx).await), [TaskStatus::Active]);

        let trace = std::fs::read_to_string(&engine.files().trace).expect("trace");
        let entries: Vec<&str> = trace.lines().skip(1).collect();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].contains("\"status\":1"));
        assert!(entries[1].contains("\"status\":0"));
    }

    #[tokio::test]
    async fn resume_without_suspend_is_ignored() {
        let (_temp, engine, _channels) = start();
        let outcome = engine
            .apply_command(TASK_ID, Command::RESUME_CODE)
            .await
            .expect("resume");
        assert_eq!(outcome, CommandOutcome::Ignored);
        assert_eq!(engine.status(), TaskStatus::Active);
    }

    #[tokio::test]
    async fn wrong_task_id_changes_nothing() {
        let (_temp, engine, _channels) = start();
        let (tx, mut rx) = mpsc::channel(16);
        engine.attach(tx).expect("attach");
        next_batch(&mut rx).await;
        engine.ingest(b"line\n");
        next_batch(&mut rx).await;

        let err = engine
            .apply_command(TASK_ID + 1, Command::TERMINATE_CODE)
            .await
            .err()
            .expect("rejected");
        assert!(matches!(err, AgentError::WrongTaskId { .. }));
        let err = engine
            .inject_stdin(TASK_ID + 1, "hello")
            .await
            .err()
            .expect("rejected");
        assert!(matches!(err, AgentError::WrongTaskId { .. }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.status(), TaskStatus::Active);
        assert_eq!(engine.viewer_count(), 1);
        assert_eq!(engine.output_snapshot().0, ["line"]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminal_status_accepts_no_more_transitions() {
        let (_temp, engine, _channels) = start();
        assert!(engine.finish(TaskStatus::Finished, "done").await);
        assert_eq!(engine.wait_exit().await, 0);

        assert!(!engine.set_status(TaskStatus::Active, "").await);
        let outcome = engine
            .apply_command(TASK_ID, Command::SUSPEND_CODE)
            .await
            .expect("suspend");
        assert_eq!(outcome, CommandOutcome::Ignored);
        let outcome = engine
            .apply_command(TASK_ID, Command::TERMINATE_CODE)
            .await
            .expect("terminate");
        assert_eq!(outcome, CommandOutcome::Ignored);
        assert_eq!(engine.status(), TaskStatus::Finished);
        assert!(engine.task().finish_time > 0);
    }

    #[tokio::test]
    async fn terminate_archives_and_closes_viewers() {
        let (_temp, engine, mut channels) = start();
        let (tx, mut rx) = mpsc::channel(16);
        engine.attach(tx).expect("attach");
        next_batch(&mut rx).await;
        engine.ingest(b"partial output");

        let outcome = engine
            .apply_command(TASK_ID, Command::TERMINATE_CODE)
            .await
            .expect("terminate");
        assert_eq!(outcome, CommandOutcome::Terminating);
        assert_eq!(engine.wait_exit().await, 1);
        assert_eq!(channels.control.recv().await, Some(Command::Terminate));

        let files = engine.files();
        assert!(files.archive.exists());
        assert!(!files.trace.exists());
        assert!(!files.output.exists());

        let mut saw_close = false;
        while let Ok(Some(batch)) = timeout(Duration::from_secs(1), rx.recv()).await {
            if batch.contains(&WireMessage::close(TASK_ID)) {
                saw_close = true;
            }
        }
        assert!(saw_close);
        assert_eq!(engine.viewer_count(), 0);

        let (tx, _rx) = mpsc::channel(16);
        assert!(engine.attach(tx).is_none());
    }

    #[tokio::test]
    async fn archive_flushes_open_line() {
        let (_temp, engine, _channels) = start();
        engine.ingest(b"first\nunterminated");
        assert!(engine.archive());
        assert!(!engine.archive());

        let file = std::fs::File::open(&engine.files().archive).expect("zip");
        let mut archive = zip::ZipArchive::new(file).expect("archive");
        let mut out = String::new();
        std::io::Read::read_to_string(
            &mut archive.by_name("0000002a.out").expect("entry"),
            &mut out,
        )
        .expect("read");
        assert_eq!(out, "first\r\nunterminated\r\n");
    }

    #[tokio::test]
    async fn stdin_reaches_interpreter_and_output() {
        let (_temp, engine, mut channels) = start();
        engine.inject_stdin(TASK_ID, "yes").await.expect("stdin");
        assert_eq!(channels.stdin.recv().await, Some(b"yes\n".to_vec()));

        timeout(Duration::from_secs(2), async {
            while engine.output_snapshot().0.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("mirrored");
        assert_eq!(engine.output_snapshot().0, ["yes"]);
    }

    #[tokio::test]
    async fn existing_logs_abort_startup() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("0000002a.trace"), "old").expect("seed");
        let settings = EngineSettings::new(
            Task::new(TASK_ID, 1, "test", 0),
            temp.path(),
            StatusNotifier::disabled(),
        );
        assert!(matches!(
            TaskEngine::new(settings),
            Err(AgentError::LogFile { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn viewer_attached_during_slow_report_sees_transition_once() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(STATUS_PATH);
                then.status(200).delay(Duration::from_millis(400));
            })
            .await;
        let temp = tempdir().expect("tempdir");
        let settings = EngineSettings::new(
            Task::new(TASK_ID, 1, "test", 0),
            temp.path(),
            StatusNotifier::new(server.port(), Duration::from_secs(2)),
        );
        let (engine, _channels, _ingestion) = TaskEngine::start(settings).expect("engine");

        let suspending = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .apply_command(TASK_ID, Command::SUSPEND_CODE)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        // The status is already set but its report is still in flight.
        assert_eq!(engine.status(), TaskStatus::Suspended);

        let (tx, mut rx) = mpsc::channel(16);
        engine.attach(tx).expect("attach");
        assert_eq!(statuses(&next_batch(&mut rx).await), [TaskStatus::Active]);

        let outcome = suspending.await.expect("join").expect("suspend");
        assert_eq!(outcome, CommandOutcome::Applied(TaskStatus::Suspended));
        assert_eq!(statuses(&next_batch(&mut rx).await), [TaskStatus::Suspended]);
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn failed_output_log_write_keeps_streaming() {
        let (_temp, engine, _channels) = start();
        let path = engine.files().output.clone();
        let read_only = std::fs::File::open(&path).expect("open output read-only");
        engine.shared.state.lock().output_log = Some(OutputLog::from_file(read_only, &path));

        let (tx, mut rx) = mpsc::channel(16);
        engine.attach(tx).expect("attach");
        next_batch(&mut rx).await;

        let report = engine.ingest(b"first\nsecond\n");
        assert_eq!(report.delivered, 1);
        let batch = next_batch(&mut rx).await;
        assert_eq!(
            batch[..2],
            [
                WireMessage::stdout(TASK_ID, "first"),
                WireMessage::stdout(TASK_ID, "second"),
            ]
        );

        engine.ingest(b"third\n");
        assert_eq!(
            next_batch(&mut rx).await[0],
            WireMessage::stdout(TASK_ID, "third")
        );
        assert_eq!(engine.output_snapshot().0, ["first", "second", "third"]);
        assert_eq!(std::fs::read_to_string(&path).expect("output"), "");
        assert_eq!(engine.status(), TaskStatus::Active);
    }
}
