//! Drives a PTY job from the engine's interpreter channels.

use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::engine::InterpreterChannels;
use crate::pty::JobTerminal;
use crate::status::{Command, TaskStatus};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub command: String,
    pub args: Vec<String>,
    pub rows: u16,
    pub cols: u16,
}

/// How the job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobExit {
    Exited { code: u32 },
    /// The job was killed by a terminate command.
    Killed,
    SpawnFailed(String),
}

impl JobExit {
    /// Final task status and message for a job that ended on its own.
    /// `None` when the engine already owns the ending (terminate).
    pub fn final_status(&self) -> Option<(TaskStatus, String)> {
        match self {
            JobExit::Exited { code: 0 } => Some((TaskStatus::Finished, String::new())),
            JobExit::Exited { code } => Some((TaskStatus::Failed, format!("exit code {code}"))),
            JobExit::Killed => None,
            JobExit::SpawnFailed(reason) => Some((TaskStatus::Failed, reason.clone())),
        }
    }
}

/// Runs the job until it exits or is killed, relaying stdin and control
/// commands to it. The output sender in `channels` is handed to the PTY
/// reader and dropped once the terminal closes.
pub async fn run_job(spec: JobSpec, channels: InterpreterChannels) -> JobExit {
    let InterpreterChannels {
        stdout,
        mut stdin,
        mut control,
    } = channels;

    let pty = match JobTerminal::spawn(&spec.command, &spec.args, spec.rows, spec.cols, stdout) {
        Ok(pty) => pty,
        Err(error) => {
            tracing::error!(target = "task_agent::runner", error = %error, "job failed to start");
            return JobExit::SpawnFailed(format!("{error:#}"));
        }
    };

    let mut exit_poll = tokio::time::interval(EXIT_POLL_INTERVAL);
    exit_poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stdin_open = true;
    let mut control_open = true;
    loop {
        tokio::select! {
            bytes = stdin.recv(), if stdin_open => match bytes {
                Some(bytes) => {
                    if let Err(error) = pty.write_input(&bytes) {
                        tracing::warn!(target = "task_agent::runner", error = %error, "failed to write job stdin");
                    }
                }
                None => stdin_open = false,
            },
            command = control.recv(), if control_open => match command {
                Some(Command::Suspend) => {
                    if let Err(error) = pty.suspend() {
                        tracing::warn!(target = "task_agent::runner", error = %error, "suspend failed");
                    }
                }
                Some(Command::Resume) => {
                    if let Err(error) = pty.resume() {
                        tracing::warn!(target = "task_agent::runner", error = %error, "resume failed");
                    }
                }
                Some(Command::Terminate) => {
                    pty.kill();
                    tracing::info!(target = "task_agent::runner", pid = ?pty.pid(), "job killed");
                    return JobExit::Killed;
                }
                None => control_open = false,
            },
            _ = exit_poll.tick() => {
                if let Some(status) = pty.poll_exit() {
                    let code = status.exit_code();
                    tracing::info!(target = "task_agent::runner", pid = ?pty.pid(), code, "job exited");
                    return JobExit::Exited { code };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::{run_job, JobExit, JobSpec};
    use crate::engine::InterpreterChannels;
    use crate::status::{Command, TaskStatus};

    fn spec(command: &str, args: &[&str]) -> JobSpec {
        JobSpec {
            command: command.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            rows: 24,
            cols: 80,
        }
    }

    fn channels() -> (
        InterpreterChannels,
        mpsc::Receiver<Vec<u8>>,
        mpsc::UnboundedSender<Vec<u8>>,
        mpsc::UnboundedSender<Command>,
    ) {
        let (stdout_tx, stdout_rx) = mpsc::channel(64);
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        (
            InterpreterChannels {
                stdout: stdout_tx,
                stdin: stdin_rx,
                control: control_rx,
            },
            stdout_rx,
            stdin_tx,
            control_tx,
        )
    }

    #[test]
    fn final_status_mapping() {
        assert_eq!(
            JobExit::Exited { code: 0 }.final_status(),
            Some((TaskStatus::Finished, String::new()))
        );
        assert_eq!(
            JobExit::Exited { code: 2 }.final_status(),
            Some((TaskStatus::Failed, "exit code 2".to_string()))
        );
        assert_eq!(JobExit::Killed.final_status(), None);
    }

    #[tokio::test]
    async fn job_output_and_exit_code() {
        let (channels, mut stdout, _stdin, _control) = channels();
        let exit = timeout(
            Duration::from_secs(5),
            run_job(spec("sh", &["-c", "echo out; exit 4"]), channels),
        )
        .await
        .expect("job ends");
        assert_eq!(exit, JobExit::Exited { code: 4 });

        let mut collected = Vec::new();
        while let Ok(Some(chunk)) = timeout(Duration::from_secs(2), stdout.recv()).await {
            collected.extend_from_slice(&chunk);
        }
        assert!(String::from_utf8_lossy(&collected).contains("out"));
    }

    #[tokio::test]
    async fn terminate_kills_job() {
        let (channels, _stdout, _stdin, control) = channels();
        let job = tokio::spawn(run_job(spec("sleep", &["30"]), channels));
        control.send(Command::Suspend).expect("send");
        control.send(Command::Terminate).expect("send");
        let exit = timeout(Duration::from_secs(5), job)
            .await
            .expect("job ends")
            .expect("join");
        assert_eq!(exit, JobExit::Killed);
    }

    #[tokio::test]
    async fn missing_command_fails_to_spawn() {
        let (channels, _stdout, _stdin, _control) = channels();
        let exit = run_job(spec("/definitely/not/a/command", &[]), channels).await;
        assert!(matches!(exit, JobExit::SpawnFailed(_)));
    }
}
