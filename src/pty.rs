//! The job's pseudo-terminal.

use std::io::{Read, Write};
use std::os::fd::BorrowedFd;
use std::thread;

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{killpg, Signal};
use nix::sys::termios::{self, LocalFlags, SetArg};
use nix::unistd::Pid;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, ExitStatus, MasterPty, PtySize};
use tokio::sync::mpsc;

const READ_CHUNK: usize = 4096;

/// A job process attached to the slave side of a PTY.
pub struct JobTerminal {
    // Dropping the master hangs up the terminal.
    _master: Box<dyn MasterPty + Send>,
    input: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
    exit: Mutex<Option<ExitStatus>>,
}

impl JobTerminal {
    /// Starts `program` with `args` in the current directory. Everything the
    /// job prints goes to `output` in the chunks the terminal hands out, and
    /// the sender is dropped once the terminal reaches end of file.
    pub fn spawn(
        program: &str,
        args: &[String],
        rows: u16,
        cols: u16,
        output: mpsc::Sender<Vec<u8>>,
    ) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;
        // Injected stdin is mirrored into the output by the engine, so the
        // terminal must not echo it a second time.
        if let Err(error) = disable_echo(&*pair.master) {
            tracing::warn!(target = "task_agent::pty", error = %error, "pty echo left on");
        }

        let mut builder = CommandBuilder::new(program);
        builder.args(args);
        builder.cwd(std::env::current_dir().context("failed to get current directory")?);
        let child = pair
            .slave
            .spawn_command(builder)
            .with_context(|| format!("failed to start '{program}'"))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let input = pair
            .master
            .take_writer()
            .context("failed to take pty writer")?;
        thread::Builder::new()
            .name("job-pty-reader".into())
            .spawn(move || pump_output(reader, output))
            .context("failed to start pty reader thread")?;

        let pid = child.process_id();
        tracing::info!(target = "task_agent::pty", program, pid = ?pid, "job started");

        Ok(Self {
            _master: pair.master,
            input: Mutex::new(input),
            child: Mutex::new(child),
            pid,
            exit: Mutex::new(None),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn write_input(&self, bytes: &[u8]) -> Result<()> {
        let mut input = self.input.lock();
        input.write_all(bytes)?;
        input.flush()?;
        Ok(())
    }

    /// Stops the job's process group.
    pub fn suspend(&self) -> Result<()> {
        self.signal_group(Signal::SIGSTOP)
    }

    pub fn resume(&self) -> Result<()> {
        self.signal_group(Signal::SIGCONT)
    }

    fn signal_group(&self, signal: Signal) -> Result<()> {
        let pid = self.pid.ok_or_else(|| anyhow!("job has no process id"))?;
        // The child leads a new session, so its pid is also its group id.
        killpg(Pid::from_raw(pid as i32), signal)
            .with_context(|| format!("failed to send {signal:?} to job group {pid}"))
    }

    /// Exit status once the job has ended, without blocking.
    pub fn poll_exit(&self) -> Option<ExitStatus> {
        let mut exit = self.exit.lock();
        if exit.is_none() {
            *exit = match self.child.lock().try_wait() {
                Ok(status) => status,
                Err(error) => {
                    tracing::warn!(
                        target = "task_agent::pty",
                        pid = ?self.pid,
                        error = %error,
                        "cannot query job state, assuming it exited"
                    );
                    Some(ExitStatus::with_exit_code(1))
                }
            };
        }
        exit.clone()
    }

    /// Kills the job and reaps it. A stopped job is continued first.
    pub fn kill(&self) {
        let mut exit = self.exit.lock();
        if exit.is_some() {
            return;
        }
        let _ = self.resume();
        let mut child = self.child.lock();
        if let Err(error) = child.kill() {
            tracing::debug!(target = "task_agent::pty", error = %error, "kill failed");
        }
        *exit = Some(child.wait().unwrap_or_else(|_| ExitStatus::with_exit_code(1)));
    }
}

fn disable_echo(master: &dyn MasterPty) -> Result<()> {
    let raw = master
        .as_raw_fd()
        .ok_or_else(|| anyhow!("pty master has no file descriptor"))?;
    // SAFETY: `master` owns the descriptor and outlives this borrow.
    let fd = unsafe { BorrowedFd::borrow_raw(raw) };
    let mut attrs = termios::tcgetattr(fd).context("failed to read pty attributes")?;
    attrs.local_flags.remove(LocalFlags::ECHO);
    termios::tcsetattr(fd, SetArg::TCSANOW, &attrs).context("failed to set pty attributes")
}

fn pump_output(mut reader: Box<dyn Read + Send>, output: mpsc::Sender<Vec<u8>>) {
    let mut chunk = vec![0u8; READ_CHUNK];
    // EOF or EIO once the slave side is gone.
    while let Ok(n @ 1..) = reader.read(&mut chunk) {
        if output.blocking_send(chunk[..n].to_vec()).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    use super::JobTerminal;

    async fn read_until(rx: &mut mpsc::Receiver<Vec<u8>>, needle: &str) -> String {
        let mut seen = Vec::new();
        while let Ok(Some(chunk)) = timeout(Duration::from_secs(2), rx.recv()).await {
            seen.extend_from_slice(&chunk);
            if String::from_utf8_lossy(&seen).contains(needle) {
                break;
            }
        }
        String::from_utf8_lossy(&seen).into_owned()
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    #[tokio::test]
    async fn output_reaches_the_channel() {
        let (tx, mut rx) = mpsc::channel(16);
        let job = JobTerminal::spawn("echo", &args(&["hello"]), 24, 80, tx).unwrap();
        assert!(read_until(&mut rx, "hello").await.contains("hello"));
        job.kill();
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let (tx, _rx) = mpsc::channel(16);
        let job = JobTerminal::spawn("sh", &args(&["-c", "exit 3"]), 24, 80, tx).unwrap();
        let mut status = None;
        for _ in 0..50 {
            status = job.poll_exit();
            if status.is_some() {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
        let status = status.expect("job exits");
        assert!(!status.success());
        assert_eq!(status.exit_code(), 3);
        assert_eq!(job.poll_exit().map(|s| s.exit_code()), Some(3));
    }

    #[tokio::test]
    async fn stopped_job_can_be_continued_and_killed() {
        let (tx, mut rx) = mpsc::channel(16);
        let job = JobTerminal::spawn("sleep", &args(&["30"]), 24, 80, tx).unwrap();
        job.suspend().unwrap();
        job.resume().unwrap();
        assert!(job.poll_exit().is_none());

        job.suspend().unwrap();
        job.kill();
        assert!(job.poll_exit().is_some());
        let drained = timeout(Duration::from_secs(2), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
    }

    #[tokio::test]
    async fn input_reaches_the_job() {
        let (tx, mut rx) = mpsc::channel(16);
        let job = JobTerminal::spawn("cat", &[], 24, 80, tx).unwrap();
        job.write_input(b"ping\n").unwrap();
        assert!(read_until(&mut rx, "ping").await.contains("ping"));
        job.kill();
    }

    #[tokio::test]
    async fn terminal_does_not_echo_input() {
        let (tx, mut rx) = mpsc::channel(16);
        let job =
            JobTerminal::spawn("sh", &args(&["-c", "read x; echo got-$x"]), 24, 80, tx).unwrap();
        job.write_input(b"yes\n").unwrap();
        let seen = timeout(Duration::from_secs(5), async {
            let mut seen = Vec::new();
            while let Some(chunk) = rx.recv().await {
                seen.extend_from_slice(&chunk);
            }
            String::from_utf8_lossy(&seen).into_owned()
        })
        .await
        .expect("job output ends");
        assert_eq!(seen.trim_end(), "got-yes");
        job.kill();
    }

    #[test]
    fn missing_program_is_an_error() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(JobTerminal::spawn("/no/such/program", &[], 24, 80, tx).is_err());
    }
}
