use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;

use crate::api::ViewerOptions;
use crate::hub::DEFAULT_VIEWER_QUEUE;

/// Port of the controlling process that receives status reports.
pub const DEFAULT_SERVER_PORT: u16 = 3234;

#[derive(Debug, Parser, Clone)]
#[command(name = "task-agent")]
#[command(about = "Runs one job, streams its console to live viewers and archives its logs")]
pub struct Config {
    /// Task identifier; random when omitted.
    #[arg(long)]
    pub task_id: Option<u32>,

    #[arg(long, default_value_t = 0)]
    pub user_id: u32,

    /// Display name; defaults to the command line.
    #[arg(long)]
    pub name: Option<String>,

    /// Directory for trace, output and archive files.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Local port for control requests and viewers (0 picks a free port).
    #[arg(long, default_value_t = 0)]
    pub port: u16,

    /// Port of the controlling process (0 disables status reports).
    #[arg(long, default_value_t = DEFAULT_SERVER_PORT)]
    pub server_port: u16,

    #[arg(long, default_value_t = 5000)]
    pub notify_timeout_ms: u64,

    #[arg(long, default_value_t = DEFAULT_VIEWER_QUEUE)]
    pub viewer_queue: usize,

    #[arg(long, default_value_t = 10_000)]
    pub send_timeout_ms: u64,

    /// How long to wait for trailing output after the job exits.
    #[arg(long, default_value_t = 2000)]
    pub drain_grace_ms: u64,

    #[arg(long, default_value_t = 24)]
    pub rows: u16,

    #[arg(long, default_value_t = 80)]
    pub cols: u16,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(required = true)]
    pub command: String,

    #[arg(last = true)]
    pub args: Vec<String>,
}

impl Config {
    pub fn task_id(&self) -> u32 {
        self.task_id.unwrap_or_else(rand::random)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("task-agent")
                .join("logs")
        })
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            std::iter::once(self.command.as_str())
                .chain(self.args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ")
        })
    }

    /// Program and arguments. A lone command string such as
    /// `"sh -c 'make all'"` is split shell-style.
    pub fn job_command(&self) -> Result<(String, Vec<String>)> {
        if !self.args.is_empty() || !self.command.contains(char::is_whitespace) {
            return Ok((self.command.clone(), self.args.clone()));
        }
        let Some(mut parts) = shlex::split(&self.command) else {
            bail!("unbalanced quotes in command '{}'", self.command);
        };
        if parts.is_empty() {
            bail!("empty command");
        }
        let program = parts.remove(0);
        Ok((program, parts))
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn viewer_options(&self) -> ViewerOptions {
        ViewerOptions {
            queue: self.viewer_queue,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
        }
    }
}
