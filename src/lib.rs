//! Per-task execution agent: supervises one job, captures its console,
//! replays it to live viewers, applies remote control commands and archives
//! the task's logs when it ends.

pub mod api;
pub mod archive;
pub mod config;
pub mod engine;
pub mod error;
pub mod hub;
pub mod logging;
pub mod logs;
pub mod notify;
pub mod output_buffer;
pub mod protocol;
pub mod pty;
pub mod runner;
pub mod status;

pub use engine::{CommandOutcome, EngineSettings, InterpreterChannels, TaskEngine};
pub use error::{AgentError, Result};
pub use status::{Command, Task, TaskStatus};
