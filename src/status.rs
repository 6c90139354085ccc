use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};

/// Format used for human-facing timestamps on the viewer channel.
pub const TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Lifecycle status of the managed task. Ordering is meaningful: every value
/// at or above [`TaskStatus::Finished`] is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TaskStatus {
    Active,
    Suspended,
    Finished,
    Terminated,
    Failed,
}

impl TaskStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            TaskStatus::Active => 0,
            TaskStatus::Suspended => 1,
            TaskStatus::Finished => 2,
            TaskStatus::Terminated => 3,
            TaskStatus::Failed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        self >= TaskStatus::Finished
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Suspended => "suspended",
            TaskStatus::Finished => "finished",
            TaskStatus::Terminated => "terminated",
            TaskStatus::Failed => "failed",
        }
    }
}

impl From<TaskStatus> for u8 {
    fn from(status: TaskStatus) -> Self {
        status.as_u8()
    }
}

impl TryFrom<u8> for TaskStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskStatus::Active),
            1 => Ok(TaskStatus::Suspended),
            2 => Ok(TaskStatus::Finished),
            3 => Ok(TaskStatus::Terminated),
            4 => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status {other}")),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote control command routed to the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Suspend,
    Resume,
    Terminate,
}

impl Command {
    pub const SUSPEND_CODE: i64 = 1;
    pub const RESUME_CODE: i64 = 2;
    pub const TERMINATE_CODE: i64 = 3;

    /// Maps a wire code to a command. Unknown codes yield `None` and are
    /// acknowledged without effect.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            Self::SUSPEND_CODE => Some(Command::Suspend),
            Self::RESUME_CODE => Some(Command::Resume),
            Self::TERMINATE_CODE => Some(Command::Terminate),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Command::Suspend => Self::SUSPEND_CODE,
            Command::Resume => Self::RESUME_CODE,
            Command::Terminate => Self::TERMINATE_CODE,
        }
    }
}

/// The single task managed by one engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: u32,
    #[serde(rename = "userid")]
    pub user_id: u32,
    pub status: TaskStatus,
    pub name: String,
    #[serde(rename = "start")]
    pub start_time: i64,
    #[serde(rename = "finish")]
    pub finish_time: i64,
    #[serde(default)]
    pub message: String,
    pub port: u16,
}

impl Task {
    pub fn new(id: u32, user_id: u32, name: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            user_id,
            status: TaskStatus::Active,
            name: name.into(),
            start_time: Local::now().timestamp(),
            finish_time: 0,
            message: String::new(),
            port,
        }
    }

    /// Fixed-width hex name shared by the task's log and archive files.
    pub fn file_stem(&self) -> String {
        format!("{:08x}", self.id)
    }

    /// First line of the trace log.
    pub fn head(&self) -> String {
        let mut line =
            serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"id\":{}}}", self.id));
        line.push('\n');
        line
    }
}

/// Formats unix seconds with [`TIME_FORMAT`] in local time.
pub fn format_timestamp(unix_secs: i64) -> String {
    Local
        .timestamp_opt(unix_secs, 0)
        .single()
        .map(|dt| dt.format(TIME_FORMAT).to_string())
        .unwrap_or_default()
}
