//! Viewer channel wire messages.
//!
//! Internally each message kind is its own variant carrying only the fields
//! it needs. On the wire they share one flat JSON object discriminated by a
//! numeric `cmd` field: `{taskid, cmd, status?, message?, finish?}`.

use serde::{Deserialize, Serialize};

use crate::status::TaskStatus;

pub const CMD_CLOSE: u8 = 0;
pub const CMD_STATUS: u8 = 1;
pub const CMD_STDOUT: u8 = 2;
pub const CMD_STDBUF: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// The agent is closing the viewer connection.
    Close,
    /// The task status changed. `finish` is set once the status is terminal.
    Status {
        status: TaskStatus,
        message: Option<String>,
        finish: Option<String>,
    },
    /// A finalized output line.
    Stdout { line: String },
    /// The collapsed content of the still-open output line.
    Stdbuf { tail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "RawWireMessage", try_from = "RawWireMessage")]
pub struct WireMessage {
    pub task_id: u32,
    pub kind: MessageKind,
}

impl WireMessage {
    pub fn close(task_id: u32) -> Self {
        Self {
            task_id,
            kind: MessageKind::Close,
        }
    }

    pub fn status(
        task_id: u32,
        status: TaskStatus,
        message: Option<String>,
        finish: Option<String>,
    ) -> Self {
        Self {
            task_id,
            kind: MessageKind::Status {
                status,
                message: message.filter(|m| !m.is_empty()),
                finish,
            },
        }
    }

    pub fn stdout(task_id: u32, line: impl Into<String>) -> Self {
        Self {
            task_id,
            kind: MessageKind::Stdout { line: line.into() },
        }
    }

    pub fn stdbuf(task_id: u32, tail: impl Into<String>) -> Self {
        Self {
            task_id,
            kind: MessageKind::Stdbuf { tail: tail.into() },
        }
    }

    pub fn cmd(&self) -> u8 {
        match self.kind {
            MessageKind::Close => CMD_CLOSE,
            MessageKind::Status { .. } => CMD_STATUS,
            MessageKind::Stdout { .. } => CMD_STDOUT,
            MessageKind::Stdbuf { .. } => CMD_STDBUF,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawWireMessage {
    taskid: u32,
    cmd: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    finish: Option<String>,
}

impl From<WireMessage> for RawWireMessage {
    fn from(msg: WireMessage) -> Self {
        let cmd = msg.cmd();
        let mut raw = RawWireMessage {
            taskid: msg.task_id,
            cmd,
            status: None,
            message: None,
            finish: None,
        };
        match msg.kind {
            MessageKind::Close => {}
            MessageKind::Status {
                status,
                message,
                finish,
            } => {
                raw.status = Some(status);
                raw.message = message;
                raw.finish = finish;
            }
            MessageKind::Stdout { line } => raw.message = Some(line),
            MessageKind::Stdbuf { tail } => raw.message = Some(tail),
        }
        raw
    }
}

impl TryFrom<RawWireMessage> for WireMessage {
    type Error = String;

    fn try_from(raw: RawWireMessage) -> Result<Self, Self::Error> {
        let kind = match raw.cmd {
            CMD_CLOSE => MessageKind::Close,
            CMD_STATUS => MessageKind::Status {
                status: raw
                    .status
                    .ok_or_else(|| "status message without status".to_string())?,
                message: raw.message,
                finish: raw.finish,
            },
            CMD_STDOUT => MessageKind::Stdout {
                line: raw.message.unwrap_or_default(),
            },
            CMD_STDBUF => MessageKind::Stdbuf {
                tail: raw.message.unwrap_or_default(),
            },
            other => return Err(format!("unknown wire cmd {other}")),
        };
        Ok(WireMessage {
            task_id: raw.taskid,
            kind,
        })
    }
}
