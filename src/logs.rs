//! Persisted per-task logs: the structured trace and the captured output.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::status::{Task, TaskStatus};

/// Paths of everything the agent writes for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFiles {
    pub trace: PathBuf,
    pub output: PathBuf,
    pub archive: PathBuf,
}

impl TaskFiles {
    pub fn new(log_dir: &Path, task: &Task) -> Self {
        let stem = task.file_stem();
        Self {
            trace: log_dir.join(format!("{stem}.trace")),
            output: log_dir.join(format!("{stem}.out")),
            archive: log_dir.join(format!("{stem}.zip")),
        }
    }
}

/// One status transition as recorded in the trace log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub time: i64,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

fn create_exclusive(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|err| AgentError::log_file(path, err))
}

fn close_file(file: File, path: &Path) {
    if let Err(error) = file.sync_all() {
        tracing::warn!(
            target = "task_agent::logs",
            path = %path.display(),
            error = %error,
            "failed to sync log file on close"
        );
    }
}

pub struct TraceLog {
    file: File,
    path: PathBuf,
}

impl TraceLog {
    /// Creates the trace file and writes the task header as its first line.
    /// Refuses to reuse an existing file.
    pub fn create(path: &Path, task: &Task) -> Result<Self> {
        let mut file = create_exclusive(path)?;
        file.write_all(task.head().as_bytes())
            .map_err(|err| AgentError::log_file(path, err))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn record(&mut self, entry: &TraceEntry) -> io::Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(self) {
        close_file(self.file, &self.path);
    }
}

pub struct OutputLog {
    file: File,
    path: PathBuf,
    lines_written: usize,
}

impl OutputLog {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            file: create_exclusive(path)?,
            path: path.to_path_buf(),
            lines_written: 0,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_file(file: File, path: &Path) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            lines_written: 0,
        }
    }

    /// Appends one finalized line terminated with CRLF.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut out = String::with_capacity(line.len() + 2);
        out.push_str(line);
        out.push_str("\r\n");
        self.file.write_all(out.as_bytes())?;
        self.lines_written += 1;
        Ok(())
    }

    pub fn lines_written(&self) -> usize {
        self.lines_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(self) {
        close_file(self.file, &self.path);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::{OutputLog, TaskFiles, TraceEntry, TraceLog};
    use crate::error::AgentError;
    use crate::status::{Task, TaskStatus};

    #[test]
    fn file_names_use_fixed_width_hex() {
        let task = Task::new(0x1f, 1, "demo", 0);
        let files = TaskFiles::new(std::path::Path::new("/logs"), &task);
        assert_eq!(files.trace, std::path::Path::new("/logs/0000001f.trace"));
        assert_eq!(files.output, std::path::Path::new("/logs/0000001f.out"));
        assert_eq!(files.archive, std::path::Path::new("/logs/0000001f.zip"));
    }

    #[test]
    fn trace_starts_with_header_then_entries() {
        let temp = tempdir().expect("tempdir");
        let task = Task::new(42, 1, "demo", 0);
        let path = temp.path().join("trace");

        let mut log = TraceLog::create(&path, &task).expect("create");
        log.record(&TraceEntry {
            time: 100,
            status: TaskStatus::Suspended,
            message: String::new(),
        })
        .expect("record");
        log.close();

        let body = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let header: Task = serde_json::from_str(lines[0]).expect("header json");
        assert_eq!(header.id, 42);
        assert_eq!(lines[1], r#"{"time":100,"status":1}"#);
    }

    #[test]
    fn existing_file_is_a_startup_error() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("taken.out");
        fs::write(&path, "old").expect("seed");

        let err = OutputLog::create(&path).err().expect("must fail");
        assert!(matches!(err, AgentError::LogFile { .. }));
        assert_eq!(fs::read_to_string(&path).expect("read"), "old");
    }

    #[test]
    fn output_lines_are_crlf_terminated() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("x.out");
        let mut log = OutputLog::create(&path).expect("create");
        log.write_line("one").expect("write");
        log.write_line("").expect("write");
        assert_eq!(log.lines_written(), 2);
        log.close();
        assert_eq!(fs::read_to_string(&path).expect("read"), "one\r\n\r\n");
    }
}
