//! Best-effort status reports to the controlling process.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::status::TaskStatus;

pub const STATUS_PATH: &str = "/api/taskstatus";
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusReport {
    #[serde(rename = "taskid")]
    pub task_id: u32,
    pub status: TaskStatus,
    pub message: String,
    pub time: i64,
}

#[derive(Clone)]
pub struct StatusNotifier {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl StatusNotifier {
    /// Reports go to `http://localhost:<port>/api/taskstatus`. Port 0 turns
    /// reporting off.
    pub fn new(server_port: u16, timeout: Duration) -> Self {
        let endpoint =
            (server_port != 0).then(|| format!("http://localhost:{server_port}{STATUS_PATH}"));
        Self::with_endpoint(endpoint, timeout)
    }

    pub fn with_endpoint(endpoint: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, endpoint }
    }

    pub fn disabled() -> Self {
        Self::with_endpoint(None, DEFAULT_NOTIFY_TIMEOUT)
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Posts the report. Delivery problems are logged and reported as
    /// `false`; they never fail the task.
    pub async fn notify(&self, report: &TaskStatusReport) -> bool {
        let Some(endpoint) = self.endpoint.as_deref() else {
            return false;
        };
        match self.client.post(endpoint).json(report).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(
                    target = "task_agent::notify",
                    task_id = report.task_id,
                    status = %response.status(),
                    "controlling process rejected status report"
                );
                false
            }
            Err(error) => {
                tracing::error!(
                    target = "task_agent::notify",
                    task_id = report.task_id,
                    error = %error,
                    "failed to report task status"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::prelude::*;
    use serde_json::json;

    use super::{StatusNotifier, TaskStatusReport, STATUS_PATH};
    use crate::status::TaskStatus;

    fn report() -> TaskStatusReport {
        TaskStatusReport {
            task_id: 11,
            status: TaskStatus::Suspended,
            message: String::new(),
            time: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn posts_report_as_json() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path(STATUS_PATH).json_body(json!({
                    "taskid": 11,
                    "status": 1,
                    "message": "",
                    "time": 1_700_000_000,
                }));
                then.status(200);
            })
            .await;

        let notifier = StatusNotifier::new(server.port(), Duration::from_secs(2));
        assert!(notifier.notify(&report()).await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_is_reported_not_raised() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(STATUS_PATH);
                then.status(500);
            })
            .await;

        let notifier = StatusNotifier::new(server.port(), Duration::from_secs(2));
        assert!(!notifier.notify(&report()).await);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_not_fatal() {
        let notifier = StatusNotifier::with_endpoint(
            Some("http://127.0.0.1:9/api/taskstatus".to_string()),
            Duration::from_millis(300),
        );
        assert!(!notifier.notify(&report()).await);
    }

    #[tokio::test]
    async fn port_zero_disables_reporting() {
        let notifier = StatusNotifier::new(0, Duration::from_secs(1));
        assert!(notifier.endpoint().is_none());
        assert!(!notifier.notify(&report()).await);
    }
}
