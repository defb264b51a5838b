use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::agent::Agent;
use crate::api::ApiError;
use crate::runner::{ScriptBody, EXIT_TIMED_OUT};
use crate::serde_util::nullable;

const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AutomatedTask {
    pub id: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub script: ScriptBody,
    #[serde(default, deserialize_with = "nullable")]
    pub timeout: u64,
    #[serde(default, deserialize_with = "nullable")]
    pub enabled: bool,
    #[serde(default, deserialize_with = "nullable")]
    pub script_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub stdout: String,
    pub stderr: String,
    pub retcode: i32,
    pub execution_time: f64,
}

/// Fetches task `task_id`, runs its script and reports the outcome back.
pub async fn run_task(agent: &Agent, task_id: i64) -> Result<TaskResult, ApiError> {
    let task = agent.controller.fetch_task(task_id).await?;
    let timeout = if task.timeout > 0 {
        Duration::from_secs(task.timeout)
    } else {
        DEFAULT_TASK_TIMEOUT
    };
    debug!(task_id, shell = %task.script.shell, timeout_secs = timeout.as_secs(), "running task");

    let out = agent
        .runner
        .run_script(&task.script.code, &task.script.shell, &task.script_args, timeout)
        .await;
    if out.retcode == EXIT_TIMED_OUT {
        agent.metrics.inc_script_timeout();
    }
    let result = TaskResult {
        stdout: out.stdout,
        stderr: out.stderr,
        retcode: out.retcode,
        execution_time: out.execution_time,
    };
    agent.controller.report_task(task_id, &result).await?;
    info!(task_id, retcode = result.retcode, "task finished");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiResponse;
    use crate::testing::{test_agent, FakeApi};
    use serde_json::json;

    #[tokio::test]
    async fn fetch_failure_is_abandoned_without_report() {
        let api = FakeApi::new(|_, _, _| {
            Ok(ApiResponse {
                status: 404,
                body: String::new(),
            })
        });
        let agent = test_agent(api.clone());
        assert!(run_task(&agent, 9).await.is_err());
        assert_eq!(api.calls().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reports_script_result() {
        let api = FakeApi::new(|method, _, _| {
            let body = if method.as_str() == "GET" {
                json!({
                    "id": 9,
                    "script": {"shell": "shell", "code": "echo \"arg=$1\"\nexit 5"},
                    "timeout": 10,
                    "enabled": true,
                    "script_args": ["x"]
                })
                .to_string()
            } else {
                String::new()
            };
            Ok(ApiResponse { status: 200, body })
        });
        let agent = test_agent(api.clone());
        let result = run_task(&agent, 9).await.expect("task runs");
        assert_eq!(result.retcode, 5);
        assert_eq!(result.stdout.trim(), "arg=x");

        let calls = api.calls();
        let (method, path, body) = calls.last().expect("report sent");
        assert_eq!(method.as_str(), "PATCH");
        assert_eq!(path, "/taskrunner/9/test-agent/");
        let body = body.as_ref().expect("report body");
        assert_eq!(body["retcode"], json!(5));
        assert!(body.get("execution_time").is_some());
    }
}
