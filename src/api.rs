use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::checks::CheckList;
use crate::config::Config;
use crate::tasks::{AutomatedTask, TaskResult};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request {method} {path} failed: {source}")]
    Transport {
        method: Method,
        path: String,
        #[source]
        source: BoxError,
    },
    #[error("{method} {path} returned status {status}")]
    Status {
        method: Method,
        path: String,
        status: u16,
    },
    #[error("failed to decode response of {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body with surrounding whitespace and JSON string quotes removed.
    pub fn text(&self) -> &str {
        plain_string(&self.body)
    }
}

/// The controller answers several endpoints with a bare JSON string such as
/// `"failing"`; this strips it to the inner text.
pub fn plain_string(body: &str) -> &str {
    body.trim().trim_matches('"').trim()
}

/// Raw access to the controller's HTTP API. `path` is relative to the
/// configured API base and starts with `/`.
#[async_trait]
pub trait ControllerApi: Send + Sync {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<ApiResponse, ApiError>;
}

pub struct HttpApi {
    client: Client,
    base: String,
}

impl HttpApi {
    pub fn new(cfg: &Config, version: &str) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(mut auth) = HeaderValue::from_str(&format!("Token {}", cfg.token)) {
            auth.set_sensitive(true);
            headers.insert(AUTHORIZATION, auth);
        }
        let client = Client::builder()
            .user_agent(format!("rmmagent/{version}"))
            .default_headers(headers)
            .build()
            .map_err(ApiError::Client)?;
        Ok(Self {
            client,
            base: cfg.api_base(),
        })
    }
}

#[async_trait]
impl ControllerApi for HttpApi {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<ApiResponse, ApiError> {
        let url = format!("{}{}", self.base, path);
        let mut request = self.client.request(method.clone(), &url).timeout(timeout);
        if let Some(body) = body {
            request = request.json(body);
        }
        let transport = |source: reqwest::Error| ApiError::Transport {
            method: method.clone(),
            path: path.to_string(),
            source: Box::new(source),
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport)?;
        Ok(ApiResponse { status, body })
    }
}

/// Typed calls on top of [`ControllerApi`].
#[derive(Clone)]
pub struct Controller {
    api: Arc<dyn ControllerApi>,
    agent_id: String,
    agent_pk: i64,
}

impl Controller {
    pub fn new(api: Arc<dyn ControllerApi>, agent_id: impl Into<String>, agent_pk: i64) -> Self {
        Self {
            api,
            agent_id: agent_id.into(),
            agent_pk,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub async fn fetch_checks(&self) -> Result<CheckList, ApiError> {
        let path = format!("/checkrunner/{}/", self.agent_id);
        self.get_json(&path, FETCH_TIMEOUT).await
    }

    /// Reports one check result and returns the controller's verdict text.
    pub async fn report_check(&self, payload: &Value, timeout: Duration) -> Result<String, ApiError> {
        let response = self
            .api
            .send(Method::PATCH, "/checkrunner/", Some(payload), timeout)
            .await?;
        Ok(response.text().to_string())
    }

    pub async fn fetch_task(&self, task_id: i64) -> Result<AutomatedTask, ApiError> {
        let path = format!("/taskrunner/{}/{}/", task_id, self.agent_id);
        self.get_json(&path, FETCH_TIMEOUT).await
    }

    pub async fn report_task(&self, task_id: i64, result: &TaskResult) -> Result<(), ApiError> {
        let path = format!("/taskrunner/{}/{}/", task_id, self.agent_id);
        let body = to_value(result)?;
        let response = self
            .api
            .send(Method::PATCH, &path, Some(&body), FETCH_TIMEOUT)
            .await?;
        ensure_success(Method::PATCH, &path, &response)
    }

    pub async fn hello(&self, method: Method, payload: &Value) -> Result<ApiResponse, ApiError> {
        let response = self
            .api
            .send(method.clone(), "/hello/", Some(payload), FETCH_TIMEOUT)
            .await?;
        ensure_success(method, "/hello/", &response)?;
        Ok(response)
    }

    pub async fn mesh_node_id(&self) -> Result<String, ApiError> {
        let path = format!("/{}/meshinfo/", self.agent_pk);
        let response = self
            .api
            .send(Method::GET, &path, None, FETCH_TIMEOUT)
            .await?;
        ensure_success(Method::GET, &path, &response)?;
        Ok(response.text().to_string())
    }

    pub async fn set_mesh_node_id(&self, node_id: &str) -> Result<(), ApiError> {
        let path = format!("/{}/meshinfo/", self.agent_pk);
        let body = serde_json::json!({ "nodeidhex": node_id });
        let response = self
            .api
            .send(Method::PATCH, &path, Some(&body), FETCH_TIMEOUT)
            .await?;
        ensure_success(Method::PATCH, &path, &response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, timeout: Duration) -> Result<T, ApiError> {
        let response = self.api.send(Method::GET, path, None, timeout).await?;
        ensure_success(Method::GET, path, &response)?;
        serde_json::from_str(&response.body).map_err(|source| ApiError::Decode {
            path: path.to_string(),
            source,
        })
    }
}

pub fn to_value<T: Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(ApiError::Encode)
}

fn ensure_success(method: Method, path: &str, response: &ApiResponse) -> Result<(), ApiError> {
    if response.is_success() {
        Ok(())
    } else {
        Err(ApiError::Status {
            method,
            path: path.to_string(),
            status: response.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeApi;

    #[test]
    fn plain_string_strips_quotes_and_whitespace() {
        assert_eq!(plain_string("\"failing\"\n"), "failing");
        assert_eq!(plain_string("  ok "), "ok");
        assert_eq!(plain_string("\"\""), "");
    }

    #[tokio::test]
    async fn fetch_checks_uses_agent_path() {
        let api = FakeApi::new(|_, path, _| {
            assert_eq!(path, "/checkrunner/agent-1/");
            Ok(ApiResponse {
                status: 200,
                body: r#"{"check_interval": 60, "checks": []}"#.to_string(),
            })
        });
        let controller = Controller::new(api.clone(), "agent-1", 1);
        let list = controller.fetch_checks().await.expect("checks decode");
        assert_eq!(list.check_interval, 60);
        assert_eq!(api.calls().len(), 1);
    }

    #[tokio::test]
    async fn non_success_status_is_error() {
        let api = FakeApi::new(|_, _, _| {
            Ok(ApiResponse {
                status: 500,
                body: String::new(),
            })
        });
        let controller = Controller::new(api, "agent-1", 1);
        assert!(matches!(
            controller.fetch_checks().await,
            Err(ApiError::Status { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn report_check_returns_trimmed_verdict() {
        let api = FakeApi::new(|method, path, body| {
            assert_eq!(method, &Method::PATCH);
            assert_eq!(path, "/checkrunner/");
            assert_eq!(body.and_then(|b| b.get("id")).and_then(Value::as_i64), Some(4));
            Ok(ApiResponse {
                status: 200,
                body: "\"failing\"".to_string(),
            })
        });
        let controller = Controller::new(api, "agent-1", 1);
        let verdict = controller
            .report_check(&serde_json::json!({"id": 4}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(verdict, "failing");
    }
}
