//! JSON gateway client implementing the mail, analysis, and task traits.
//!
//! Endpoints, relative to the configured base URL:
//!
//! | Call           | Request                                      |
//! |----------------|----------------------------------------------|
//! | fetch_unread   | `GET  users/{user}/messages/unread?limit=N`  |
//! | send           | `POST users/{user}/messages/send`            |
//! | label          | `POST users/{user}/messages/{id}/labels`     |
//! | mark_read      | `POST users/{user}/messages/{id}/read`       |
//! | classify       | `POST analysis/classify`                     |
//! | draft          | `POST analysis/draft`                        |
//! | create_task    | `POST users/{user}/tasks`                    |

use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::config::GatewayConfig;
use crate::error::{AnalysisError, ConfigError, ProviderError};
use crate::mail::provider::{AnalysisService, MailProvider, TaskSink};
use crate::mail::types::{Classification, Email, TaskRecord};

#[derive(Debug, Deserialize)]
struct DraftResponse {
    body: String,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    id: String,
}

pub struct HttpGateway {
    base: Url,
    token: SecretString,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: "gateway base_url".into(),
            message,
        };
        let base = Url::parse(&config.base_url).map_err(|e| invalid(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(invalid(format!("{} cannot be a base URL", config.base_url)));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            base,
            token: config.api_token.clone(),
            client,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn post(
        &self,
        operation: &str,
        url: Url,
        body: serde_json::Value,
    ) -> Result<Response, ProviderError> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(self.token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;
        check_status(operation, resp).await
    }
}

fn transport_error(operation: &str, e: reqwest::Error) -> ProviderError {
    ProviderError::Transient {
        operation: operation.to_string(),
        reason: e.to_string(),
    }
}

/// 429 and 5xx are worth retrying; any other non-success status is not.
async fn check_status(operation: &str, resp: Response) -> Result<Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let reason = format!("{status}: {}", crate::mail::types::truncate(text.trim(), 200));
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(ProviderError::Transient {
            operation: operation.to_string(),
            reason,
        })
    } else {
        Err(ProviderError::Permanent {
            operation: operation.to_string(),
            reason,
        })
    }
}

fn analysis_error(e: ProviderError) -> AnalysisError {
    AnalysisError::RequestFailed {
        reason: e.to_string(),
    }
}

#[async_trait]
impl MailProvider for HttpGateway {
    async fn fetch_unread(&self, user_id: &str, limit: usize) -> Result<Vec<Email>, ProviderError> {
        let mut url = self.url(&["users", user_id, "messages", "unread"]);
        url.query_pairs_mut().append_pair("limit", &limit.to_string());
        let resp = self
            .client
            .get(url)
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| transport_error("fetch_unread", e))?;
        let resp = check_status("fetch_unread", resp).await?;
        resp.json().await.map_err(|e| ProviderError::Permanent {
            operation: "fetch_unread".into(),
            reason: format!("invalid response body: {e}"),
        })
    }

    async fn send(
        &self,
        user_id: &str,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), ProviderError> {
        let url = self.url(&["users", user_id, "messages", "send"]);
        self.post("send", url, json!({ "to": to, "subject": subject, "body": body }))
            .await?;
        Ok(())
    }

    async fn label(&self, user_id: &str, email_id: &str, name: &str) -> Result<(), ProviderError> {
        let url = self.url(&["users", user_id, "messages", email_id, "labels"]);
        self.post("label", url, json!({ "label": name })).await?;
        Ok(())
    }

    async fn mark_read(&self, user_id: &str, email_id: &str) -> Result<(), ProviderError> {
        let url = self.url(&["users", user_id, "messages", email_id, "read"]);
        self.post("mark_read", url, json!({})).await?;
        Ok(())
    }
}

#[async_trait]
impl AnalysisService for HttpGateway {
    async fn classify(&self, email: &Email) -> Result<Classification, AnalysisError> {
        let url = self.url(&["analysis", "classify"]);
        let resp = self
            .post("classify", url, json!({ "email": email }))
            .await
            .map_err(analysis_error)?;
        resp.json().await.map_err(|e| AnalysisError::InvalidResponse {
            reason: e.to_string(),
        })
    }

    async fn draft(
        &self,
        email: &Email,
        instructions: &str,
        tone: &str,
    ) -> Result<String, AnalysisError> {
        let url = self.url(&["analysis", "draft"]);
        let resp = self
            .post(
                "draft",
                url,
                json!({ "email": email, "instructions": instructions, "tone": tone }),
            )
            .await
            .map_err(analysis_error)?;
        let draft: DraftResponse = resp.json().await.map_err(|e| AnalysisError::InvalidResponse {
            reason: e.to_string(),
        })?;
        Ok(draft.body)
    }
}

#[async_trait]
impl TaskSink for HttpGateway {
    async fn create_task(&self, user_id: &str, task: &TaskRecord) -> Result<String, ProviderError> {
        let url = self.url(&["users", user_id, "tasks"]);
        let resp = self
            .post("create_task", url, serde_json::to_value(task).unwrap_or_default())
            .await?;
        let created: TaskResponse = resp.json().await.map_err(|e| ProviderError::Permanent {
            operation: "create_task".into(),
            reason: format!("invalid response body: {e}"),
        })?;
        Ok(created.id)
    }
}
