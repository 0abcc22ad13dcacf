//! Databricks model-serving endpoint client.
//!
//! The chat surfaces only see the [`ServingEndpoint`] trait; the HTTP
//! details (SSE framing, request bodies, response shapes) stay in here.

use crate::config::ServingConfig;
use crate::stream::item_messages;
use crate::types::{Rating, TaskType, WireMessage};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::future;
use futures::stream::{BoxStream, StreamExt};
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const FEEDBACK_SOURCE_ID: &str = "forage-chat";

#[derive(Debug, Error)]
pub enum ServingError {
    #[error("request to serving endpoint failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("serving endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("event stream failed: {0}")]
    Stream(String),
    #[error("failed to decode endpoint payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("malformed stream chunk: {0}")]
    MalformedChunk(String),
    #[error("unsupported endpoint response: {0}")]
    UnsupportedResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub task_type: TaskType,
    pub supports_feedback: bool,
}

#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub task_type: TaskType,
    pub messages: Vec<WireMessage>,
    pub return_traces: bool,
}

impl InvocationRequest {
    pub fn body(&self, stream: bool) -> Value {
        let mut body = match self.task_type {
            TaskType::Responses => json!({ "input": self.messages, "context": {} }),
            TaskType::ChatAgent | TaskType::ChatCompletions => json!({ "messages": self.messages }),
        };
        if stream {
            body["stream"] = json!(true);
        }
        if self.return_traces {
            body["databricks_options"] = json!({ "return_trace": true });
        }
        body
    }
}

/// Finished answer from a non-streaming invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub messages: Vec<WireMessage>,
    pub correlation_id: Option<String>,
}

pub type ChunkStream = BoxStream<'static, Result<Value, ServingError>>;

#[async_trait]
pub trait ServingEndpoint: Send + Sync {
    fn name(&self) -> &str;

    /// Task type and feedback support, looked up once per endpoint.
    async fn describe(&self) -> Result<EndpointInfo, ServingError>;

    /// Lazy, finite, non-restartable sequence of raw chunks.
    async fn stream(&self, request: &InvocationRequest) -> Result<ChunkStream, ServingError>;

    async fn query(&self, request: &InvocationRequest) -> Result<QueryResult, ServingError>;

    async fn submit_feedback(&self, correlation_id: &str, rating: Rating)
    -> Result<(), ServingError>;
}

pub struct DatabricksClient {
    endpoint: String,
    host: String,
    token: String,
    http: reqwest::Client,
}

impl DatabricksClient {
    pub fn new(cfg: &ServingConfig, timeout: Duration) -> Result<Self, ServingError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: cfg.endpoint.clone(),
            host: normalize_host(&cfg.host),
            token: cfg.token.clone(),
            http,
        })
    }

    fn endpoint_url(&self) -> String {
        format!("{}/api/2.0/serving-endpoints/{}", self.host, self.endpoint)
    }

    fn invocations_url(&self) -> String {
        format!("{}/serving-endpoints/{}/invocations", self.host, self.endpoint)
    }

    fn feedback_url(&self) -> String {
        format!(
            "{}/serving-endpoints/{}/served-models/feedback/invocations",
            self.host, self.endpoint
        )
    }

    async fn post(&self, url: String, body: &Value) -> Result<reqwest::Response, ServingError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        check_status(response).await
    }
}

#[async_trait]
impl ServingEndpoint for DatabricksClient {
    fn name(&self) -> &str {
        &self.endpoint
    }

    async fn describe(&self) -> Result<EndpointInfo, ServingError> {
        let response = self
            .http
            .get(self.endpoint_url())
            .bearer_auth(&self.token)
            .send()
            .await?;
        let value: Value = check_status(response).await?.json().await?;
        let info = parse_endpoint_info(&value);
        info!(
            endpoint = %self.endpoint,
            task_type = ?info.task_type,
            supports_feedback = info.supports_feedback,
            "described serving endpoint"
        );
        Ok(info)
    }

    async fn stream(&self, request: &InvocationRequest) -> Result<ChunkStream, ServingError> {
        debug!(endpoint = %self.endpoint, messages = request.messages.len(), "opening stream");
        let response = self.post(self.invocations_url(), &request.body(true)).await?;
        let chunks = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                let done = matches!(event, Ok(event) if event.data.trim() == "[DONE]");
                future::ready(!done)
            })
            .filter_map(|event| async move {
                match event {
                    Ok(event) if event.data.trim().is_empty() => None,
                    Ok(event) => Some(serde_json::from_str::<Value>(&event.data).map_err(ServingError::from)),
                    Err(err) => Some(Err(ServingError::Stream(err.to_string()))),
                }
            })
            .boxed();
        Ok(chunks)
    }

    async fn query(&self, request: &InvocationRequest) -> Result<QueryResult, ServingError> {
        debug!(endpoint = %self.endpoint, messages = request.messages.len(), "querying without streaming");
        let response = self.post(self.invocations_url(), &request.body(false)).await?;
        let value: Value = response.json().await?;
        parse_query_response(value)
    }

    async fn submit_feedback(
        &self,
        correlation_id: &str,
        rating: Rating,
    ) -> Result<(), ServingError> {
        let body = feedback_body(correlation_id, rating);
        self.post(self.feedback_url(), &body).await?;
        info!(request_id = %correlation_id, rating = rating.as_str(), "submitted feedback");
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ServingError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(ServingError::Status { status, body })
}

fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

pub fn parse_endpoint_info(value: &Value) -> EndpointInfo {
    let task = value.get("task").and_then(Value::as_str).unwrap_or_default();
    let config = value.get("config").unwrap_or(&Value::Null);
    let supports_feedback = ["served_entities", "served_models"]
        .iter()
        .filter_map(|key| config.get(*key).and_then(Value::as_array))
        .flatten()
        .any(|entity| entity.get("name").and_then(Value::as_str) == Some("feedback"));
    EndpointInfo {
        task_type: TaskType::from_task(task),
        supports_feedback,
    }
}

pub fn parse_query_response(value: Value) -> Result<QueryResult, ServingError> {
    let correlation_id = value
        .pointer("/databricks_output/databricks_request_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(messages) = value.get("messages") {
        let messages: Vec<WireMessage> = serde_json::from_value(messages.clone())?;
        return Ok(QueryResult {
            messages,
            correlation_id,
        });
    }

    if let Some(choice) = value.pointer("/choices/0/message") {
        let mut choice = choice.clone();
        // List-shaped content collapses to its text parts.
        if let Some(parts) = choice.get("content").and_then(Value::as_array) {
            let combined: String = parts
                .iter()
                .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            choice["content"] = Value::String(combined);
        }
        let message: WireMessage = serde_json::from_value(choice)?;
        return Ok(QueryResult {
            messages: vec![message],
            correlation_id,
        });
    }

    if let Some(output) = value.get("output").and_then(Value::as_array) {
        let messages = output.iter().flat_map(item_messages).collect();
        return Ok(QueryResult {
            messages,
            correlation_id,
        });
    }

    Err(ServingError::UnsupportedResponse(
        "expected a chat completion, chat agent, or responses agent payload".to_string(),
    ))
}

fn feedback_body(correlation_id: &str, rating: Rating) -> Value {
    let text_assessments = json!([{
        "ratings": { "answer_correct": { "value": rating.as_str() } },
        "free_text_comment": null,
    }]);
    json!({
        "dataframe_records": [{
            "source": json!({ "id": FEEDBACK_SOURCE_ID, "type": "human" }).to_string(),
            "request_id": correlation_id,
            "text_assessments": text_assessments.to_string(),
            "retrieval_assessments": "[]",
        }]
    })
}
