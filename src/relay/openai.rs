//! OpenAI completion client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

/// What gets sent to the completion API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionRequest {
    /// Role-tagged turns for the chat endpoint.
    Chat(Vec<Turn>),
    /// A flat prompt for the legacy completions endpoint.
    Prompt(String),
}

#[derive(Debug)]
pub enum CompletionError {
    /// Transport failure or timeout.
    Http(String),
    /// Non-2xx response (quota, auth, bad request, ...).
    Api { status: u16, body: String },
    Parse(String),
    Empty,
}

impl CompletionError {
    /// Quota, auth and network failures, as opposed to unexpected ones.
    pub fn is_api_error(&self) -> bool {
        matches!(self, CompletionError::Http(_) | CompletionError::Api { .. })
    }
}

impl std::fmt::Display for CompletionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionError::Http(e) => write!(f, "HTTP error: {e}"),
            CompletionError::Api { status, body } => write!(f, "API error {status}: {body}"),
            CompletionError::Parse(e) => write!(f, "Parse error: {e}"),
            CompletionError::Empty => write!(f, "Empty response"),
        }
    }
}

impl std::error::Error for CompletionError {}

/// Anything that can turn a request into generated text.
#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}

pub struct OpenAiClient {
    api_key: String,
    api_base: String,
    chat_model: String,
    completion_model: String,
    max_tokens: u32,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct PromptRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct PromptResponse {
    choices: Vec<PromptChoice>,
}

#[derive(Deserialize)]
struct PromptChoice {
    text: String,
}

impl OpenAiClient {
    pub fn new(
        api_key: String,
        api_base: String,
        chat_model: String,
        completion_model: String,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<Self, CompletionError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CompletionError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_key,
            api_base,
            chat_model,
            completion_model,
            max_tokens,
            http,
        })
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<String, CompletionError> {
        let response = self
            .http
            .post(format!("{}/{}", self.api_base, path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| CompletionError::Http(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CompletionError::Http(format!("failed to read response: {e}")))?;

        debug!("OpenAI {path} response status: {status}");

        if !status.is_success() {
            return Err(CompletionError::Api { status: status.as_u16(), body: text });
        }
        Ok(text)
    }
}

#[async_trait]
impl Completer for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        match request {
            CompletionRequest::Chat(turns) => {
                let body = ChatRequest {
                    model: &self.chat_model,
                    messages: turns
                        .iter()
                        .map(|t| ApiMessage { role: t.role.as_str(), content: &t.content })
                        .collect(),
                };
                let raw = self.post("chat/completions", &body).await?;
                parse_chat_response(&raw)
            }
            CompletionRequest::Prompt(prompt) => {
                let body = PromptRequest {
                    model: &self.completion_model,
                    prompt,
                    max_tokens: self.max_tokens,
                };
                let raw = self.post("completions", &body).await?;
                parse_prompt_response(&raw)
            }
        }
    }
}

fn parse_chat_response(raw: &str) -> Result<String, CompletionError> {
    let parsed: ChatResponse =
        serde_json::from_str(raw).map_err(|e| CompletionError::Parse(e.to_string()))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or(CompletionError::Empty)
}

fn parse_prompt_response(raw: &str) -> Result<String, CompletionError> {
    let parsed: PromptResponse =
        serde_json::from_str(raw).map_err(|e| CompletionError::Parse(e.to_string()))?;
    parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.text.trim().to_string())
        .filter(|c| !c.is_empty())
        .ok_or(CompletionError::Empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_response() {
        let raw = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"Hi!"}}]}"#;
        assert_eq!(parse_chat_response(raw).unwrap(), "Hi!");
    }

    #[test]
    fn test_parse_chat_response_empty() {
        assert!(matches!(parse_chat_response(r#"{"choices":[]}"#), Err(CompletionError::Empty)));
        let null_content = r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#;
        assert!(matches!(parse_chat_response(null_content), Err(CompletionError::Empty)));
    }

    #[test]
    fn test_parse_prompt_response_trims() {
        let raw = r#"{"choices":[{"text":"\n\n  answer here \n","index":0}]}"#;
        assert_eq!(parse_prompt_response(raw).unwrap(), "answer here");
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(parse_chat_response("<html>"), Err(CompletionError::Parse(_))));
        assert!(matches!(parse_prompt_response("{}"), Err(CompletionError::Parse(_))));
    }

    #[test]
    fn test_error_classification() {
        assert!(CompletionError::Http("timeout".into()).is_api_error());
        assert!(CompletionError::Api { status: 429, body: "quota".into() }.is_api_error());
        assert!(!CompletionError::Parse("bad".into()).is_api_error());
        assert!(!CompletionError::Empty.is_api_error());
    }

    #[test]
    fn test_chat_request_shape() {
        let turns = [Turn::new(Role::System, "sys"), Turn::new(Role::Assistant, "hello")];
        let body = ChatRequest {
            model: "gpt-3.5-turbo",
            messages: turns
                .iter()
                .map(|t| ApiMessage { role: t.role.as_str(), content: &t.content })
                .collect(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gpt-3.5-turbo");
        assert_eq!(json["messages"][1]["role"], "assistant");
        assert_eq!(json["messages"][1]["content"], "hello");
    }
}
