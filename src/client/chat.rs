//! OpenAI-compatible chat completions client (xAI Grok by default).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::ClassifierConfig;

use super::{ClientError, ClientResult, LanguageModel};

pub struct ChatCompletionsClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
}

impl ChatCompletionsClient {
    pub fn new(config: &ClassifierConfig) -> ClientResult<Self> {
        if config.api_key.trim().is_empty() {
            return Err(ClientError::Config(
                "classifier api_key must be configured (or XAI_API_KEY set)".to_string(),
            ));
        }

        let http = Client::builder()
            .user_agent("trade-signal-desk/0.1")
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(ClientError::Http)?;

        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl LanguageModel for ChatCompletionsClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> ClientResult<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "system",
                content: prompt,
            }],
            temperature: self.temperature,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let resp = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::HttpStatus { status, body });
        }

        let parsed: ChatResponse = resp.json().await?;
        if let Some(usage) = &parsed.usage {
            debug!(
                target: "classifier",
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "completion usage"
            );
        }

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ClientError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_key: &str) -> ClassifierConfig {
        ClassifierConfig {
            base_url: "https://api.x.ai/v1/".to_string(),
            api_key: api_key.to_string(),
            model: "grok-3-mini".to_string(),
            temperature: 0.0,
            max_attempts: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 10_000,
            request_timeout_secs: 30,
        }
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        assert!(matches!(
            ChatCompletionsClient::new(&config("  ")),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn completions_url_joins_without_double_slash() {
        let client = ChatCompletionsClient::new(&config("key")).unwrap();
        assert_eq!(client.completions_url(), "https://api.x.ai/v1/chat/completions");
        assert_eq!(client.name(), "grok-3-mini");
    }

    #[test]
    fn request_asks_for_json_object() {
        let request = ChatRequest {
            model: "grok-3-mini",
            messages: vec![ChatMessage {
                role: "system",
                content: "classify",
            }],
            temperature: 0.0,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["messages"][0]["role"], "system");
    }

    #[test]
    fn response_without_content_deserializes() {
        let json = r#"{"choices":[{"index":0,"message":{"role":"assistant"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
        assert!(parsed.usage.is_none());
    }
}
