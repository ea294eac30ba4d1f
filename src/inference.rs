//! Client for the hosted chat-completion provider.

use crate::config::InferenceConfig;
use crate::error::UpstreamError;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Text fragments in upstream order; ends after the last fragment or the
/// first error.
pub type ChunkStream = BoxStream<'static, Result<String, UpstreamError>>;

/// What the relay asks the provider for.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn for_request(config: &InferenceConfig, message: &str, language: Option<&str>) -> Self {
        let language = language
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(config.language.as_str());
        Self {
            system: config.system_prompt.clone(),
            user: format!("Write {} code for: {}", language, message),
        }
    }
}

/// Source of streamed completions.
#[async_trait]
pub trait CompletionSource: Send + Sync {
    /// Open the upstream stream. Errors here happen before any output.
    async fn stream_completion(&self, prompt: Prompt) -> Result<ChunkStream, UpstreamError>;
}

/// OpenAI-compatible streaming client (Hugging Face router by default).
pub struct HfClient {
    config: InferenceConfig,
    client: reqwest::Client,
}

impl HfClient {
    pub fn new(config: InferenceConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn build_request<'a>(&'a self, prompt: &'a Prompt) -> CompletionRequest<'a> {
        CompletionRequest {
            model: &self.config.model,
            messages: [
                Message {
                    role: "system",
                    content: &prompt.system,
                },
                Message {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            top_p: self.config.top_p.0,
            stream: true,
        }
    }
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: [Message<'a>; 2],
    temperature: f64,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Pull the text fragment out of one upstream `data:` payload.
///
/// `Ok(None)` for keep-alive style chunks with no choices or no content.
pub fn parse_chunk(data: &str) -> Result<Option<String>, UpstreamError> {
    let chunk: StreamChunk =
        serde_json::from_str(data).map_err(|e| UpstreamError::Malformed(e.to_string()))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .filter(|content| !content.is_empty()))
}

fn is_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}

#[async_trait]
impl CompletionSource for HfClient {
    async fn stream_completion(&self, prompt: Prompt) -> Result<ChunkStream, UpstreamError> {
        info!(model = %self.config.model, "Opening inference stream");
        let response = self
            .client
            .post(&self.config.url)
            .bearer_auth(&self.config.api_key)
            .json(&self.build_request(&prompt))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let chunks = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                let more = !matches!(event, Ok(e) if is_done(&e.data));
                futures_util::future::ready(more)
            })
            .filter_map(|event| {
                let item = match event {
                    Ok(e) => parse_chunk(&e.data).transpose(),
                    Err(e) => Some(Err(UpstreamError::Stream(e.to_string()))),
                };
                futures_util::future::ready(item)
            });
        Ok(chunks.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopP;

    fn config() -> InferenceConfig {
        InferenceConfig {
            api_key: "hf_test".into(),
            url: "http://127.0.0.1:1/v1/chat/completions".into(),
            model: "Qwen/Qwen2.5-72B-Instruct".into(),
            temperature: 0.3,
            max_tokens: 2048,
            top_p: TopP(Some(0.9)),
            language: "PythOwO".into(),
            system_prompt: "be terse".into(),
        }
    }

    #[test]
    fn prompt_uses_hint_or_default_language() {
        let config = config();
        let prompt = Prompt::for_request(&config, "add two numbers", None);
        assert_eq!(prompt.user, "Write PythOwO code for: add two numbers");
        assert_eq!(prompt.system, "be terse");

        let prompt = Prompt::for_request(&config, "sum a list", Some("Python"));
        assert_eq!(prompt.user, "Write Python code for: sum a list");

        let prompt = Prompt::for_request(&config, "sum a list", Some("  "));
        assert_eq!(prompt.user, "Write PythOwO code for: sum a list");
    }

    #[test]
    fn request_body_carries_sampling_parameters() {
        let client = HfClient::new(config());
        let prompt = Prompt {
            system: "sys".into(),
            user: "usr".into(),
        };
        let body = serde_json::to_value(client.build_request(&prompt)).unwrap();
        assert_eq!(body["model"], "Qwen/Qwen2.5-72B-Instruct");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "usr");
        assert_eq!(body["max_tokens"], 2048);
        assert_eq!(body["top_p"], 0.9);
        assert_eq!(body["stream"], true);

        let mut no_top_p = config();
        no_top_p.top_p = TopP(None);
        let client = HfClient::new(no_top_p);
        let body = serde_json::to_value(client.build_request(&prompt)).unwrap();
        assert!(body.get("top_p").is_none());
    }

    #[test]
    fn parse_chunk_extracts_delta_content() {
        let data = r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"pwint"}}]}"#;
        assert_eq!(parse_chunk(data).unwrap(), Some("pwint".to_string()));
    }

    #[test]
    fn parse_chunk_skips_empty_chunks() {
        assert_eq!(parse_chunk(r#"{"choices":[]}"#).unwrap(), None);
        assert_eq!(parse_chunk(r#"{"choices":[{"delta":{}}]}"#).unwrap(), None);
        assert_eq!(
            parse_chunk(r#"{"choices":[{"delta":{"content":""}}]}"#).unwrap(),
            None
        );
        assert_eq!(parse_chunk(r#"{"usage":{"total_tokens":5}}"#).unwrap(), None);
    }

    #[test]
    fn parse_chunk_rejects_garbage() {
        assert!(matches!(
            parse_chunk("not json"),
            Err(UpstreamError::Malformed(_))
        ));
    }

    #[test]
    fn done_marker_detection() {
        assert!(is_done("[DONE]"));
        assert!(is_done(" [DONE]\n"));
        assert!(!is_done(r#"{"choices":[]}"#));
    }

    #[tokio::test]
    async fn unreachable_provider_fails_before_streaming() {
        let client = HfClient::new(config());
        let prompt = Prompt {
            system: "sys".into(),
            user: "usr".into(),
        };
        let err = client.stream_completion(prompt).await.err().unwrap();
        assert!(matches!(err, UpstreamError::Request(_)));
    }

    /// Serve a canned OpenAI-style stream on `/ok` and a 401 on `/denied`.
    async fn canned_provider() -> std::net::SocketAddr {
        use axum::http::{header, StatusCode};
        use axum::routing::post;

        let chunk = |content: &str| {
            format!(
                "data: {}\n\n",
                serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
            )
        };
        let body = [
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n".to_string(),
            chunk("pwease "),
            chunk("x = 1"),
            "data: [DONE]\n\n".to_string(),
            chunk("late"),
        ]
        .concat();

        let app = axum::Router::new()
            .route(
                "/ok",
                post(move || async move { ([(header::CONTENT_TYPE, "text/event-stream")], body) }),
            )
            .route(
                "/denied",
                post(|| async { (StatusCode::UNAUTHORIZED, "bad token") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    #[tokio::test]
    async fn streams_deltas_until_done_marker() {
        let addr = canned_provider().await;
        let mut config = config();
        config.url = format!("http://{}/ok", addr);
        let client = HfClient::new(config);
        let prompt = Prompt {
            system: "sys".into(),
            user: "usr".into(),
        };

        let chunks: Vec<String> = client
            .stream_completion(prompt)
            .await
            .unwrap()
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(chunks, vec!["pwease ", "x = 1"]);
    }

    #[tokio::test]
    async fn rejected_request_reports_status_and_body() {
        let addr = canned_provider().await;
        let mut config = config();
        config.url = format!("http://{}/denied", addr);
        let client = HfClient::new(config);
        let prompt = Prompt {
            system: "sys".into(),
            user: "usr".into(),
        };

        let err = client.stream_completion(prompt).await.err().unwrap();
        match err {
            UpstreamError::Status { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad token");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
