//! Streaming LLM providers.
//!
//! Implementations of [`vault_rag_core::generation::Generator`] selected by
//! `[generation] provider`:
//!
//! | Provider | Endpoint | Stream framing |
//! |----------|----------|----------------|
//! | `disabled` | none | n/a |
//! | `openai` | `POST {base_url}/chat/completions` | SSE `data:` lines, ends with `[DONE]` |
//! | `ollama` | `POST {base_url}/api/generate` | one JSON object per line, ends with `"done": true` |
//!
//! Both are read as a line-oriented byte stream. Dropping the returned
//! [`TokenStream`] drops the HTTP response and closes the connection.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::json;

use vault_rag_core::error::GenerationError;
use vault_rag_core::generation::{Generator, TokenStream};

use crate::config::GenerationConfig;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider names accepted by [`create_generator`].
pub const PROVIDERS: &[&str] = &["disabled", "openai", "ollama"];

pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &str) -> Result<TokenStream, GenerationError> {
        Err(GenerationError::Disabled)
    }
}

/// What one line of a provider stream means.
#[derive(Debug, PartialEq)]
enum Line {
    Token(String),
    Skip,
    Done,
}

type LineParser = fn(&str) -> Result<Line, GenerationError>;

struct LineState<S> {
    bytes: std::pin::Pin<Box<S>>,
    buf: Vec<u8>,
    pending: VecDeque<Result<String, GenerationError>>,
    finished: bool,
    parse: LineParser,
}

impl<S> LineState<S> {
    fn handle(&mut self, raw: &[u8]) {
        if self.finished {
            return;
        }
        let line = String::from_utf8_lossy(raw);
        match (self.parse)(line.trim_end_matches('\r')) {
            Ok(Line::Token(t)) if !t.is_empty() => self.pending.push_back(Ok(t)),
            Ok(Line::Token(_)) | Ok(Line::Skip) => {}
            Ok(Line::Done) => self.finished = true,
            Err(e) => {
                self.pending.push_back(Err(e));
                self.finished = true;
            }
        }
    }

    fn drain_lines(&mut self) {
        while let Some(nl) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=nl).collect();
            self.handle(&line[..line.len() - 1]);
        }
    }
}

/// Split a byte stream into lines and parse each into tokens. Lines may
/// span chunk boundaries, including mid-character.
fn token_stream<S, B, E>(bytes: S, parse: LineParser) -> TokenStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = LineState {
        bytes: Box::pin(bytes),
        buf: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
        parse,
    };
    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    st.buf.extend_from_slice(chunk.as_ref());
                    st.drain_lines();
                }
                Some(Err(e)) => {
                    st.pending
                        .push_back(Err(GenerationError::Stream(e.to_string())));
                    st.finished = true;
                }
                None => {
                    let rest = std::mem::take(&mut st.buf);
                    if !rest.is_empty() {
                        st.handle(&rest);
                    }
                    st.finished = true;
                }
            }
        }
    }))
}

async fn start(request: reqwest::RequestBuilder) -> Result<reqwest::Response, GenerationError> {
    let response = request
        .send()
        .await
        .map_err(|e| GenerationError::Request(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GenerationError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?)
}

fn required_model(config: &GenerationConfig) -> Result<String> {
    config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("generation.model required for {}", config.provider))
}

fn provider_error(json: &serde_json::Value) -> Option<GenerationError> {
    let err = json.get("error")?;
    let message = err
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string());
    Some(GenerationError::Stream(message))
}

pub struct OpenAIGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        Ok(Self {
            client: http_client()?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            api_key,
            model: required_model(config)?,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

fn parse_openai_line(line: &str) -> Result<Line, GenerationError> {
    let Some(payload) = line.trim().strip_prefix("data:") else {
        return Ok(Line::Skip);
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return Ok(Line::Done);
    }
    let json: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| GenerationError::Stream(format!("bad event payload: {e}")))?;
    if let Some(err) = provider_error(&json) {
        return Err(err);
    }
    Ok(json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .map(|c| Line::Token(c.to_string()))
        .unwrap_or(Line::Skip))
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<TokenStream, GenerationError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": true,
        });
        let response = start(
            self.client
                .post(url)
                .bearer_auth(&self.api_key)
                .json(&body),
        )
        .await?;
        Ok(token_stream(response.bytes_stream(), parse_openai_line))
    }
}

pub struct OllamaGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| OLLAMA_BASE_URL.to_string()),
            model: required_model(config)?,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

fn parse_ollama_line(line: &str) -> Result<Line, GenerationError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Line::Skip);
    }
    let json: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| GenerationError::Stream(format!("bad stream line: {e}")))?;
    if let Some(err) = provider_error(&json) {
        return Err(err);
    }
    let token = json.get("response").and_then(|r| r.as_str()).unwrap_or("");
    let done = json.get("done").and_then(|d| d.as_bool()).unwrap_or(false);
    if !token.is_empty() {
        Ok(Line::Token(token.to_string()))
    } else if done {
        Ok(Line::Done)
    } else {
        Ok(Line::Skip)
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<TokenStream, GenerationError> {
        let url = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": true,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens,
            },
        });
        let response = start(self.client.post(url).json(&body)).await?;
        Ok(token_stream(response.bytes_stream(), parse_ollama_line))
    }
}
