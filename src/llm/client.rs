//! OpenAI-compatible chat completions over server-sent events.

use super::{BoxFuture, ChatMessage, ModelClient};
use crate::config::Config;
use crate::error::{CodespeakError, Result};
use crate::util::truncate;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u64 = 2;
const REQUEST_TIMEOUT_SECS: u64 = 300;
const CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
    max_retries: u32,
}

impl OpenAiClient {
    pub fn new(
        api_key: impl Into<String>,
        api_base: impl Into<String>,
        model: impl Into<String>,
        max_retries: u32,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| CodespeakError::Model(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            api_base: api_base.into(),
            model: model.into(),
            max_retries,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config.api_key().ok_or_else(|| {
            CodespeakError::Model(
                "No API key configured. Set OPENAI_API_KEY or run 'codespeak set-key'.".to_string(),
            )
        })?;
        Self::new(api_key, &config.api_base, &config.model, config.model_retries)
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }

    async fn stream_completion(&self, messages: &[ChatMessage]) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
        };
        let mut retry_count = 0;

        loop {
            let sent = self
                .http
                .post(self.completions_url())
                .bearer_auth(&self.api_key)
                .json(&request)
                .send()
                .await;
            let response = match sent {
                Ok(response) => response,
                Err(err) => {
                    if is_retryable_network_error(&err) && retry_count < self.max_retries {
                        retry_count += 1;
                        let wait = backoff_secs(retry_count);
                        tracing::warn!(
                            "model request failed ({}). Retrying in {}s (attempt {}/{})",
                            err,
                            wait,
                            retry_count,
                            self.max_retries
                        );
                        tokio::time::sleep(Duration::from_secs(wait)).await;
                        continue;
                    }
                    return Err(CodespeakError::Model(err.to_string()));
                }
            };

            let status = response.status();
            let retry_after_hint = parse_retry_after_header(response.headers());
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                let retryable = status.as_u16() == 429 || status.is_server_error();
                if retryable && retry_count < self.max_retries {
                    retry_count += 1;
                    let wait = retry_after_hint.unwrap_or_else(|| backoff_secs(retry_count));
                    tracing::warn!(
                        "model API returned {}. Retrying in {}s (attempt {}/{})",
                        status,
                        wait,
                        retry_count,
                        self.max_retries
                    );
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    continue;
                }
                let message = match status.as_u16() {
                    401 => "Invalid API key. Run 'codespeak set-key' to update it.".to_string(),
                    429 => format!("Rate limited after {} retries.", retry_count),
                    500..=599 => format!(
                        "Model server error ({}). The service may be temporarily unavailable.",
                        status
                    ),
                    _ => format!("API error {}: {}", status, truncate(&text, 200)),
                };
                return Err(CodespeakError::Model(message));
            }

            return consume_stream(response).await;
        }
    }
}

impl ModelClient for OpenAiClient {
    fn complete<'a>(&'a self, messages: &'a [ChatMessage]) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.stream_completion(messages))
    }
}

async fn consume_stream(response: reqwest::Response) -> Result<String> {
    let mut stream = response.bytes_stream();
    let mut events = SseAccumulator::default();
    while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|e| CodespeakError::Model(format!("Stream read failed: {}", e)))?;
        if events.feed(&bytes)? {
            return Ok(events.content);
        }
    }
    events.finish()
}

/// Collects `data:` payloads from an event stream into the reply text.
///
/// Bytes are buffered until a full line arrives, so a character split across network chunks
/// is decoded whole.
#[derive(Default)]
struct SseAccumulator {
    buffer: Vec<u8>,
    event_data: String,
    content: String,
}

impl SseAccumulator {
    /// Feed raw bytes. Returns true once `[DONE]` is seen.
    fn feed(&mut self, bytes: &[u8]) -> Result<bool> {
        self.buffer.extend_from_slice(bytes);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..pos]);
            let line = line.trim_end();

            if line.is_empty() {
                if self.flush_event()? {
                    return Ok(true);
                }
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                if !self.event_data.is_empty() {
                    self.event_data.push('\n');
                }
                self.event_data.push_str(data.trim_start());
            }
        }
        Ok(false)
    }

    fn flush_event(&mut self) -> Result<bool> {
        if self.event_data.is_empty() {
            return Ok(false);
        }
        let data = std::mem::take(&mut self.event_data);
        if data.trim() == "[DONE]" {
            return Ok(true);
        }
        let chunk: StreamChunk = serde_json::from_str(&data).map_err(|e| {
            CodespeakError::Model(format!("malformed stream event: {} ({})", e, truncate(&data, 200)))
        })?;
        for choice in chunk.choices {
            if let Some(piece) = choice.delta.content {
                self.content.push_str(&piece);
            }
        }
        Ok(false)
    }

    /// Handle a stream that closed without a terminating blank line or `[DONE]`.
    fn finish(mut self) -> Result<String> {
        if !self.buffer.trim_ascii().is_empty() {
            let mut rest = std::mem::take(&mut self.buffer);
            rest.push(b'\n');
            self.feed(&rest)?;
        }
        self.flush_event()?;
        if self.content.is_empty() {
            return Err(CodespeakError::Model("empty response from model".to_string()));
        }
        Ok(self.content)
    }
}

fn backoff_secs(retry_count: u32) -> u64 {
    let factor = BACKOFF_MULTIPLIER.pow(retry_count.saturating_sub(1));
    (INITIAL_BACKOFF_MS.saturating_mul(factor) / 1000).max(1)
}

fn is_retryable_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn parse_retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0 && *secs < 300)
}
