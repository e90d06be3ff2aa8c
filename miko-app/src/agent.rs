//! Streaming chat agent adapter.
//!
//! Talks to an OpenAI-compatible chat completions endpoint with `stream:true`
//! and converts the SSE delta stream into gateway agent events. Dropping the
//! returned [`AgentStream`] cancels the transfer.

use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use miko_gateway::agent::{AgentEvent, AgentHandle, AgentSink, AgentStream, AgentStreamRequest};

use crate::config::AgentConfig;

/// Agent engine backed by an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiChatAgent {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    default_persona: Option<String>,
    stream_buffer: usize,
}

impl OpenAiChatAgent {
    pub fn new(cfg: &AgentConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("miko/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow!("Failed to initialize HTTP client: {}", e))?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            default_persona: cfg.persona.clone(),
            stream_buffer: cfg.stream_buffer.max(1),
        })
    }

    fn build_request_body(&self, request: &AgentStreamRequest) -> serde_json::Value {
        let persona = request
            .persona
            .clone()
            .or_else(|| self.default_persona.clone());

        let mut messages = Vec::new();
        if let Some(persona) = persona {
            messages.push(serde_json::json!({
                "role": "system",
                "content": persona,
            }));
        }

        // With image attachments the user message becomes a multi-part
        // content array in the vision format; otherwise a plain string.
        if request.images.is_empty() {
            messages.push(serde_json::json!({
                "role": "user",
                "content": request.content,
            }));
        } else {
            let mut parts = vec![serde_json::json!({
                "type": "text",
                "text": request.content,
            })];
            for image in &request.images {
                parts.push(serde_json::json!({
                    "type": "image_url",
                    "image_url": { "url": format!("data:image/png;base64,{}", image) },
                }));
            }
            messages.push(serde_json::json!({
                "role": "user",
                "content": parts,
            }));
        }

        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "user": request.user_id,
        })
    }
}

#[async_trait]
impl AgentHandle for OpenAiChatAgent {
    async fn stream(&self, request: AgentStreamRequest) -> anyhow::Result<AgentStream> {
        let (sink, stream) = AgentStream::channel(self.stream_buffer);
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_request_body(&request);
        let http = self.http.clone();
        let api_key = self.api_key.clone();
        let session_id = request.session_id.clone();

        tokio::spawn(async move {
            run_stream(http, url, api_key, body, session_id, sink).await;
        });

        Ok(stream)
    }
}

async fn run_stream(
    http: reqwest::Client,
    url: String,
    api_key: String,
    body: serde_json::Value,
    session_id: String,
    sink: AgentSink,
) {
    let turn_id = Uuid::new_v4().to_string();
    if !sink
        .send(AgentEvent::StreamStart {
            turn_id: turn_id.clone(),
            session_id: session_id.clone(),
        })
        .await
    {
        return;
    }

    let mut request = http.post(&url).json(&body);
    if !api_key.trim().is_empty() {
        request = request.bearer_auth(api_key.trim());
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            let _ = sink.fail(anyhow!("agent request failed: {}", e)).await;
            return;
        }
    };
    if !response.status().is_success() {
        let status = response.status();
        let detail = response.text().await.unwrap_or_default();
        let _ = sink
            .fail(anyhow!("agent endpoint returned {}: {}", status, detail))
            .await;
        return;
    }

    let mut content = String::new();
    let mut line_buffer = String::new();
    let mut byte_stream = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            _ = sink.cancelled() => {
                debug!(session_id = %session_id, "Agent stream reader cancelled");
                return;
            }
            chunk = byte_stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                line_buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = line_buffer.find('\n') {
                    let line = line_buffer[..pos].trim_end_matches('\r').to_string();
                    line_buffer.drain(..=pos);

                    match parse_sse_line(&line) {
                        SseLine::Done => {
                            let _ = sink
                                .send(AgentEvent::StreamEnd {
                                    turn_id,
                                    session_id,
                                    content,
                                })
                                .await;
                            return;
                        }
                        SseLine::Data(value) => {
                            let delta = extract_delta(&value);
                            if let Some(text) = delta.content {
                                content.push_str(&text);
                                if !sink
                                    .send(AgentEvent::StreamToken {
                                        chunk: text,
                                        node: None,
                                    })
                                    .await
                                {
                                    return;
                                }
                            }
                            for (tool_name, args) in delta.tool_calls {
                                if !sink
                                    .send(AgentEvent::ToolCall {
                                        tool_name,
                                        args,
                                        node: None,
                                    })
                                    .await
                                {
                                    return;
                                }
                            }
                        }
                        SseLine::Ignore => {}
                    }
                }
            }
            Some(Err(e)) => {
                warn!(session_id = %session_id, error = %e, "Agent byte stream failed");
                let _ = sink.fail(anyhow!("agent stream failed: {}", e)).await;
                return;
            }
            None => {
                // Endpoint closed without a [DONE] marker; treat what we have
                // as the complete response.
                let _ = sink
                    .send(AgentEvent::StreamEnd {
                        turn_id,
                        session_id,
                        content,
                    })
                    .await;
                return;
            }
        }
    }
}

/// One parsed server-sent-events line.
#[derive(Debug, PartialEq)]
enum SseLine {
    Data(serde_json::Value),
    Done,
    Ignore,
}

fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:") else {
        return SseLine::Ignore;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str(payload) {
        Ok(value) => SseLine::Data(value),
        Err(e) => {
            debug!(error = %e, "Skipping unparseable SSE data line");
            SseLine::Ignore
        }
    }
}

#[derive(Debug, Default, PartialEq)]
struct TokenDelta {
    content: Option<String>,
    tool_calls: Vec<(String, String)>,
}

/// Pull the content/tool-call delta out of one chat completion chunk.
fn extract_delta(value: &serde_json::Value) -> TokenDelta {
    let mut delta = TokenDelta::default();
    let Some(payload) = value["choices"].get(0).map(|choice| &choice["delta"]) else {
        return delta;
    };

    if let Some(text) = payload["content"].as_str() {
        if !text.is_empty() {
            delta.content = Some(text.to_string());
        }
    }

    if let Some(calls) = payload["tool_calls"].as_array() {
        for call in calls {
            let name = call["function"]["name"].as_str().unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            let args = call["function"]["arguments"].as_str().unwrap_or("{}");
            delta.tool_calls.push((name.to_string(), args.to_string()));
        }
    }

    delta
}
