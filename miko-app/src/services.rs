//! Request/response adapters for the external TTS, VLM, and memory services.
//!
//! These are not part of the streaming core: the gateway only marks text as
//! synthesis-ready, and clients call the synchronous TTS endpoint themselves.
//! Every adapter reports its own health for the aggregate `/health` surface.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Lifecycle shared by all managed service adapters.
#[async_trait]
pub trait ManagedService: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-time startup initialization.
    async fn initialize(&self) -> Result<()>;

    /// Liveness probe: `(healthy, detail message)`.
    async fn is_healthy(&self) -> (bool, String);
}

fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("miko/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| anyhow!("Failed to initialize HTTP client: {}", e))
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Probe `GET {base}/health` and fold the outcome into a `(bool, String)`.
async fn probe_health(http: &reqwest::Client, base_url: &str) -> (bool, String) {
    match http.get(join_url(base_url, "health")).send().await {
        Ok(response) if response.status().is_success() => (true, "ok".to_string()),
        Ok(response) => (false, format!("health endpoint returned {}", response.status())),
        Err(e) => (false, format!("unreachable: {}", e)),
    }
}

// ---------------------------------------------------------------------------
// TTS
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SynthesizeResponse {
    /// Base64-encoded audio payload.
    audio: String,
}

pub struct TtsClient {
    http: reqwest::Client,
    base_url: String,
    default_voice: Option<String>,
}

impl TtsClient {
    pub fn new(base_url: &str, default_voice: Option<String>) -> Result<Self> {
        Ok(Self {
            http: build_http_client()?,
            base_url: base_url.to_string(),
            default_voice,
        })
    }

    /// Synthesize speech for `text`, returning base64-encoded audio.
    pub async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<String> {
        let voice = voice.or(self.default_voice.as_deref());
        let response = self
            .http
            .post(join_url(&self.base_url, "synthesize"))
            .json(&SynthesizeRequest { text, voice })
            .send()
            .await
            .context("TTS request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("TTS service returned {}", response.status());
        }
        let body: SynthesizeResponse = response.json().await.context("invalid TTS response")?;
        Ok(body.audio)
    }
}

#[async_trait]
impl ManagedService for TtsClient {
    fn name(&self) -> &'static str {
        "tts"
    }

    async fn initialize(&self) -> Result<()> {
        info!(base_url = %self.base_url, "TTS adapter initialized");
        Ok(())
    }

    async fn is_healthy(&self) -> (bool, String) {
        probe_health(&self.http, &self.base_url).await
    }
}

// ---------------------------------------------------------------------------
// VLM
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    description: String,
}

pub struct VlmClient {
    http: reqwest::Client,
    base_url: String,
}

impl VlmClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            http: build_http_client()?,
            base_url: base_url.to_string(),
        })
    }

    /// Describe a base64-encoded image.
    pub async fn analyze(&self, image: &str, prompt: Option<&str>) -> Result<String> {
        let response = self
            .http
            .post(join_url(&self.base_url, "analyze"))
            .json(&AnalyzeRequest { image, prompt })
            .send()
            .await
            .context("VLM request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("VLM service returned {}", response.status());
        }
        let body: AnalyzeResponse = response.json().await.context("invalid VLM response")?;
        Ok(body.description)
    }
}

#[async_trait]
impl ManagedService for VlmClient {
    fn name(&self) -> &'static str {
        "vlm"
    }

    async fn initialize(&self) -> Result<()> {
        info!(base_url = %self.base_url, "VLM adapter initialized");
        Ok(())
    }

    async fn is_healthy(&self) -> (bool, String) {
        probe_health(&self.http, &self.base_url).await
    }
}

// ---------------------------------------------------------------------------
// Short-term memory (chat history)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct SessionMessagesResponse {
    messages: Vec<StoredMessage>,
}

pub struct StmClient {
    http: reqwest::Client,
    base_url: String,
}

impl StmClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            http: build_http_client()?,
            base_url: base_url.to_string(),
        })
    }

    pub async fn add_message(&self, session_id: &str, message: &StoredMessage) -> Result<()> {
        let response = self
            .http
            .post(join_url(&self.base_url, &format!("sessions/{}/messages", session_id)))
            .json(message)
            .send()
            .await
            .context("STM add_message request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("STM service returned {}", response.status());
        }
        Ok(())
    }

    pub async fn session_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        let response = self
            .http
            .get(join_url(&self.base_url, &format!("sessions/{}", session_id)))
            .send()
            .await
            .context("STM session request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("STM service returned {}", response.status());
        }
        let body: SessionMessagesResponse =
            response.json().await.context("invalid STM response")?;
        Ok(body.messages)
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(join_url(&self.base_url, &format!("sessions/{}", session_id)))
            .send()
            .await
            .context("STM delete request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("STM service returned {}", response.status());
        }
        Ok(())
    }
}

#[async_trait]
impl ManagedService for StmClient {
    fn name(&self) -> &'static str {
        "stm"
    }

    async fn initialize(&self) -> Result<()> {
        info!(base_url = %self.base_url, "STM adapter initialized");
        Ok(())
    }

    async fn is_healthy(&self) -> (bool, String) {
        probe_health(&self.http, &self.base_url).await
    }
}

// ---------------------------------------------------------------------------
// Long-term memory (semantic store)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct AddMemoryRequest<'a> {
    user_id: &'a str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct SearchMemoryRequest<'a> {
    user_id: &'a str,
    query: &'a str,
    limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryHit {
    pub id: String,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Deserialize)]
struct SearchMemoryResponse {
    memories: Vec<MemoryHit>,
}

pub struct LtmClient {
    http: reqwest::Client,
    base_url: String,
}

impl LtmClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            http: build_http_client()?,
            base_url: base_url.to_string(),
        })
    }

    pub async fn add_memory(&self, user_id: &str, text: &str) -> Result<()> {
        let response = self
            .http
            .post(join_url(&self.base_url, "memories"))
            .json(&AddMemoryRequest { user_id, text })
            .send()
            .await
            .context("LTM add request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("LTM service returned {}", response.status());
        }
        Ok(())
    }

    pub async fn search(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<MemoryHit>> {
        let response = self
            .http
            .post(join_url(&self.base_url, "search"))
            .json(&SearchMemoryRequest {
                user_id,
                query,
                limit,
            })
            .send()
            .await
            .context("LTM search request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("LTM service returned {}", response.status());
        }
        let body: SearchMemoryResponse = response.json().await.context("invalid LTM response")?;
        Ok(body.memories)
    }

    pub async fn delete_memory(&self, memory_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(join_url(&self.base_url, &format!("memories/{}", memory_id)))
            .send()
            .await
            .context("LTM delete request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("LTM service returned {}", response.status());
        }
        Ok(())
    }
}

#[async_trait]
impl ManagedService for LtmClient {
    fn name(&self) -> &'static str {
        "ltm"
    }

    async fn initialize(&self) -> Result<()> {
        info!(base_url = %self.base_url, "LTM adapter initialized");
        Ok(())
    }

    async fn is_healthy(&self) -> (bool, String) {
        probe_health(&self.http, &self.base_url).await
    }
}
