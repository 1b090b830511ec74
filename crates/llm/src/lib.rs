use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

// ── Cognitive roles & the opaque reasoning session ────────────────────────────

/// A cognitive role the orchestrator drives a reasoning session as.
///
/// Exactly one role holds a session at a time within a single cycle; the
/// orchestrator never runs two roles concurrently against the same agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Decides what to dispatch next.
    Ego,
    /// Carries out a dispatched task.
    Subconscious,
    /// Audits proposals and outcomes.
    Superego,
    /// Generates goal candidates when idle.
    Id,
    /// Tick mode's single end-to-end session (spec §4.1): no specialized
    /// handoff between roles, one session performs the whole iteration.
    Agent,
}

/// A single request to the opaque reasoning session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub role: Role,
    pub prompt: String,
}

impl SessionRequest {
    pub fn new(role: Role, prompt: impl Into<String>) -> Self {
        Self { role, prompt: prompt.into() }
    }
}

/// The session's final result: raw text plus which provider actually answered.
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub provider: Provider,
    pub content: String,
}

/// A handle to a live reasoning session.
///
/// `input_tx` lets the orchestrator inject additional user/peer messages
/// mid-flight, appended to the prompt with the documented separator as long
/// as the session has not yet started consuming its result. `log_rx` carries
/// streamed output as it arrives; `result` resolves once the session
/// completes. The orchestrator owns `input_tx` for the session's lifetime and
/// drops it (closing the channel) once `result` resolves.
pub struct SessionHandle {
    pub input_tx: mpsc::Sender<String>,
    pub log_rx: mpsc::Receiver<String>,
    result: oneshot::Receiver<Result<SessionResult>>,
}

impl SessionHandle {
    pub async fn join(self) -> Result<SessionResult> {
        match self.result.await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("reasoning session task was dropped before completing")),
        }
    }
}

/// Launches an opaque reasoning session for a given role and prompt.
///
/// The orchestrator consumes reasoning purely through this interface — it
/// never inspects how a role arrives at its answer, only the resulting text
/// (and, for roles that emit one, a fenced JSON payload extracted via
/// [`extract_json_output`]).
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self, request: SessionRequest) -> Result<SessionHandle>;
}

/// The production launcher: drives [`LlmRouter`] under the calling role.
pub struct LlmSessionLauncher {
    router: Arc<LlmRouter>,
    primary: Provider,
    ollama_model: String,
    openrouter_model: String,
}

impl LlmSessionLauncher {
    pub fn new(
        router: Arc<LlmRouter>,
        primary: Provider,
        ollama_model: impl Into<String>,
        openrouter_model: impl Into<String>,
    ) -> Self {
        Self {
            router,
            primary,
            ollama_model: ollama_model.into(),
            openrouter_model: openrouter_model.into(),
        }
    }
}

#[async_trait]
impl SessionLauncher for LlmSessionLauncher {
    async fn launch(&self, request: SessionRequest) -> Result<SessionHandle> {
        let (input_tx, input_rx) = mpsc::channel::<String>(16);
        let (log_tx, log_rx) = mpsc::channel::<String>(64);
        let (result_tx, result_rx) = oneshot::channel();

        let router = self.router.clone();
        let primary = self.primary;
        let ollama_model = self.ollama_model.clone();
        let openrouter_model = self.openrouter_model.clone();
        let input_rx = Arc::new(Mutex::new(input_rx));

        tokio::spawn(async move {
            let mut prompt = request.prompt;
            // Drain any messages injected before the session started consuming
            // its result — they're folded into the prompt up front.
            {
                let mut rx = input_rx.lock().await;
                while let Ok(extra) = rx.try_recv() {
                    prompt.push_str("\n\n---\n\n");
                    prompt.push_str(&extra);
                }
            }

            let outcome = router
                .chat_stream_with_fallback(primary, &ollama_model, &openrouter_model, &prompt, log_tx)
                .await
                .map(|(provider, content)| SessionResult { provider, content });

            let _ = result_tx.send(outcome);
        });

        Ok(SessionHandle { input_tx, log_rx, result: result_rx })
    }
}

/// An in-memory test double that returns a scripted response per role,
/// consuming each scripted entry exactly once (FIFO per role). Used by
/// orchestrator tests in place of a real launcher.
#[derive(Default)]
pub struct InMemorySessionLauncher {
    scripts: Mutex<std::collections::HashMap<Role, std::collections::VecDeque<String>>>,
}

impl InMemorySessionLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, role: Role, response: impl Into<String>) {
        let mut scripts = self.scripts.lock().await;
        scripts.entry(role).or_default().push_back(response.into());
    }
}

#[async_trait]
impl SessionLauncher for InMemorySessionLauncher {
    async fn launch(&self, request: SessionRequest) -> Result<SessionHandle> {
        let content = {
            let mut scripts = self.scripts.lock().await;
            scripts
                .get_mut(&request.role)
                .and_then(|queue| queue.pop_front())
                .unwrap_or_default()
        };

        let (input_tx, _input_rx) = mpsc::channel::<String>(16);
        let (_log_tx, log_rx) = mpsc::channel::<String>(1);
        let (result_tx, result_rx) = oneshot::channel();
        let _ = result_tx.send(Ok(SessionResult { provider: Provider::Ollama, content }));

        Ok(SessionHandle { input_tx, log_rx, result: result_rx })
    }
}

// ── LLM provider clients ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenRouterClient {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for OpenRouterClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Provider {
    Ollama,
    OpenRouter,
}

#[derive(Debug, Clone, Default)]
pub struct LlmRouter {
    ollama: OllamaClient,
    openrouter: OpenRouterClient,
}

impl LlmRouter {
    /// Non-streaming chat. Falls back to the secondary provider when `primary`
    /// is Ollama and the prompt carries the `/fallback` test hook, or always
    /// when `primary` is OpenRouter (there is no tertiary to fall back to).
    pub async fn chat_with_fallback(
        &self,
        primary: Provider,
        ollama_model: &str,
        openrouter_model: &str,
        prompt: &str,
    ) -> Result<(Provider, String)> {
        let should_force_fallback = prompt.to_lowercase().contains("/fallback");

        match primary {
            Provider::Ollama if !should_force_fallback => {
                Ok((Provider::Ollama, self.ollama.chat_model(ollama_model, prompt).await?))
            }
            Provider::Ollama => {
                Ok((Provider::OpenRouter, self.openrouter.chat_model(openrouter_model, prompt).await?))
            }
            Provider::OpenRouter => {
                Ok((Provider::OpenRouter, self.openrouter.chat_model(openrouter_model, prompt).await?))
            }
        }
    }

    pub async fn chat_stream_with_fallback(
        &self,
        primary: Provider,
        ollama_model: &str,
        openrouter_model: &str,
        prompt: &str,
        tx: mpsc::Sender<String>,
    ) -> Result<(Provider, String)> {
        let should_force_fallback = prompt.to_lowercase().contains("/fallback");

        match primary {
            Provider::Ollama if !should_force_fallback => Ok((
                Provider::Ollama,
                self.ollama.chat_model_stream(ollama_model, prompt, tx).await?,
            )),
            Provider::Ollama => Ok((
                Provider::OpenRouter,
                self.openrouter.chat_model_stream(openrouter_model, prompt, tx).await?,
            )),
            Provider::OpenRouter => Ok((
                Provider::OpenRouter,
                self.openrouter.chat_model_stream(openrouter_model, prompt, tx).await?,
            )),
        }
    }
}

impl OllamaClient {
    async fn chat_model(&self, model: &str, prompt: &str) -> Result<String> {
        let base_url = std::env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| "http://localhost:11434".to_string());
        let endpoint = format!("{}/api/generate", base_url.trim_end_matches('/'));

        let payload = json!({
            "model": model,
            "prompt": prompt,
            "stream": false
        });

        let client = self.client.clone();
        let response = client.post(endpoint).json(&payload).send().await;

        match response {
            Ok(response) => {
                let status = response.status();
                let body: serde_json::Value = response.json().await?;
                if !status.is_success() {
                    return Ok(format!("Ollama error ({status}): {body}"));
                }

                if let Some(content) = body.get("response").and_then(|value| value.as_str()) {
                    return Ok(content.to_string());
                }

                Ok(format!("Ollama response missing text: {body}"))
            }
            Err(error) => Ok(format!(
                "Ollama unavailable at {base_url}. Start Ollama and ensure model '{model}' is installed. Error: {error}"
            )),
        }
    }

    async fn chat_model_stream(&self, model: &str, prompt: &str, tx: mpsc::Sender<String>) -> Result<String> {
        let base_url = std::env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| "http://localhost:11434".to_string());
        let endpoint = format!("{}/api/generate", base_url.trim_end_matches('/'));

        let payload = json!({
            "model": model,
            "prompt": prompt,
            "stream": true
        });

        let client = self.client.clone();
        let mut response = client.post(endpoint).json(&payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body: serde_json::Value = response.json().await?;
            return Ok(format!("Ollama error ({status}): {body}"));
        }

        let mut full_response = String::new();
        while let Some(chunk) = response.chunk().await? {
            let chunk_str = String::from_utf8_lossy(&chunk);
            for line in chunk_str.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                if let Ok(json) = serde_json::from_str::<serde_json::Value>(line) {
                    if let Some(content) = json.get("response").and_then(|v| v.as_str()) {
                        if content.is_empty() {
                            continue;
                        }
                        full_response.push_str(content);
                        let _ = tx.send(content.to_string()).await;
                    }
                }
            }
        }

        Ok(full_response)
    }
}

impl OpenRouterClient {
    async fn chat_model(&self, model: &str, prompt: &str) -> Result<String> {
        let api_key = std::env::var("OPENROUTER_API_KEY").ok();
        if let Some(api_key) = api_key {
            if !api_key.trim().is_empty() {
                let client = self.client.clone();
                let payload = json!({
                    "model": model,
                    "messages": [
                        {"role": "user", "content": prompt}
                    ]
                });

                let response = client
                    .post("https://openrouter.ai/api/v1/chat/completions")
                    .bearer_auth(api_key)
                    .header("HTTP-Referer", "https://agora.local")
                    .header("X-Title", "Agora")
                    .json(&payload)
                    .send()
                    .await?;

                let status = response.status();
                let body: serde_json::Value = response.json().await?;
                if !status.is_success() {
                    return Ok(format!("OpenRouter error ({status}): {body}"));
                }

                if let Some(content) = body
                    .get("choices")
                    .and_then(|choices| choices.get(0))
                    .and_then(|choice| choice.get("message"))
                    .and_then(|message| message.get("content"))
                    .and_then(|content| content.as_str())
                {
                    return Ok(content.to_string());
                }
            }
        }

        Ok("OpenRouter key missing or response empty. Set OPENROUTER_API_KEY or switch to primary provider ollama."
            .to_string())
    }

    async fn chat_model_stream(&self, model: &str, prompt: &str, tx: mpsc::Sender<String>) -> Result<String> {
        let api_key = std::env::var("OPENROUTER_API_KEY").ok();
        if let Some(api_key) = api_key {
            if !api_key.trim().is_empty() {
                let client = self.client.clone();
                let payload = json!({
                    "model": model,
                    "messages": [
                        {"role": "user", "content": prompt}
                    ],
                    "stream": true
                });

                let mut response = client
                    .post("https://openrouter.ai/api/v1/chat/completions")
                    .bearer_auth(api_key)
                    .header("HTTP-Referer", "https://agora.local")
                    .header("X-Title", "Agora")
                    .json(&payload)
                    .send()
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    let body: serde_json::Value = response.json().await?;
                    return Ok(format!("OpenRouter error ({status}): {body}"));
                }

                let mut full_response = String::new();
                while let Some(chunk) = response.chunk().await? {
                    let chunk_str = String::from_utf8_lossy(&chunk);
                    for line in chunk_str.lines() {
                        let line = line.trim();
                        if line.is_empty() || line == "data: [DONE]" {
                            continue;
                        }
                        if let Some(data) = line.strip_prefix("data: ") {
                            if let Ok(json) = serde_json::from_str::<serde_json::Value>(data) {
                                if let Some(content) = json
                                    .get("choices")
                                    .and_then(|choices| choices.get(0))
                                    .and_then(|choice| choice.get("delta"))
                                    .and_then(|delta| delta.get("content"))
                                    .and_then(|content| content.as_str())
                                {
                                    if content.is_empty() {
                                        continue;
                                    }
                                    full_response.push_str(content);
                                    let _ = tx.send(content.to_string()).await;
                                }
                            }
                        }
                    }
                }

                return Ok(full_response);
            }
        }

        Ok("OpenRouter key missing or response empty. Set OPENROUTER_API_KEY or switch to primary provider ollama."
            .to_string())
    }
}

// ── Structured output extraction ──────────────────────────────────────────────

/// Structured fields a role may embed in a fenced `json` code block inside
/// its reply, alongside its free-text content.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StructuredOutput {
    /// Logical action name (e.g. `"dispatch"`, `"propose_goal"`).
    #[serde(default)]
    pub action: Option<String>,
    /// Free-form parameters associated with the action.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Human-readable rationale for the action.
    #[serde(default)]
    pub rationale: Option<String>,
    /// The portion of the reply meant to be logged/surfaced as-is.
    #[serde(default)]
    pub reply: Option<String>,
}

/// Extract the first valid JSON payload from a role's response.
///
/// Tries a fenced ` ```json ... ``` ` block first, falling back to the first
/// `{...}` span in the text. Returns `None` when neither strategy yields
/// valid JSON for `T`.
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    // Strategy 1: fenced ```json ... ``` blocks.
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(json_start) = after_fence.find(|c: char| !c.is_whitespace()) {
            let json_body = &after_fence[json_start..];
            if let Some(fence_end) = json_body.find("```") {
                let json_str = json_body[..fence_end].trim();
                if let Ok(val) = serde_json::from_str(json_str) {
                    return Some(val);
                }
            }
        }
    }

    // Strategy 2: bare JSON object — find the first '{' and its matching '}'.
    let trimmed = response.trim();
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                let candidate = &trimmed[start..=end];
                if let Ok(val) = serde_json::from_str(candidate) {
                    return Some(val);
                }
            }
        }
    }

    None
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_output_default_all_none() {
        let out = StructuredOutput::default();
        assert!(out.action.is_none());
        assert!(out.rationale.is_none());
        assert!(out.reply.is_none());
        assert_eq!(out.params, serde_json::Value::Null);
    }

    #[test]
    fn extract_fenced_json() {
        let raw = "Sure!\n```json\n{\"action\":\"dispatch\",\"reply\":\"Got it\"}\n```";
        let out = extract_json_output::<StructuredOutput>(raw).unwrap();
        assert_eq!(out.action.as_deref(), Some("dispatch"));
        assert_eq!(out.reply.as_deref(), Some("Got it"));
    }

    #[test]
    fn extract_fenced_json_with_extra_text() {
        let raw = "Here is the result:\n\n```json\n{\"action\":\"propose_goal\",\"params\":{\"title\":\"x\"},\"reply\":\"done\"}\n```\n\nHope that helps!";
        let out = extract_json_output::<StructuredOutput>(raw).unwrap();
        assert_eq!(out.action.as_deref(), Some("propose_goal"));
        assert_eq!(out.reply.as_deref(), Some("done"));
        assert_eq!(out.params["title"], "x");
    }

    #[test]
    fn extract_fenced_json_with_leading_newlines() {
        let raw = "```json\n\n  {\"action\":\"test\"}\n```";
        let out = extract_json_output::<StructuredOutput>(raw).unwrap();
        assert_eq!(out.action.as_deref(), Some("test"));
    }

    #[test]
    fn extract_bare_json() {
        let raw = r#"{"action":"hello","reply":"world"}"#;
        let out = extract_json_output::<StructuredOutput>(raw).unwrap();
        assert_eq!(out.action.as_deref(), Some("hello"));
        assert_eq!(out.reply.as_deref(), Some("world"));
    }

    #[test]
    fn extract_bare_json_with_surrounding_text() {
        let raw = "some preamble {\"action\":\"x\"} some epilogue";
        let out = extract_json_output::<StructuredOutput>(raw).unwrap();
        assert_eq!(out.action.as_deref(), Some("x"));
    }

    #[test]
    fn extract_bare_json_nested_braces() {
        let raw = r#"{"action":"call","params":{"cmd":"echo {}"},"reply":"ok"}"#;
        let out = extract_json_output::<StructuredOutput>(raw).unwrap();
        assert_eq!(out.action.as_deref(), Some("call"));
        assert_eq!(out.reply.as_deref(), Some("ok"));
    }

    #[test]
    fn extract_returns_none_for_plain_text() {
        let raw = "Hello, this is a plain text response with no JSON.";
        assert!(extract_json_output::<StructuredOutput>(raw).is_none());
    }

    #[test]
    fn extract_returns_none_for_empty_string() {
        assert!(extract_json_output::<StructuredOutput>("").is_none());
    }

    #[test]
    fn extract_returns_none_for_malformed_json_in_fence() {
        let raw = "```json\n{not valid json}\n```";
        assert!(extract_json_output::<StructuredOutput>(raw).is_none());
    }

    #[test]
    fn extract_returns_none_for_lone_braces() {
        let raw = "Something { that } is not really JSON";
        assert!(extract_json_output::<StructuredOutput>(raw).is_none());
    }

    #[test]
    fn extract_all_structured_fields() {
        let raw = r#"```json
{
  "action": "propose_goal",
  "params": {"title": "write docs"},
  "rationale": "Documentation is stale",
  "reply": "Noted, queued a goal."
}
```"#;
        let out = extract_json_output::<StructuredOutput>(raw).unwrap();
        assert_eq!(out.action.as_deref(), Some("propose_goal"));
        assert_eq!(out.rationale.as_deref(), Some("Documentation is stale"));
        assert_eq!(out.reply.as_deref(), Some("Noted, queued a goal."));
        assert_eq!(out.params["title"], "write docs");
    }

    #[test]
    fn provider_serde_roundtrip() {
        for provider in [Provider::Ollama, Provider::OpenRouter] {
            let json = serde_json::to_string(&provider).unwrap();
            let back: Provider = serde_json::from_str(&json).unwrap();
            assert_eq!(back, provider);
        }
    }

    #[test]
    fn extract_fenced_takes_precedence_over_bare() {
        let raw = r#"Bare: {"action":"wrong","reply":"no"}
```json
{"action":"right","reply":"yes"}
```
"#;
        let out = extract_json_output::<StructuredOutput>(raw).unwrap();
        assert_eq!(out.action.as_deref(), Some("right"));
        assert_eq!(out.reply.as_deref(), Some("yes"));
    }

    #[test]
    fn extract_two_bare_objects_returns_none() {
        let raw = r#"Here: {"action":"a"} and also {"action":"b"}"#;
        assert!(extract_json_output::<StructuredOutput>(raw).is_none());
    }

    #[tokio::test]
    async fn in_memory_launcher_returns_scripted_response_per_role() {
        let launcher = InMemorySessionLauncher::new();
        launcher.push(Role::Ego, "dispatch T1").await;
        launcher.push(Role::Ego, "dispatch T2").await;

        let handle = launcher.launch(SessionRequest::new(Role::Ego, "what next?")).await.unwrap();
        let result = handle.join().await.unwrap();
        assert_eq!(result.content, "dispatch T1");

        let handle = launcher.launch(SessionRequest::new(Role::Ego, "what next?")).await.unwrap();
        let result = handle.join().await.unwrap();
        assert_eq!(result.content, "dispatch T2");
    }

    #[tokio::test]
    async fn in_memory_launcher_defaults_to_empty_when_unscripted() {
        let launcher = InMemorySessionLauncher::new();
        let handle = launcher.launch(SessionRequest::new(Role::Id, "any ideas?")).await.unwrap();
        let result = handle.join().await.unwrap();
        assert_eq!(result.content, "");
    }
}
