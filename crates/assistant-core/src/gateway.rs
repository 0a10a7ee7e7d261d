//! Wire request construction, backend dispatch and the retry/backoff policy.
//!
//! Two interchangeable backends: a direct Gemini `generateContent` call with
//! the caller-held key, or a trusted proxy that holds the credential
//! server-side. Selected once per session from config, never mixed per call.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Config, RetryConfig};
use crate::conversation::WireTurn;
use crate::error::Error;

/// Per-attempt bounded wait. The provider's own timeout behavior is outside
/// our control, so every attempt is capped client-side.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Returned instead of an answer when the provider blocks the response for
/// safety reasons. Deliberately a canned human-readable string rather than a
/// raw provider refusal code.
pub const SAFETY_REFUSAL: &str =
    "Sorry, I can't answer this due to safety policies.";

// --- Gemini API request structs ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
    safety_settings: Vec<SafetySetting>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    InlineData { inline_data: InlineData<'a> },
    Text { text: &'a str },
}

#[derive(Serialize)]
struct InlineData<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_k: u32,
    top_p: f32,
    max_output_tokens: u32,
}

impl GenerationConfig {
    /// Fixed generation parameters, tuned for consistent answers. Not
    /// exposed for per-call override.
    fn fixed() -> Self {
        Self {
            temperature: 0.15,
            top_k: 5,
            top_p: 0.85,
            max_output_tokens: 4096,
        }
    }
}

#[derive(Serialize)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

// The assistant looks at arbitrary screen content, so every category is set
// to the least restrictive threshold.
fn safety_settings() -> Vec<SafetySetting> {
    const CATEGORIES: [&str; 4] = [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ];
    CATEGORIES
        .iter()
        .map(|category| SafetySetting {
            category,
            threshold: "BLOCK_NONE",
        })
        .collect()
}

// --- Gemini API response structs ---

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    error: Option<ProviderErrorDetail>,
}

#[derive(Deserialize)]
struct ProviderErrorDetail {
    message: Option<String>,
}

// --- Proxy wire structs ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProxyAnalyzeRequest<'a> {
    image_base64: &'a str,
    subject: &'a str,
    custom_prompt: &'a str,
    conversation_history: &'a [WireTurn],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProxyChatRequest<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_base64: Option<&'a str>,
    subject: &'a str,
    custom_prompt: &'a str,
    last_analysis: &'a str,
    conversation_history: &'a [WireTurn],
}

#[derive(Deserialize)]
struct ProxyResponse {
    response: Option<String>,
}

#[derive(Deserialize)]
struct ProxyErrorBody {
    error: Option<String>,
}

// --- Request envelope ---

/// Inline image attachment, normalized from whatever form the frame source
/// produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub data: String,
}

impl ImagePayload {
    /// Accepts either raw base64 bytes or a `data:<mime>;base64,<data>` URI.
    /// Raw input is assumed to be JPEG, which is what the frame source emits.
    pub fn from_frame(frame: &str) -> Self {
        if let Some(rest) = frame.strip_prefix("data:") {
            if let Some((mime, data)) = rest.split_once(";base64,") {
                return Self {
                    mime_type: mime.to_string(),
                    data: data.to_string(),
                };
            }
        }
        Self {
            mime_type: "image/jpeg".to_string(),
            data: frame.to_string(),
        }
    }
}

/// Which proxy route a call maps to. Direct mode ignores the distinction
/// beyond the prompt already rendered into the envelope.
#[derive(Debug, Clone)]
pub enum CallKind {
    Analyze,
    Chat { message: String },
}

/// Everything the gateway needs for one call. Built per call, never
/// persisted.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub prompt_text: String,
    pub image: Option<ImagePayload>,
    pub kind: CallKind,
    /// Subject mode wire name, forwarded to the proxy.
    pub subject: String,
    pub last_analysis: String,
    /// Bounded non-system history for the proxy body.
    pub history: Vec<WireTurn>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Suppress diagnostic logging of failures. Used for speculative
    /// background calls; never changes retry or error semantics.
    pub silent: bool,
}

// --- Backend / transport ---

/// Where requests go. `Direct` talks to the provider with the caller-held
/// key; `Proxy` talks to a trusted intermediary that injects the real
/// credential server-side.
#[derive(Debug, Clone)]
pub enum Backend {
    Direct {
        base_url: String,
        model: String,
        key: String,
    },
    Proxy {
        base_url: String,
    },
}

#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// The HTTP edge as a strategy object, so tests can run the full retry and
/// classification logic without a network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST a JSON body. `Err` means the request could not be sent or
    /// completed; an HTTP error status is an `Ok` reply.
    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<HttpReply, String>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<HttpReply, String> {
        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    "request timed out".to_string()
                } else if e.is_connect() {
                    format!("cannot connect to {url}")
                } else {
                    e.to_string()
                }
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| e.to_string())?;
        Ok(HttpReply { status, body })
    }
}

/// Retry/backoff parameters, taken from config. Tests zero the base delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    pub fn from_config(retry: &RetryConfig) -> Self {
        Self {
            max_attempts: retry.max_attempts.max(1),
            base_delay: Duration::from_millis(retry.delay_ms),
            multiplier: retry.backoff_multiplier,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * self.multiplier.saturating_pow(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

// --- Gateway ---

pub struct ModelGateway {
    backend: Backend,
    retry: RetryPolicy,
    transport: Box<dyn Transport>,
}

impl ModelGateway {
    pub fn new(backend: Backend, retry: RetryPolicy, transport: Box<dyn Transport>) -> Self {
        Self {
            backend,
            retry,
            transport,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.backend(),
            RetryPolicy::from_config(&config.retry),
            Box::new(HttpTransport::new()),
        )
    }

    /// Perform one model call. `Ok(None)` means the provider produced no
    /// answer text, which callers treat as "nothing to show", not an error.
    /// Rate limits and transport failures are retried with exponential
    /// backoff before surfacing as [`Error::RateLimited`] /
    /// [`Error::Transport`].
    pub async fn call(
        &self,
        envelope: &RequestEnvelope,
        options: CallOptions,
    ) -> Result<Option<String>, Error> {
        if let Backend::Direct { key, .. } = &self.backend {
            if key.is_empty() {
                return Err(Error::InvalidCredential);
            }
        }

        let (url, body) = self.build_request(envelope);

        let mut attempt: u32 = 0;
        loop {
            let is_last = attempt + 1 >= self.retry.max_attempts;

            match self.transport.post_json(&url, &body).await {
                Err(failure) => {
                    if !options.silent {
                        tracing::warn!(attempt, "transport failure: {failure}");
                    }
                    if is_last {
                        return Err(Error::Transport(failure));
                    }
                }
                Ok(reply) if (200..300).contains(&reply.status) => {
                    return self.extract_answer(&reply.body);
                }
                Ok(reply) => {
                    let error = self.classify_status(&reply);
                    if !options.silent {
                        tracing::warn!(
                            attempt,
                            status = reply.status,
                            "provider error: {error}"
                        );
                    }
                    // Only rate limits are worth another attempt.
                    if error != Error::RateLimited || is_last {
                        return Err(error);
                    }
                }
            }

            tokio::time::sleep(self.retry.delay_for(attempt)).await;
            attempt += 1;
        }
    }

    fn build_request(&self, envelope: &RequestEnvelope) -> (String, serde_json::Value) {
        match &self.backend {
            Backend::Direct {
                base_url,
                model,
                key,
            } => {
                let url = format!("{base_url}/{model}:generateContent?key={key}");

                // Image part always precedes the text part.
                let mut parts = Vec::with_capacity(2);
                if let Some(image) = &envelope.image {
                    parts.push(Part::InlineData {
                        inline_data: InlineData {
                            mime_type: &image.mime_type,
                            data: &image.data,
                        },
                    });
                }
                parts.push(Part::Text {
                    text: &envelope.prompt_text,
                });

                let request = GenerateRequest {
                    contents: vec![Content { parts }],
                    generation_config: GenerationConfig::fixed(),
                    safety_settings: safety_settings(),
                };
                let body = serde_json::to_value(&request)
                    .unwrap_or_else(|_| serde_json::Value::Null);
                (url, body)
            }
            Backend::Proxy { base_url } => {
                let image = envelope.image.as_ref().map(|i| i.data.as_str());
                match &envelope.kind {
                    CallKind::Analyze => {
                        let request = ProxyAnalyzeRequest {
                            image_base64: image.unwrap_or_default(),
                            subject: &envelope.subject,
                            custom_prompt: &envelope.prompt_text,
                            conversation_history: &envelope.history,
                        };
                        let body = serde_json::to_value(&request)
                            .unwrap_or_else(|_| serde_json::Value::Null);
                        (format!("{base_url}/api/analyze"), body)
                    }
                    CallKind::Chat { message } => {
                        let request = ProxyChatRequest {
                            message,
                            image_base64: image,
                            subject: &envelope.subject,
                            custom_prompt: &envelope.prompt_text,
                            last_analysis: &envelope.last_analysis,
                            conversation_history: &envelope.history,
                        };
                        let body = serde_json::to_value(&request)
                            .unwrap_or_else(|_| serde_json::Value::Null);
                        (format!("{base_url}/api/chat"), body)
                    }
                }
            }
        }
    }

    fn extract_answer(&self, body: &str) -> Result<Option<String>, Error> {
        match &self.backend {
            Backend::Direct { .. } => {
                let response: GenerateResponse = serde_json::from_str(body)
                    .map_err(|_| Error::Provider("Unexpected API response.".into()))?;

                let Some(candidate) = response.candidates.into_iter().next() else {
                    return Ok(None);
                };

                let text = candidate
                    .content
                    .and_then(|c| c.parts.into_iter().next())
                    .and_then(|p| p.text)
                    .filter(|t| !t.is_empty());

                if let Some(text) = text {
                    return Ok(Some(text));
                }
                if candidate.finish_reason.as_deref() == Some("SAFETY") {
                    return Ok(Some(SAFETY_REFUSAL.to_string()));
                }
                Ok(None)
            }
            Backend::Proxy { .. } => {
                let response: ProxyResponse = serde_json::from_str(body)
                    .map_err(|_| Error::Provider("Unexpected proxy response.".into()))?;
                Ok(response.response)
            }
        }
    }

    fn classify_status(&self, reply: &HttpReply) -> Error {
        match reply.status {
            400 => Error::InvalidCredential,
            429 => Error::RateLimited,
            404 => Error::ModelUnavailable,
            status => Error::Provider(self.provider_message(status, &reply.body)),
        }
    }

    fn provider_message(&self, status: u16, body: &str) -> String {
        match &self.backend {
            Backend::Direct { .. } => serde_json::from_str::<ProviderErrorBody>(body)
                .ok()
                .and_then(|b| b.error)
                .and_then(|e| e.message)
                .unwrap_or_else(|| format!("API error: {status}")),
            Backend::Proxy { .. } => serde_json::from_str::<ProxyErrorBody>(body)
                .ok()
                .and_then(|b| b.error)
                .unwrap_or_else(|| format!("Worker error: {status}")),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{self, direct_ok, status, FakeTransport};
    use super::*;

    fn direct_backend() -> Backend {
        Backend::Direct {
            base_url: "https://api.example.com/models".into(),
            model: "gemini-2.0-flash-exp".into(),
            key: "K".into(),
        }
    }

    fn no_delay() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            multiplier: 2,
        }
    }

    fn envelope(prompt: &str, frame: Option<&str>) -> RequestEnvelope {
        RequestEnvelope {
            prompt_text: prompt.to_string(),
            image: frame.map(ImagePayload::from_frame),
            kind: CallKind::Analyze,
            subject: "auto".into(),
            last_analysis: String::new(),
            history: Vec::new(),
        }
    }

    fn gateway(backend: Backend) -> (ModelGateway, std::sync::Arc<testing::FakeState>) {
        let (transport, state) = FakeTransport::new();
        (
            ModelGateway::new(backend, no_delay(), Box::new(transport)),
            state,
        )
    }

    #[test]
    fn image_payload_normalizes_data_uris() {
        assert_eq!(
            ImagePayload::from_frame("data:image/png;base64,QUJD"),
            ImagePayload {
                mime_type: "image/png".into(),
                data: "QUJD".into()
            }
        );
        assert_eq!(
            ImagePayload::from_frame("abc123"),
            ImagePayload {
                mime_type: "image/jpeg".into(),
                data: "abc123".into()
            }
        );
    }

    #[tokio::test]
    async fn direct_request_shape() {
        let (gateway, state) = gateway(direct_backend());
        state.push_reply(Ok(direct_ok("hi")));

        let answer = gateway
            .call(&envelope("the prompt", Some("abc123")), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(answer.as_deref(), Some("hi"));

        let requests = state.requests.lock();
        let (url, body) = &requests[0];
        assert_eq!(
            url,
            "https://api.example.com/models/gemini-2.0-flash-exp:generateContent?key=K"
        );

        let parts = &body["contents"][0]["parts"];
        assert_eq!(parts[0]["inline_data"]["mime_type"], "image/jpeg");
        assert_eq!(parts[0]["inline_data"]["data"], "abc123");
        assert_eq!(parts[1]["text"], "the prompt");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 4096);
        assert_eq!(body["generationConfig"]["topK"], 5);
        assert_eq!(body["safetySettings"][0]["threshold"], "BLOCK_NONE");
    }

    #[tokio::test]
    async fn text_only_request_has_single_part() {
        let (gateway, state) = gateway(direct_backend());
        state.push_reply(Ok(direct_ok("ok")));

        gateway
            .call(&envelope("just text", None), CallOptions::default())
            .await
            .unwrap();

        let requests = state.requests.lock();
        let parts = requests[0].1["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0]["text"], "just text");
    }

    #[tokio::test]
    async fn rate_limit_exhausts_exactly_three_attempts() {
        let (gateway, state) = gateway(direct_backend());
        for _ in 0..5 {
            state.push_reply(Ok(status(429, "{}")));
        }

        let err = gateway
            .call(&envelope("p", None), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, Error::RateLimited);
        assert_eq!(state.request_count(), 3);
    }

    #[tokio::test]
    async fn rate_limit_recovers_on_retry() {
        let (gateway, state) = gateway(direct_backend());
        state.push_reply(Ok(status(429, "{}")));
        state.push_reply(Ok(direct_ok("recovered")));

        let answer = gateway
            .call(&envelope("p", None), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(answer.as_deref(), Some("recovered"));
        assert_eq!(state.request_count(), 2);
    }

    #[tokio::test]
    async fn network_failures_are_retried_then_fail() {
        let (gateway, state) = gateway(direct_backend());
        for _ in 0..3 {
            state.push_reply(Err("connection reset".into()));
        }

        let err = gateway
            .call(&envelope("p", None), CallOptions { silent: true })
            .await
            .unwrap_err();
        assert_eq!(err, Error::Transport("connection reset".into()));
        assert_eq!(state.request_count(), 3);
    }

    #[tokio::test]
    async fn bad_request_is_not_retried() {
        let (gateway, state) = gateway(direct_backend());
        state.push_reply(Ok(status(400, "{}")));

        let err = gateway
            .call(&envelope("p", None), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, Error::InvalidCredential);
        assert_eq!(state.request_count(), 1);
    }

    #[tokio::test]
    async fn missing_model_is_not_retried() {
        let (gateway, state) = gateway(direct_backend());
        state.push_reply(Ok(status(404, "{}")));

        let err = gateway
            .call(&envelope("p", None), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, Error::ModelUnavailable);
        assert_eq!(state.request_count(), 1);
    }

    #[tokio::test]
    async fn other_errors_carry_the_provider_message() {
        let (gateway, state) = gateway(direct_backend());
        state.push_reply(Ok(status(
            500,
            r#"{"error": {"message": "backend exploded"}}"#,
        )));
        state.push_reply(Ok(status(503, "not json")));

        let err = gateway
            .call(&envelope("p", None), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, Error::Provider("backend exploded".into()));

        let err = gateway
            .call(&envelope("p", None), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, Error::Provider("API error: 503".into()));
    }

    #[tokio::test]
    async fn empty_key_fails_fast() {
        let backend = Backend::Direct {
            base_url: "https://api.example.com".into(),
            model: "m".into(),
            key: String::new(),
        };
        let (gateway, state) = gateway(backend);

        let err = gateway
            .call(&envelope("p", None), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, Error::InvalidCredential);
        assert_eq!(state.request_count(), 0);
    }

    #[tokio::test]
    async fn safety_block_becomes_canned_refusal() {
        let (gateway, state) = gateway(direct_backend());
        state.push_reply(Ok(status(
            200,
            r#"{"candidates": [{"content": {"parts": []}, "finishReason": "SAFETY"}]}"#,
        )));

        let answer = gateway
            .call(&envelope("p", None), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(answer.as_deref(), Some(SAFETY_REFUSAL));
    }

    #[tokio::test]
    async fn missing_text_without_safety_block_is_none() {
        let (gateway, state) = gateway(direct_backend());
        state.push_reply(Ok(status(200, r#"{"candidates": []}"#)));

        let answer = gateway
            .call(&envelope("p", None), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(answer, None);
    }

    #[tokio::test]
    async fn proxy_analyze_request_shape() {
        let (gateway, state) = gateway(Backend::Proxy {
            base_url: "https://worker.example.com".into(),
        });
        state.push_reply(Ok(status(200, r#"{"response": "done"}"#)));

        let mut env = envelope("rendered prompt", Some("abc123"));
        env.history = vec![WireTurn {
            role: "user",
            content: "earlier".into(),
        }];

        let answer = gateway.call(&env, CallOptions::default()).await.unwrap();
        assert_eq!(answer.as_deref(), Some("done"));

        let requests = state.requests.lock();
        let (url, body) = &requests[0];
        assert_eq!(url, "https://worker.example.com/api/analyze");
        assert_eq!(body["imageBase64"], "abc123");
        assert_eq!(body["subject"], "auto");
        assert_eq!(body["customPrompt"], "rendered prompt");
        assert_eq!(body["conversationHistory"][0]["role"], "user");
    }

    #[tokio::test]
    async fn proxy_chat_request_shape() {
        let (gateway, state) = gateway(Backend::Proxy {
            base_url: "https://worker.example.com".into(),
        });
        state.push_reply(Ok(status(200, r#"{"response": null}"#)));

        let env = RequestEnvelope {
            prompt_text: "rendered chat prompt".into(),
            image: None,
            kind: CallKind::Chat {
                message: "what was that?".into(),
            },
            subject: "math".into(),
            last_analysis: "the analysis".into(),
            history: Vec::new(),
        };

        let answer = gateway.call(&env, CallOptions::default()).await.unwrap();
        assert_eq!(answer, None);

        let requests = state.requests.lock();
        let (url, body) = &requests[0];
        assert_eq!(url, "https://worker.example.com/api/chat");
        assert_eq!(body["message"], "what was that?");
        assert_eq!(body["subject"], "math");
        assert_eq!(body["lastAnalysis"], "the analysis");
        assert!(body.get("imageBase64").is_none());
    }

    #[tokio::test]
    async fn proxy_error_body_is_surfaced() {
        let (gateway, state) = gateway(Backend::Proxy {
            base_url: "https://worker.example.com".into(),
        });
        state.push_reply(Ok(status(500, r#"{"error": "worker misconfigured"}"#)));

        let err = gateway
            .call(&envelope("p", Some("f")), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, Error::Provider("worker misconfigured".into()));
    }

    #[test]
    fn backoff_delays_grow_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 2,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
    }
}
