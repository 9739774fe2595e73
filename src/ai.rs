//! Hosted multimodal AI calls: landmark identification, narration details,
//! guide chat and speech synthesis, all through Gemini `generateContent`.

use crate::tour::{ChatMessage, Identification, LandmarkDetails, Sender, Source};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Request failed: {0}")]
    Network(String),
    #[error("Rate limited by the AI service")]
    RateLimited,
    #[error("API Error: {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Failed to parse response: {0}")]
    Parse(String),
    #[error("Response carried no audio data")]
    NoVoiceData,
}

impl ApiError {
    /// Transient failures worth another attempt on text calls.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::RateLimited | ApiError::Network(_))
    }
}

/// Identification, narration and chat.
#[async_trait]
pub trait LandmarkService: Send + Sync {
    async fn identify(
        &self,
        image: &[u8],
        mime_type: &str,
        language: &str,
    ) -> Result<Identification, ApiError>;

    async fn details(&self, landmark: &str, language: &str) -> Result<LandmarkDetails, ApiError>;

    async fn chat(
        &self,
        landmark: &str,
        history: &[ChatMessage],
        question: &str,
        language: &str,
    ) -> Result<String, ApiError>;
}

/// Remote voice synthesis. `Ok(None)` means the service answered without audio.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Option<Vec<u8>>, ApiError>;
}

/// Exponential backoff for identification and detail calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Run `op`, retrying retryable errors with doubling delays.
pub async fn with_backoff<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && retry < policy.max_retries => {
                let delay = policy.delay_for(retry);
                log::warn!("{} failed ({}), retrying in {:?}", what, e, delay);
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            result => return result,
        }
    }
}

// ============================================================================
// Gemini REST client
// ============================================================================

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub api_key: String,
    pub api_base: String,
    pub text_model: String,
    pub tts_model: String,
    pub voice: String,
    pub timeout: Duration,
}

pub struct GeminiClient {
    http: reqwest::Client,
    settings: GeminiSettings,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
struct InlineData {
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Deserialize)]
struct GroundingChunk {
    web: Option<WebSource>,
}

#[derive(Deserialize)]
struct WebSource {
    uri: Option<String>,
    title: Option<String>,
}

#[derive(Deserialize, Serialize)]
struct IdentificationPayload {
    name: String,
    confidence: f64,
    #[serde(default)]
    alternatives: Vec<String>,
}

impl GenerateResponse {
    fn text(&self) -> Option<String> {
        let text: String = self
            .candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();
        (!text.trim().is_empty()).then_some(text)
    }

    fn audio(&self) -> Option<&str> {
        self.candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .iter()
            .find_map(|p| p.inline_data.as_ref().map(|d| d.data.as_str()))
    }

    fn sources(&self) -> Vec<Source> {
        let mut sources: Vec<Source> = Vec::new();
        let chunks = self
            .candidates
            .first()
            .and_then(|c| c.grounding_metadata.as_ref())
            .map(|g| g.grounding_chunks.as_slice())
            .unwrap_or_default();

        for web in chunks.iter().filter_map(|c| c.web.as_ref()) {
            let Some(uri) = web.uri.clone() else { continue };
            if sources.iter().any(|s| s.uri == uri) {
                continue;
            }
            sources.push(Source {
                title: web.title.clone().unwrap_or_else(|| uri.clone()),
                uri,
            });
        }
        sources
    }
}

fn parse_identification(text: &str) -> Result<Identification, ApiError> {
    // Models sometimes wrap JSON in a fenced block despite the mime type.
    let trimmed = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let payload: IdentificationPayload =
        serde_json::from_str(trimmed).map_err(|e| ApiError::Parse(e.to_string()))?;

    Ok(Identification {
        name: payload.name.trim().to_string(),
        confidence: payload.confidence.clamp(0.0, 1.0),
        alternatives: payload
            .alternatives
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect(),
    })
}

impl GeminiClient {
    pub fn new(settings: GeminiSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.settings.api_base.trim_end_matches('/'),
            urlencoding::encode(model)
        )
    }

    async fn generate(&self, model: &str, body: serde_json::Value) -> Result<GenerateResponse, ApiError> {
        let res = self
            .http
            .post(self.endpoint(model))
            .header("x-goog-api-key", &self.settings.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .timeout(self.settings.timeout)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = res.status();
        if status.as_u16() == 429 {
            return Err(ApiError::RateLimited);
        }
        if !status.is_success() {
            let message = res.text().await.unwrap_or_default();
            return Err(ApiError::Http {
                status: status.as_u16(),
                message: message.chars().take(200).collect(),
            });
        }

        res.json::<GenerateResponse>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))
    }
}

#[async_trait]
impl LandmarkService for GeminiClient {
    async fn identify(
        &self,
        image: &[u8],
        mime_type: &str,
        language: &str,
    ) -> Result<Identification, ApiError> {
        let prompt = format!(
            "Identify the landmark in this photo. Answer in {language}. \
             Return JSON with the landmark name, your confidence between 0 and 1, \
             and up to three alternative names. Use an empty name if no landmark is visible."
        );
        let body = json!({
            "contents": [{
                "parts": [
                    { "inlineData": {
                        "mimeType": mime_type,
                        "data": base64::engine::general_purpose::STANDARD.encode(image),
                    }},
                    { "text": prompt },
                ]
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": {
                    "type": "OBJECT",
                    "properties": {
                        "name": { "type": "STRING" },
                        "confidence": { "type": "NUMBER" },
                        "alternatives": { "type": "ARRAY", "items": { "type": "STRING" } },
                    },
                    "required": ["name", "confidence"],
                },
            },
        });

        let response = self.generate(&self.settings.text_model, body).await?;
        let text = response
            .text()
            .ok_or_else(|| ApiError::Parse("No identification returned".to_string()))?;
        parse_identification(&text)
    }

    async fn details(&self, landmark: &str, language: &str) -> Result<LandmarkDetails, ApiError> {
        let prompt = format!(
            "You are a friendly tour guide. In {language}, tell a visitor about {landmark}: \
             its history, architecture and a few surprising facts. Plain prose, no markdown, \
             about 200 words."
        );
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "tools": [{ "google_search": {} }],
        });

        let response = self.generate(&self.settings.text_model, body).await?;
        let text = response
            .text()
            .ok_or_else(|| ApiError::Parse("No details returned".to_string()))?;
        Ok(LandmarkDetails {
            text: text.trim().to_string(),
            sources: response.sources(),
        })
    }

    async fn chat(
        &self,
        landmark: &str,
        history: &[ChatMessage],
        question: &str,
        language: &str,
    ) -> Result<String, ApiError> {
        let mut contents: Vec<serde_json::Value> = history
            .iter()
            .map(|m| {
                let role = match m.sender {
                    Sender::User => "user",
                    Sender::Guide => "model",
                };
                json!({ "role": role, "parts": [{ "text": m.text }] })
            })
            .collect();
        contents.push(json!({ "role": "user", "parts": [{ "text": question }] }));

        let body = json!({
            "systemInstruction": { "parts": [{ "text": format!(
                "You are an enthusiastic local guide at {landmark}. \
                 Answer briefly and conversationally in {language}."
            ) }] },
            "contents": contents,
        });

        let response = self.generate(&self.settings.text_model, body).await?;
        response
            .text()
            .map(|t| t.trim().to_string())
            .ok_or_else(|| ApiError::Parse("No reply returned".to_string()))
    }
}

#[async_trait]
impl SpeechSynthesizer for GeminiClient {
    async fn synthesize(&self, text: &str) -> Result<Option<Vec<u8>>, ApiError> {
        let body = json!({
            "contents": [{ "parts": [{ "text": text }] }],
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": self.settings.voice }
                    }
                },
            },
        });

        let response = self.generate(&self.settings.tts_model, body).await?;
        let Some(data) = response.audio() else {
            return Ok(None);
        };
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map(Some)
            .map_err(|e| ApiError::Parse(format!("Invalid audio encoding: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn parses_identification_json() {
        let id = parse_identification(
            r#"{"name":" Eiffel Tower ","confidence":1.3,"alternatives":["Tour Eiffel",""]}"#,
        )
        .unwrap();
        assert_eq!(id.name, "Eiffel Tower");
        assert_eq!(id.confidence, 1.0);
        assert_eq!(id.alternatives, vec!["Tour Eiffel"]);
    }

    #[test]
    fn parses_fenced_identification() {
        let id = parse_identification("```json\n{\"name\":\"Big Ben\",\"confidence\":0.8}\n```").unwrap();
        assert_eq!(id.name, "Big Ben");
        assert!(id.alternatives.is_empty());
    }

    #[test]
    fn garbage_identification_is_parse_error() {
        assert!(matches!(parse_identification("not json"), Err(ApiError::Parse(_))));
    }

    #[test]
    fn extracts_text_audio_and_deduplicated_sources() {
        let response: GenerateResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "Hello " },
                    { "text": "there." },
                    { "inlineData": { "mimeType": "audio/L16;rate=24000", "data": "AAA=" } },
                ]},
                "groundingMetadata": { "groundingChunks": [
                    { "web": { "uri": "https://a.example", "title": "A" } },
                    { "web": { "uri": "https://a.example", "title": "A again" } },
                    { "web": { "uri": "https://b.example" } },
                ]},
            }]
        }))
        .unwrap();

        assert_eq!(response.text().as_deref(), Some("Hello there."));
        assert_eq!(response.audio(), Some("AAA="));
        let sources = response.sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[1].title, "https://b.example");
    }

    #[test]
    fn empty_response_has_no_text_or_audio() {
        let response: GenerateResponse = serde_json::from_value(json!({})).unwrap();
        assert!(response.text().is_none());
        assert!(response.audio().is_none());
        assert!(response.sources().is_empty());
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limits_then_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let counter = Arc::clone(&attempts);
        let result = with_backoff(RetryPolicy::default(), "identify", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ApiError::RateLimited)
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result: Result<(), _> = with_backoff(RetryPolicy::default(), "details", || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::Network("connection reset".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(ApiError::Network(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn does_not_retry_http_errors() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result: Result<(), _> = with_backoff(RetryPolicy::default(), "identify", || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::Http {
                    status: 400,
                    message: "bad request".to_string(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
