//! Vendor-facing adapters: an OpenRouter-style chat-completions analyzer,
//! a 2GIS-then-Nominatim geocoder and an HTTP spam classifier.

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use async_trait::async_trait;

use super::{
    AnalysisRequest, GeoHit, GeocoderPort, LlmAnalysis, LlmPort, SpamClassifierPort, SpamScore,
};
use crate::domain::{GeoPoint, Language, Sentiment, TicketType};
use crate::error::StageError;

const ANALYSIS_PROMPT: &str = r#"You are a support-ticket classification system.
Analyze the ticket below and respond with ONLY a valid JSON object.

TICKET TEXT:
{ticket_text}

CLIENT AGE: {age}
CLIENT SEGMENT: {segment}
{attachment_context}

Fields:
1. "detected_type" - exactly one of: "complaint", "data_change",
   "consultation", "claim", "outage", "fraud", "spam".
   Angry refund demands are claims or complaints, NOT spam.
2. "sentiment" - "positive", "neutral" or "negative", plus
   "sentiment_confidence" between 0.0 and 1.0.
3. "language" - primary language label: "RU", "KZ" or "EN".
   Also return "language_is_mixed" (bool).
4. "summary" - one or two sentences: what the client needs.
5. "anomaly_flags" - list of strings for anything unusual, else [].
6. "needs_data_change" - true if the client asks to change personal data
   (phone, email, password, documents)."#;

fn transport_error(err: reqwest::Error) -> StageError {
    if err.is_timeout() || err.is_connect() {
        StageError::Transient(format!("network: {err}"))
    } else if let Some(status) = err.status() {
        StageError::from_http_status(status.as_u16(), err.to_string())
    } else {
        StageError::Transient(err.to_string())
    }
}

/// Chat-completions analyzer speaking the OpenRouter protocol.
pub struct OpenRouterLlm {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

/// Raw model output before normalization. Parsing failure is transient:
/// the model may produce valid JSON on the next attempt.
#[derive(Deserialize)]
struct RawAnalysis {
    detected_type: String,
    sentiment: String,
    #[serde(default)]
    sentiment_confidence: f64,
    language: String,
    #[serde(default)]
    language_is_mixed: bool,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    anomaly_flags: Vec<String>,
    #[serde(default)]
    needs_data_change: bool,
}

impl OpenRouterLlm {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "google/gemini-2.0-flash-001".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn build_prompt(request: &AnalysisRequest) -> String {
        let attachment_context = if request.attachments.is_empty() {
            String::new()
        } else {
            format!("ATTACHMENTS: {}", request.attachments.join(", "))
        };
        ANALYSIS_PROMPT
            .replace(
                "{ticket_text}",
                if request.text.is_empty() {
                    "(empty ticket body)"
                } else {
                    &request.text
                },
            )
            .replace(
                "{age}",
                &request
                    .age
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            )
            .replace("{segment}", request.segment.as_str())
            .replace("{attachment_context}", &attachment_context)
    }
}

#[async_trait]
impl LlmPort for OpenRouterLlm {
    async fn analyze(&self, request: AnalysisRequest) -> Result<LlmAnalysis, StageError> {
        let prompt = Self::build_prompt(&request);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": "You are a precise ticket classification system. Return only valid JSON."},
                    {"role": "user", "content": prompt},
                ],
                "temperature": 0.1,
                "max_tokens": 1000,
                "response_format": {"type": "json_object"},
            }))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StageError::from_http_status(status.as_u16(), body));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| StageError::Transient(format!("chat envelope: {e}")))?;
        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| StageError::Transient("empty choices".to_string()))?;

        let raw: RawAnalysis = serde_json::from_str(content)
            .map_err(|e| StageError::Transient(format!("model payload: {e}")))?;

        debug!(
            detected_type = %raw.detected_type,
            sentiment = %raw.sentiment,
            "analysis response"
        );

        Ok(LlmAnalysis {
            detected_type: TicketType::from_label(&raw.detected_type),
            language: Language::from_label(&raw.language),
            language_is_mixed: raw.language_is_mixed,
            sentiment: Sentiment::from_label(&raw.sentiment),
            sentiment_confidence: raw.sentiment_confidence.clamp(0.0, 1.0),
            summary: raw.summary,
            anomaly_flags: raw.anomaly_flags,
            needs_data_change: raw.needs_data_change,
        })
    }
}

/// Geocoder cascading over vendors: 2GIS when a key is configured, then
/// Nominatim. The first vendor that answers with a point wins.
pub struct HttpGeocoder {
    client: Client,
    twogis_key: Option<String>,
    twogis_base: String,
    nominatim_base: String,
}

#[derive(Deserialize)]
struct TwoGisResponse {
    result: Option<TwoGisResult>,
}

#[derive(Deserialize)]
struct TwoGisResult {
    #[serde(default)]
    items: Vec<TwoGisItem>,
}

#[derive(Deserialize)]
struct TwoGisItem {
    point: Option<TwoGisPoint>,
}

#[derive(Deserialize)]
struct TwoGisPoint {
    lat: f64,
    lon: f64,
}

#[derive(Deserialize)]
struct NominatimHit {
    lat: String,
    lon: String,
}

impl HttpGeocoder {
    pub fn new(twogis_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            twogis_key,
            twogis_base: "https://catalog.api.2gis.com/3.0".to_string(),
            nominatim_base: "https://nominatim.openstreetmap.org".to_string(),
        }
    }

    pub fn with_twogis_base(mut self, base: impl Into<String>) -> Self {
        self.twogis_base = base.into();
        self
    }

    pub fn with_nominatim_base(mut self, base: impl Into<String>) -> Self {
        self.nominatim_base = base.into();
        self
    }

    async fn twogis(&self, query: &str, key: &str) -> Result<Option<GeoHit>, StageError> {
        let response = self
            .client
            .get(format!("{}/items/geocode", self.twogis_base))
            .query(&[("q", query), ("fields", "items.point"), ("key", key)])
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(StageError::from_http_status(status.as_u16(), "2gis"));
        }
        let body: TwoGisResponse = response
            .json()
            .await
            .map_err(|e| StageError::Transient(format!("2gis payload: {e}")))?;
        Ok(body
            .result
            .and_then(|r| r.items.into_iter().next())
            .and_then(|item| item.point)
            .map(|p| GeoHit {
                point: GeoPoint::new(p.lat, p.lon),
                provider: "2gis".to_string(),
            }))
    }

    async fn nominatim(&self, query: &str) -> Result<Option<GeoHit>, StageError> {
        let response = self
            .client
            .get(format!("{}/search", self.nominatim_base))
            .query(&[("q", query), ("format", "json"), ("limit", "1")])
            .header("User-Agent", "fireflow-geocoder/0.1")
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(StageError::from_http_status(status.as_u16(), "nominatim"));
        }
        let hits: Vec<NominatimHit> = response
            .json()
            .await
            .map_err(|e| StageError::Transient(format!("nominatim payload: {e}")))?;
        let Some(hit) = hits.into_iter().next() else {
            return Ok(None);
        };
        let (lat, lon) = hit
            .lat
            .parse::<f64>()
            .and_then(|lat| hit.lon.parse::<f64>().map(|lon| (lat, lon)))
            .map_err(|e| StageError::Transient(format!("nominatim coords: {e}")))?;
        Ok(Some(GeoHit {
            point: GeoPoint::new(lat, lon),
            provider: "nominatim".to_string(),
        }))
    }
}

#[async_trait]
impl GeocoderPort for HttpGeocoder {
    async fn geocode(&self, query: &str) -> Result<Option<GeoHit>, StageError> {
        if let Some(key) = &self.twogis_key {
            match self.twogis(query, key).await {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "2gis lookup failed, falling back"),
            }
        }
        self.nominatim(query).await
    }
}

/// Spam classifier behind a plain HTTP endpoint:
/// `POST {endpoint} {"text": ...}` -> `{"is_spam": bool, "probability": f64}`.
pub struct HttpSpamClassifier {
    client: Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    is_spam: bool,
    probability: f64,
}

impl HttpSpamClassifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SpamClassifierPort for HttpSpamClassifier {
    async fn classify(&self, text: &str) -> Result<SpamScore, StageError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(StageError::from_http_status(status.as_u16(), "classifier"));
        }
        let body: ClassifyResponse = response
            .json()
            .await
            .map_err(|e| StageError::Transient(format!("classifier payload: {e}")))?;
        Ok(SpamScore {
            is_spam: body.is_spam,
            probability: body.probability.clamp(0.0, 1.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Segment;

    #[test]
    fn test_prompt_includes_ticket_fields() {
        let request = AnalysisRequest {
            text: "не работает приложение".to_string(),
            age: Some(34),
            segment: Segment::Vip,
            attachments: vec!["screen.png".to_string()],
        };
        let prompt = OpenRouterLlm::build_prompt(&request);
        assert!(prompt.contains("не работает приложение"));
        assert!(prompt.contains("CLIENT AGE: 34"));
        assert!(prompt.contains("VIP"));
        assert!(prompt.contains("screen.png"));
    }

    #[test]
    fn test_raw_analysis_defaults() {
        let raw: RawAnalysis = serde_json::from_str(
            r#"{"detected_type": "fraud", "sentiment": "negative", "language": "RU"}"#,
        )
        .unwrap();
        assert!(!raw.needs_data_change);
        assert!(raw.anomaly_flags.is_empty());
        assert_eq!(TicketType::from_label(&raw.detected_type), TicketType::Fraud);
    }
}
