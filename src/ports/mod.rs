//! Thin contracts for the external collaborators: the LLM analyzer, the
//! geocoding vendors and the spam classifier. The pipeline only ever talks
//! to these traits; `http` holds the vendor-facing adapters.

mod http;

use async_trait::async_trait;

pub use http::{HttpGeocoder, HttpSpamClassifier, OpenRouterLlm};

use crate::domain::{GeoPoint, Language, Segment, Sentiment, TicketType};
use crate::error::StageError;

/// Input to the analysis model. `text` is always the scrubbed description;
/// raw ticket text must never reach a vendor.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub text: String,
    pub age: Option<u32>,
    pub segment: Segment,
    pub attachments: Vec<String>,
}

/// Validated model output. Ports are responsible for schema validation:
/// an unparseable response is a transient failure up to the retry budget.
#[derive(Debug, Clone)]
pub struct LlmAnalysis {
    pub detected_type: TicketType,
    pub language: Language,
    pub language_is_mixed: bool,
    pub sentiment: Sentiment,
    pub sentiment_confidence: f64,
    pub summary: String,
    pub anomaly_flags: Vec<String>,
    /// When set, the detected type is overridden to data-change.
    pub needs_data_change: bool,
}

#[async_trait]
pub trait LlmPort: Send + Sync {
    async fn analyze(&self, request: AnalysisRequest) -> Result<LlmAnalysis, StageError>;
}

#[derive(Debug, Clone)]
pub struct GeoHit {
    pub point: GeoPoint,
    pub provider: String,
}

#[async_trait]
pub trait GeocoderPort: Send + Sync {
    /// Resolve one normalized query. `Ok(None)` means the vendors answered
    /// but found nothing; errors follow the transient/permanent split.
    async fn geocode(&self, query: &str) -> Result<Option<GeoHit>, StageError>;
}

#[derive(Debug, Clone, Copy)]
pub struct SpamScore {
    pub is_spam: bool,
    pub probability: f64,
}

#[async_trait]
pub trait SpamClassifierPort: Send + Sync {
    async fn classify(&self, text: &str) -> Result<SpamScore, StageError>;
}
