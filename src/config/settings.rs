use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::TicketType;
use crate::error::{FlowError, Result};
use crate::routing::SkillRequirement;

/// Top-level policy object, read once at start-up and immutable for the
/// life of a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub pipeline: PipelineConfig,
    pub scoring: ScoringConfig,
    pub routing: RoutingConfig,
    pub spam: SpamConfig,
    pub geo: GeoConfig,
    pub events: EventsConfig,
}

impl FlowConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.pipeline.llm_concurrency == 0 {
            errors.push("pipeline.llm_concurrency must be greater than 0");
        }
        if self.pipeline.geocode_concurrency == 0 {
            errors.push("pipeline.geocode_concurrency must be greater than 0");
        }
        if self.pipeline.spam_llm_concurrency == 0 {
            errors.push("pipeline.spam_llm_concurrency must be greater than 0");
        }
        if self.pipeline.backoff_factor < 1.0 {
            errors.push("pipeline.backoff_factor must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.pipeline.backoff_jitter) {
            errors.push("pipeline.backoff_jitter must be between 0.0 and 1.0");
        }
        if self.pipeline.backoff_ceiling_ms < self.pipeline.backoff_initial_ms {
            errors.push("pipeline.backoff_ceiling_ms must be >= backoff_initial_ms");
        }

        let w = &self.scoring.weights;
        if [w.segment, w.ticket_type, w.sentiment, w.age, w.repeat]
            .iter()
            .any(|v| !(0.0..=1.0).contains(v))
        {
            errors.push("scoring.weights entries must be between 0.0 and 1.0");
        }
        if w.segment + w.ticket_type + w.sentiment + w.age + w.repeat > 1.0 + f64::EPSILON {
            errors.push("scoring.weights must sum to at most 1.0");
        }
        if !(1.0..=10.0).contains(&self.scoring.fraud_floor) {
            errors.push("scoring.fraud_floor must be between 1.0 and 10.0");
        }
        if self.scoring.repeat_saturation == 0 {
            errors.push("scoring.repeat_saturation must be greater than 0");
        }

        if self.routing.relaxation_order.is_empty() {
            errors.push("routing.relaxation_order must not be empty");
        }
        let mut seen = Vec::new();
        for req in &self.routing.relaxation_order {
            if seen.contains(req) {
                errors.push("routing.relaxation_order must not repeat requirements");
                break;
            }
            seen.push(*req);
        }
        if self.routing.geo_slack_factor < 1.0 {
            errors.push("routing.geo_slack_factor must be >= 1.0");
        }
        if self.routing.geo_min_radius_km <= 0.0 {
            errors.push("routing.geo_min_radius_km must be positive");
        }
        if self.routing.default_difficulty <= 0.0 {
            errors.push("routing.default_difficulty must be positive");
        }

        if !(0.0..=1.0).contains(&self.spam.threshold) {
            errors.push("spam.threshold must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.spam.structural_override) {
            errors.push("spam.structural_override must be between 0.0 and 1.0");
        }
        if self.events.queue_capacity == 0 {
            errors.push("events.queue_capacity must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(FlowError::Config(errors.join("; ")))
        }
    }
}

/// Stage concurrency ceilings, retry budgets and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub llm_concurrency: usize,
    pub geocode_concurrency: usize,
    pub spam_llm_concurrency: usize,
    /// Retries after the first attempt, for transient failures only.
    pub retry_budget: u32,
    pub backoff_initial_ms: u64,
    pub backoff_factor: f64,
    /// Fractional jitter applied symmetrically to each backoff delay.
    pub backoff_jitter: f64,
    pub backoff_ceiling_ms: u64,
    pub llm_attempt_timeout_secs: u64,
    pub llm_wall_clock_secs: u64,
    pub geocode_attempt_timeout_secs: u64,
    pub geocode_wall_clock_secs: u64,
    pub spam_attempt_timeout_secs: u64,
    pub spam_wall_clock_secs: u64,
    pub store_write_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            llm_concurrency: 5,
            geocode_concurrency: 10,
            spam_llm_concurrency: 3,
            retry_budget: 2,
            backoff_initial_ms: 250,
            backoff_factor: 2.0,
            backoff_jitter: 0.2,
            backoff_ceiling_ms: 4000,
            llm_attempt_timeout_secs: 20,
            llm_wall_clock_secs: 60,
            geocode_attempt_timeout_secs: 5,
            geocode_wall_clock_secs: 15,
            spam_attempt_timeout_secs: 10,
            spam_wall_clock_secs: 30,
            store_write_timeout_secs: 2,
        }
    }
}

/// Weights of the composite priority base score. The remainder up to 1.0
/// is reserved headroom.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub segment: f64,
    pub ticket_type: f64,
    pub sentiment: f64,
    pub age: f64,
    pub repeat: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            segment: 0.30,
            ticket_type: 0.25,
            sentiment: 0.15,
            age: 0.10,
            repeat: 0.07,
        }
    }
}

/// Piecewise age component: younger and senior clients score higher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgeCurve {
    pub young_cutoff: u32,
    pub senior_cutoff: u32,
    pub young: f64,
    pub middle: f64,
    pub senior: f64,
    pub unknown: f64,
}

impl Default for AgeCurve {
    fn default() -> Self {
        Self {
            young_cutoff: 25,
            senior_cutoff: 60,
            young: 0.8,
            middle: 0.4,
            senior: 0.9,
            unknown: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoreWeights,
    pub age_curve: AgeCurve,
    /// Repeat-contact count at which the repeat component saturates at 1.0.
    pub repeat_saturation: u32,
    pub fifo_bonus_max: f64,
    pub expansion_bonus: f64,
    pub young_vip_bonus: f64,
    pub young_vip_age_cutoff: u32,
    /// Countries marked as strategically prioritised.
    pub expansion_countries: Vec<String>,
    pub home_country: String,
    pub fraud_floor: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            age_curve: AgeCurve::default(),
            repeat_saturation: 5,
            fifo_bonus_max: 1.0,
            expansion_bonus: 1.0,
            young_vip_bonus: 1.0,
            young_vip_age_cutoff: 30,
            expansion_countries: Vec::new(),
            home_country: "Kazakhstan".to_string(),
            fraud_floor: 8.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Order in which skill requirements are dropped when no agent matches.
    pub relaxation_order: Vec<SkillRequirement>,
    /// Load delta per assignment, keyed by detected type.
    pub difficulty_weights: BTreeMap<TicketType, f64>,
    pub default_difficulty: f64,
    /// Candidate offices lie within `nearest_distance * geo_slack_factor`.
    pub geo_slack_factor: f64,
    /// Floor on the candidate radius, km.
    pub geo_min_radius_km: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            relaxation_order: vec![
                SkillRequirement::Language,
                SkillRequirement::Position,
                SkillRequirement::Vip,
            ],
            difficulty_weights: BTreeMap::new(),
            default_difficulty: 1.0,
            geo_slack_factor: 1.5,
            geo_min_radius_km: 50.0,
        }
    }
}

impl RoutingConfig {
    pub fn difficulty(&self, ticket_type: TicketType) -> f64 {
        self.difficulty_weights
            .get(&ticket_type)
            .copied()
            .unwrap_or(self.default_difficulty)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamConfig {
    /// Combined score at or above which a ticket is spam.
    pub threshold: f64,
    /// Structural score that short-circuits to spam without the classifier.
    pub structural_override: f64,
    /// Structural score below which a ticket is clean without the classifier.
    pub clear_floor: f64,
    pub model_weight: f64,
    pub structural_weight: f64,
    pub min_length: usize,
    pub promo_keywords: Vec<String>,
    /// External classifier endpoint used by the default HTTP adapter.
    pub classifier_endpoint: String,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            structural_override: 0.7,
            clear_floor: 0.05,
            model_weight: 0.4,
            structural_weight: 0.6,
            min_length: 3,
            promo_keywords: [
                "скидк",
                "акци",
                "промокод",
                "распродаж",
                "бесплатн",
                "предложени",
                "реклам",
                "оптов",
                "доставк",
                "минимальный заказ",
                "специальные цены",
                "купи сейчас",
                "sale",
                "discount",
                "promo",
                "free",
                "offer",
                "buy now",
                "limited",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            classifier_endpoint: "http://127.0.0.1:8081/classify".to_string(),
        }
    }
}

/// Geocode cascade policy: where to search when the country is missing and
/// where to land when every provider step fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// Countries tried, in order, for a city query without a country.
    pub search_countries: Vec<String>,
    /// Names under which the home country appears in uploads. Addresses
    /// in any other country skip the cascade and go straight to
    /// `last_resort` when fallback offices are configured.
    pub home_country_names: Vec<String>,
    /// Last-resort offices used round-robin when the cascade is exhausted.
    /// Empty means exhausted lookups resolve to `unknown`.
    pub last_resort: Vec<LastResortPoint>,
}

impl GeoConfig {
    pub fn is_home_country(&self, country: &str) -> bool {
        let key = country.trim().to_lowercase();
        self.home_country_names
            .iter()
            .any(|name| name.to_lowercase() == key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastResortPoint {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            search_countries: [
                "Kazakhstan",
                "Russia",
                "Uzbekistan",
                "Kyrgyzstan",
                "Azerbaijan",
                "Georgia",
                "Armenia",
                "Belarus",
                "Moldova",
                "Tajikistan",
                "Turkmenistan",
                "Ukraine",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            home_country_names: ["kazakhstan", "казахстан", "kz", "кз"]
                .into_iter()
                .map(String::from)
                .collect(),
            last_resort: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub queue_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: crate::event::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        FlowConfig::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_weight_rejected() {
        let mut config = FlowConfig::default();
        config.scoring.weights.segment = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_relaxation_rejected() {
        let mut config = FlowConfig::default();
        config.routing.relaxation_order = vec![SkillRequirement::Vip, SkillRequirement::Vip];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = FlowConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back: FlowConfig = toml::from_str(&text).unwrap();
        back.validate().unwrap();
        assert_eq!(back.pipeline.llm_concurrency, 5);
        assert_eq!(back.routing.relaxation_order.len(), 3);
    }

    #[test]
    fn test_difficulty_lookup_falls_back_to_default() {
        let mut config = RoutingConfig::default();
        config
            .difficulty_weights
            .insert(crate::domain::TicketType::Fraud, 2.0);
        assert_eq!(config.difficulty(crate::domain::TicketType::Fraud), 2.0);
        assert_eq!(config.difficulty(crate::domain::TicketType::Claim), 1.0);
    }
}
