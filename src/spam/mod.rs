//! Two-layer spam detection.
//!
//! A cheap structural pass (length floor, URL density, invisible-character
//! padding, promotional keywords) decides the obvious cases on its own;
//! only the ambiguous middle band is sent to the external classifier, and
//! the two scores are combined against the configured threshold.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::SpamConfig;
use crate::error::StageError;
use crate::ports::SpamClassifierPort;

#[derive(Debug, Clone)]
pub struct SpamVerdict {
    pub is_spam: bool,
    pub probability: f64,
    pub reason: String,
}

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)https?://\S+|www\.\S+").expect("url regex"));

static SAFELINKS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)safelinks\.protection\.outlook").expect("safelinks regex"));

// Braille padding, zero-width characters and NBSP.
static INVISIBLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("[\u{2800}-\u{28FF}\u{200B}\u{200C}\u{200D}\u{FEFF}\u{00A0}]")
        .expect("invisible regex")
});

static EXCLAIM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!{3,}").expect("bang regex"));

#[derive(Debug, Clone, Default)]
pub struct StructuralScore {
    pub score: f64,
    pub signals: Vec<String>,
}

/// Structural spam signals in [0, 1]. High-confidence structural patterns
/// can classify a ticket without touching the model.
pub fn structural_score(text: &str, config: &SpamConfig) -> StructuralScore {
    let mut score: f64 = 0.0;
    let mut signals = Vec::new();
    let total_len = text.chars().count().max(1);

    let urls: Vec<_> = URL_RE.find_iter(text).collect();
    if !urls.is_empty() {
        let url_chars: usize = urls.iter().map(|m| m.as_str().chars().count()).sum();
        let density = url_chars as f64 / total_len as f64;
        if density > 0.3 {
            score += 0.4;
            signals.push(format!("url_density={:.0}%", density * 100.0));
        } else if urls.len() >= 2 {
            score += 0.2;
            signals.push(format!("urls={}", urls.len()));
        } else {
            score += 0.05;
            signals.push("urls=1".to_string());
        }
    }

    if SAFELINKS_RE.is_match(text) {
        score += 0.3;
        signals.push("safelinks".to_string());
    }

    let invisible = INVISIBLE_RE.find_iter(text).count();
    if invisible > 5 {
        score += 0.5;
        signals.push(format!("invisible_chars={invisible}"));
    } else if invisible > 0 {
        score += 0.1;
        signals.push(format!("invisible_chars={invisible}"));
    }

    let lower = text.to_lowercase();
    let promo_hits: usize = config
        .promo_keywords
        .iter()
        .map(|kw| lower.matches(kw.as_str()).count())
        .sum();
    if promo_hits >= 3 {
        score += 0.5;
        signals.push(format!("promo_keywords={promo_hits}"));
    } else if promo_hits >= 1 {
        score += 0.2;
        signals.push(format!("promo_keywords={promo_hits}"));
    }

    if EXCLAIM_RE.is_match(text) {
        score += 0.2;
        signals.push("exclamation_run".to_string());
    }

    StructuralScore {
        score: score.min(1.0),
        signals,
    }
}

fn clean_for_model(text: &str) -> String {
    let without_urls = URL_RE.replace_all(text, " ");
    let without_invisible = INVISIBLE_RE.replace_all(&without_urls, "");
    without_invisible
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct SpamFilter {
    config: SpamConfig,
    classifier: Arc<dyn SpamClassifierPort>,
    /// Bounds concurrent classifier calls; the structural pass is free.
    permits: Option<Arc<Semaphore>>,
}

impl SpamFilter {
    pub fn new(config: SpamConfig, classifier: Arc<dyn SpamClassifierPort>) -> Self {
        Self {
            config,
            classifier,
            permits: None,
        }
    }

    pub fn with_permits(mut self, permits: Arc<Semaphore>) -> Self {
        self.permits = Some(permits);
        self
    }

    pub async fn check(&self, text: &str) -> Result<SpamVerdict, StageError> {
        let stripped = text.trim();
        if stripped.is_empty() {
            return Ok(SpamVerdict {
                is_spam: true,
                probability: 1.0,
                reason: "empty body".to_string(),
            });
        }
        if stripped.chars().count() < self.config.min_length {
            return Ok(SpamVerdict {
                is_spam: true,
                probability: 1.0,
                reason: format!("too short ({} chars)", stripped.chars().count()),
            });
        }

        let structural = structural_score(stripped, &self.config);
        let signals = structural.signals.join(", ");

        if structural.score >= self.config.structural_override {
            return Ok(SpamVerdict {
                is_spam: true,
                probability: structural.score,
                reason: format!("structural override {:.2} [{signals}]", structural.score),
            });
        }
        if structural.score <= self.config.clear_floor {
            return Ok(SpamVerdict {
                is_spam: false,
                probability: structural.score,
                reason: if signals.is_empty() {
                    "no structural signals".to_string()
                } else {
                    format!("weak structural signals [{signals}]")
                },
            });
        }

        // Ambiguous band: ask the classifier.
        let cleaned = clean_for_model(stripped);
        if cleaned.chars().count() < self.config.min_length {
            let is_spam = structural.score >= 0.5;
            return Ok(SpamVerdict {
                is_spam,
                probability: structural.score,
                reason: format!("cleaned text empty, structural {:.2}", structural.score),
            });
        }

        let _permit = match &self.permits {
            Some(sem) => Some(
                sem.acquire()
                    .await
                    .map_err(|_| StageError::Transient("classifier permits closed".into()))?,
            ),
            None => None,
        };
        let model = self.classifier.classify(&cleaned).await?;
        let model_prob = if model.is_spam {
            model.probability
        } else {
            1.0 - model.probability
        };
        let combined = (model_prob * self.config.model_weight
            + structural.score * self.config.structural_weight)
            .min(1.0);

        debug!(
            model = model_prob,
            structural = structural.score,
            combined,
            "spam scores"
        );

        Ok(SpamVerdict {
            is_spam: combined >= self.config.threshold,
            probability: combined,
            reason: format!(
                "model={model_prob:.3}, structural={:.2} [{signals}], combined={combined:.3}",
                structural.score
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::ports::SpamScore;

    struct StubClassifier {
        score: SpamScore,
        calls: AtomicUsize,
    }

    impl StubClassifier {
        fn new(is_spam: bool, probability: f64) -> Arc<Self> {
            Arc::new(Self {
                score: SpamScore {
                    is_spam,
                    probability,
                },
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SpamClassifierPort for StubClassifier {
        async fn classify(&self, _text: &str) -> Result<SpamScore, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.score)
        }
    }

    #[tokio::test]
    async fn test_promo_url_blast_is_structural_spam() {
        let classifier = StubClassifier::new(false, 0.9);
        let filter = SpamFilter::new(SpamConfig::default(), Arc::clone(&classifier) as _);
        let verdict = filter.check("!!!КУПИ СЕЙЧАС http://x.y").await.unwrap();
        assert!(verdict.is_spam);
        assert!(verdict.probability >= 0.8);
        // Short-circuited before the model.
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_and_short_bodies_are_spam() {
        let filter = SpamFilter::new(SpamConfig::default(), StubClassifier::new(false, 0.9) as _);
        assert!(filter.check("   ").await.unwrap().is_spam);
        assert!(filter.check("ok").await.unwrap().is_spam);
    }

    #[tokio::test]
    async fn test_plain_ticket_skips_classifier() {
        let classifier = StubClassifier::new(true, 0.99);
        let filter = SpamFilter::new(SpamConfig::default(), Arc::clone(&classifier) as _);
        let verdict = filter
            .check("Здравствуйте, подскажите как поменять тариф на счёте")
            .await
            .unwrap();
        assert!(!verdict.is_spam);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ambiguous_band_consults_classifier() {
        let classifier = StubClassifier::new(true, 1.0);
        let filter = SpamFilter::new(SpamConfig::default(), Arc::clone(&classifier) as _);
        // One promo keyword in normal-length text: ambiguous.
        let verdict = filter
            .check("Только сегодня акция на обслуживание счёта, подробности внутри")
            .await
            .unwrap();
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
        assert!(verdict.is_spam);
    }

    #[tokio::test]
    async fn test_invisible_padding_scores_high() {
        let padded = format!("обычный текст {}", "\u{2800}".repeat(12));
        let score = structural_score(&padded, &SpamConfig::default());
        assert!(score.score >= 0.5);
        assert!(score.signals.iter().any(|s| s.contains("invisible")));
    }
}
