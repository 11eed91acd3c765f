//! Regex-based PII detection: phones, national ids, card numbers, emails
//! and capitalized full-name bigrams.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    Phone,
    NationalId,
    Card,
    Email,
    Name,
}

impl PiiKind {
    /// Tag used inside scrub tokens.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Phone => "PHONE",
            Self::NationalId => "ID",
            Self::Card => "CARD",
            Self::Email => "EMAIL",
            Self::Name => "NAME",
        }
    }
}

/// One detected PII occurrence, byte offsets into the source text.
#[derive(Debug, Clone)]
pub struct PiiSpan {
    pub start: usize,
    pub end: usize,
    pub kind: PiiKind,
    pub text: String,
}

static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:\+7|8)[\s\-]?\(?\d{3}\)?[\s\-]?\d{3}[\s\-]?\d{2}[\s\-]?\d{2}|(?:\+7|8)\d{10}",
    )
    .expect("phone regex")
});

// Exactly 12 digits; \b keeps it out of longer digit runs.
static NATIONAL_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{12}\b").expect("national id regex"));

static CARD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{4}[\s\-]?\d{4}[\s\-]?\d{4}[\s\-]?\d{4}\b").expect("card regex")
});

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}").expect("email regex")
});

// Two consecutive capitalized words (Cyrillic or Latin).
static FULL_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[А-ЯЁA-Z][а-яёa-z]{1,20}\s+[А-ЯЁA-Z][а-яёa-z]{1,25}\b")
        .expect("full name regex")
});

// Bigrams that look like names but are not.
const NAME_IGNORE: &[&str] = &[
    "добрый день",
    "добрый вечер",
    "доброе утро",
    "уважаемые коллеги",
    "уважаемый клиент",
    "подскажите пожалуйста",
    "хочу узнать",
    "прошу вас",
    "dear team",
    "good morning",
    "best regards",
];

/// Detect all PII spans in `text`, overlap-free, ordered by position.
/// When two detections overlap the earlier (then longer) span wins.
pub fn detect(text: &str) -> Vec<PiiSpan> {
    let mut spans = Vec::new();

    for m in PHONE_RE.find_iter(text) {
        spans.push(span(m, PiiKind::Phone));
    }
    for m in CARD_RE.find_iter(text) {
        spans.push(span(m, PiiKind::Card));
    }
    for m in NATIONAL_ID_RE.find_iter(text) {
        spans.push(span(m, PiiKind::NationalId));
    }
    for m in EMAIL_RE.find_iter(text) {
        spans.push(span(m, PiiKind::Email));
    }
    for m in FULL_NAME_RE.find_iter(text) {
        if NAME_IGNORE.contains(&m.as_str().to_lowercase().as_str()) {
            continue;
        }
        spans.push(span(m, PiiKind::Name));
    }

    resolve_overlaps(spans)
}

fn span(m: regex::Match<'_>, kind: PiiKind) -> PiiSpan {
    PiiSpan {
        start: m.start(),
        end: m.end(),
        kind,
        text: m.as_str().to_string(),
    }
}

fn resolve_overlaps(mut spans: Vec<PiiSpan>) -> Vec<PiiSpan> {
    spans.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
    let mut kept: Vec<PiiSpan> = Vec::with_capacity(spans.len());
    for candidate in spans {
        match kept.last() {
            Some(last) if candidate.start < last.end => {}
            _ => kept.push(candidate),
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_phone_variants() {
        let text = "звоните +7 (701) 123-45-67 или 87011234567";
        let spans = detect(text);
        assert_eq!(spans.len(), 2);
        assert!(spans.iter().all(|s| s.kind == PiiKind::Phone));
    }

    #[test]
    fn test_national_id_exact_twelve_digits() {
        assert_eq!(detect("ИИН 880123456789").len(), 1);
        // 13 digits is not a national id
        assert!(
            detect("8801234567891")
                .iter()
                .all(|s| s.kind != PiiKind::NationalId)
        );
    }

    #[test]
    fn test_card_and_email() {
        let spans = detect("карта 4400 1234 5678 9010, почта ivan@example.com");
        let kinds: Vec<_> = spans.iter().map(|s| s.kind).collect();
        assert!(kinds.contains(&PiiKind::Card));
        assert!(kinds.contains(&PiiKind::Email));
    }

    #[test]
    fn test_name_bigrams_with_ignore_list() {
        let spans = detect("Добрый день, меня зовут Иван Петров");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].kind, PiiKind::Name);
        assert_eq!(spans[0].text, "Иван Петров");
    }

    #[test]
    fn test_overlap_keeps_earliest() {
        // The card digits also contain no 12-digit id thanks to boundaries,
        // but a phone inside a longer match must not double-report.
        let spans = detect("87011234567");
        assert_eq!(spans.len(), 1);
    }
}
