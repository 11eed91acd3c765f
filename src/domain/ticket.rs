use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::value::Payload;

/// Customer segment from the upload. Drives priority and skill requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Segment {
    #[serde(rename = "VIP")]
    Vip,
    Priority,
    #[default]
    Mass,
}

impl Segment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vip => "VIP",
            Self::Priority => "Priority",
            Self::Mass => "Mass",
        }
    }
}

/// Ticket classification produced by the analysis stage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TicketType {
    Complaint,
    DataChange,
    #[default]
    Consultation,
    Claim,
    Outage,
    Fraud,
    Spam,
}

impl TicketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complaint => "complaint",
            Self::DataChange => "data_change",
            Self::Consultation => "consultation",
            Self::Claim => "claim",
            Self::Outage => "outage",
            Self::Fraud => "fraud",
            Self::Spam => "spam",
        }
    }

    /// Map a free-form vendor label onto the fixed enum. Exact labels win;
    /// labels carrying extra words fall back to a substring scan. Unknown
    /// labels default to `Consultation`.
    pub fn from_label(label: &str) -> Self {
        let key = label.trim().to_lowercase();
        match key.as_str() {
            "complaint" | "жалоба" => return Self::Complaint,
            "data_change" | "data change" | "смена данных" => return Self::DataChange,
            "consultation" | "консультация" => return Self::Consultation,
            "claim" | "претензия" => return Self::Claim,
            "outage" | "app_malfunction" | "неработоспособность приложения" => {
                return Self::Outage;
            }
            "fraud" | "мошеннические действия" | "мошенничество" => return Self::Fraud,
            "spam" | "спам" => return Self::Spam,
            _ => {}
        }

        // Stems ordered so the severe types are matched first.
        const SUBSTRINGS: &[(&str, TicketType)] = &[
            ("мошеннич", TicketType::Fraud),
            ("fraud", TicketType::Fraud),
            ("неработоспособност", TicketType::Outage),
            ("outage", TicketType::Outage),
            ("претензи", TicketType::Claim),
            ("claim", TicketType::Claim),
            ("смена данных", TicketType::DataChange),
            ("data change", TicketType::DataChange),
            ("data_change", TicketType::DataChange),
            ("жалоб", TicketType::Complaint),
            ("complaint", TicketType::Complaint),
            ("спам", TicketType::Spam),
            ("spam", TicketType::Spam),
            ("консультаци", TicketType::Consultation),
            ("consultation", TicketType::Consultation),
        ];
        for (needle, ticket_type) in SUBSTRINGS {
            if key.contains(needle) {
                return *ticket_type;
            }
        }
        Self::Consultation
    }
}

impl std::fmt::Display for TicketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    #[default]
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "positive" | "позитивный" => Self::Positive,
            "negative" | "негативный" => Self::Negative,
            _ => Self::Neutral,
        }
    }
}

/// Primary language label assigned by the analysis stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Language {
    #[serde(rename = "RU")]
    #[default]
    Ru,
    #[serde(rename = "KZ")]
    Kz,
    #[serde(rename = "EN")]
    En,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ru => "RU",
            Self::Kz => "KZ",
            Self::En => "EN",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label.trim().to_uppercase().as_str() {
            "KZ" | "KK" => Self::Kz,
            "EN" | "ENG" => Self::En,
            _ => Self::Ru,
        }
    }
}

/// Address fragments as uploaded; any field may be missing or dirty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Address {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub street: Option<String>,
    pub house: Option<String>,
}

impl Address {
    pub fn is_empty(&self) -> bool {
        [
            &self.country,
            &self.region,
            &self.city,
            &self.street,
            &self.house,
        ]
        .iter()
        .all(|f| f.as_deref().map(str::trim).unwrap_or("").is_empty())
    }
}

/// Immutable pipeline input: one row of an uploaded batch.
/// Enrichment results live in [`Analysis`] and stage outcomes, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub batch_id: Uuid,
    /// Zero-based row index within the uploaded file.
    pub row_index: usize,
    pub description: String,
    pub segment: Segment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default)]
    pub address: Address,
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Stable client identifier used for repeat-contact counting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

impl Ticket {
    pub fn new(batch_id: Uuid, row_index: usize, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            row_index,
            description: description.into(),
            segment: Segment::Mass,
            age: None,
            birth_date: None,
            gender: None,
            address: Address::default(),
            attachments: Vec::new(),
            client_ref: None,
        }
    }

    /// Age in years: the explicit field wins, otherwise derived from the
    /// (possibly dirty) birth-date string.
    pub fn effective_age(&self) -> Option<u32> {
        self.age.or_else(|| {
            self.birth_date
                .as_deref()
                .and_then(parse_birth_date)
                .map(age_from)
        })
    }
}

/// Parse an uploaded birth-date string. Accepts the formats seen in real
/// uploads; a trailing time component is stripped first.
pub fn parse_birth_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let date_part = raw.split_whitespace().next().unwrap_or(raw);
    for fmt in ["%d.%m.%Y", "%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y"] {
        if let Ok(parsed) = NaiveDate::parse_from_str(date_part, fmt) {
            if parsed <= Utc::now().date_naive() {
                return Some(parsed);
            }
        }
    }
    None
}

pub fn age_from(birth: NaiveDate) -> u32 {
    let today = Utc::now().date_naive();
    let mut age = today.year() - birth.year();
    if (today.month(), today.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    age.max(0) as u32
}

/// Per-ticket enrichment produced by joining the analysis and geocode
/// stages, then scored by the priority stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub detected_type: TicketType,
    pub language: Language,
    pub language_is_mixed: bool,
    pub sentiment: Sentiment,
    pub sentiment_confidence: f64,
    pub summary: String,
    #[serde(default)]
    pub anomaly_flags: Vec<String>,
    pub priority_base: f64,
    pub priority_extra: f64,
    pub priority_final: f64,
    #[serde(default)]
    pub priority_breakdown: Payload,
}

impl Analysis {
    /// Documented defaults used when the analysis stage fails permanently:
    /// the ticket still flows through priority and routing.
    pub fn fallback(error: &str) -> Self {
        Self {
            detected_type: TicketType::Consultation,
            language: Language::Ru,
            language_is_mixed: false,
            sentiment: Sentiment::Neutral,
            sentiment_confidence: 0.0,
            summary: String::new(),
            anomaly_flags: vec![format!("analysis_failed: {error}")],
            priority_base: 0.0,
            priority_extra: 0.0,
            priority_final: 0.0,
            priority_breakdown: Payload::new(),
        }
    }
}

/// Batch processing lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One uploaded file worth of tickets, processed as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub filename: String,
    pub total_rows: usize,
    pub status: BatchStatus,
}

impl Batch {
    pub fn new(filename: impl Into<String>, total_rows: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename: filename.into(),
            total_rows,
            status: BatchStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_label_normalization() {
        assert_eq!(TicketType::from_label("Complaint"), TicketType::Complaint);
        assert_eq!(TicketType::from_label("Жалоба"), TicketType::Complaint);
        assert_eq!(TicketType::from_label("data change"), TicketType::DataChange);
        assert_eq!(TicketType::from_label("who knows"), TicketType::Consultation);
    }

    #[test]
    fn test_type_label_substring_fallback() {
        assert_eq!(
            TicketType::from_label("Мошенничество клиента"),
            TicketType::Fraud
        );
        assert_eq!(
            TicketType::from_label("Неработоспособность приложения Kaspi"),
            TicketType::Outage
        );
        assert_eq!(
            TicketType::from_label("официальная претензия по возврату"),
            TicketType::Claim
        );
        assert_eq!(
            TicketType::from_label("возможный fraud case"),
            TicketType::Fraud
        );
    }

    #[test]
    fn test_birth_date_formats() {
        assert_eq!(
            parse_birth_date("15.03.1990"),
            NaiveDate::from_ymd_opt(1990, 3, 15)
        );
        assert_eq!(
            parse_birth_date("1990-03-15 00:00:00"),
            NaiveDate::from_ymd_opt(1990, 3, 15)
        );
        assert_eq!(parse_birth_date(""), None);
        assert_eq!(parse_birth_date("not a date"), None);
        // Future dates are rejected rather than producing negative ages.
        assert_eq!(parse_birth_date("01.01.2999"), None);
    }

    #[test]
    fn test_effective_age_prefers_explicit_field() {
        let mut ticket = Ticket::new(Uuid::new_v4(), 0, "text");
        ticket.age = Some(41);
        ticket.birth_date = Some("01.01.1950".into());
        assert_eq!(ticket.effective_age(), Some(41));
    }

    #[test]
    fn test_empty_address() {
        assert!(Address::default().is_empty());
        let addr = Address {
            city: Some("  ".into()),
            ..Address::default()
        };
        assert!(addr.is_empty());
    }
}
