use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::value::Payload;

/// Agent seniority. `Chief` is required for data-change tickets unless the
/// routing cascade relaxes the requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    Specialist,
    Lead,
    Chief,
}

impl Position {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Specialist => "specialist",
            Self::Lead => "lead",
            Self::Chief => "chief",
        }
    }
}

/// Physical office with WGS84 coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Office {
    pub id: String,
    pub name: String,
    pub address: String,
    pub point: GeoPoint,
}

/// WGS84 point, degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Human agent working from a home office.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub full_name: String,
    pub position: Position,
    /// Free-form skill tags, e.g. `VIP`, `KZ`, `EN`.
    #[serde(default)]
    pub skills: Vec<String>,
    /// Tie-breaker coefficient in selection; higher wins.
    pub skill_factor: f64,
    pub office_id: String,
    /// Load carried into the batch (e.g. open tickets from earlier work).
    #[serde(default)]
    pub base_load: f64,
    #[serde(default)]
    pub stress_score: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl Agent {
    pub fn has_skill(&self, tag: &str) -> bool {
        self.skills.iter().any(|s| s.eq_ignore_ascii_case(tag))
    }
}

/// The routing decision for one ticket. Exactly one exists per non-spam
/// ticket once the routing stage completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub ticket_id: Uuid,
    pub agent_id: String,
    pub office_id: String,
    pub explanation: String,
    pub routing_details: Payload,
    pub assigned_at: DateTime<Utc>,
}
