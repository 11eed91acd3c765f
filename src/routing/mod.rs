//! Ticket-to-agent assignment: geo filter, skill filter with a relaxation
//! cascade, lowest-load selection, and the shared load ledger.

mod engine;
mod ledger;

use serde::{Deserialize, Serialize};

pub use engine::{RouteDecision, RouteRequest, RoutingEngine, RoutingFailure};
pub use ledger::LoadLedger;

/// A skill-filter requirement that the relaxation cascade may drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillRequirement {
    /// Matching language tag for KZ/EN tickets.
    Language,
    /// Chief position for data-change tickets.
    Position,
    /// `VIP` tag for VIP and Priority segments.
    Vip,
}

impl SkillRequirement {
    /// Label recorded in `routing_details.relaxation` and explanations.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Language => "language",
            Self::Position => "position",
            Self::Vip => "VIP",
        }
    }
}
