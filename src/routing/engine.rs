//! Geo → skill → load assignment.
//!
//! Tickets are routed in descending priority. The geo filter keeps agents
//! whose office is within `max(nearest * slack, min_radius)`; the skill
//! filter applies segment/position/language requirements with a relaxation
//! cascade; selection picks the least-loaded surviving agent and commits
//! the ticket's difficulty weight to the ledger.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::SkillRequirement;
use super::ledger::LoadLedger;
use crate::config::RoutingConfig;
use crate::domain::{
    Agent, Assignment, GeoPoint, Language, Office, Position, Segment, TicketType, Value, payload,
};
use crate::geo::haversine_km;

/// Routing input for one enriched ticket.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub ticket_id: Uuid,
    pub row_index: usize,
    pub segment: Segment,
    pub detected_type: TicketType,
    pub language: Language,
    pub priority: f64,
    pub coordinates: Option<GeoPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingFailure {
    NoEligibleAgents,
}

impl RoutingFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoEligibleAgents => "no-eligible-agents",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub ticket_id: Uuid,
    pub outcome: std::result::Result<Assignment, RoutingFailure>,
}

struct Candidate<'a> {
    agent: &'a Agent,
    office: Option<&'a Office>,
    distance_km: Option<f64>,
}

pub struct RoutingEngine {
    config: RoutingConfig,
    ledger: Arc<LoadLedger>,
}

impl RoutingEngine {
    pub fn new(config: RoutingConfig, ledger: Arc<LoadLedger>) -> Self {
        Self { config, ledger }
    }

    pub fn ledger(&self) -> &Arc<LoadLedger> {
        &self.ledger
    }

    /// Route every request of a batch. Requests are processed in
    /// descending priority (ties by ascending row index) so low-load
    /// selection sees earlier high-priority commits.
    pub fn route_batch(
        &self,
        mut requests: Vec<RouteRequest>,
        agents: &[Agent],
        offices: &[Office],
    ) -> Vec<RouteDecision> {
        requests.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.row_index.cmp(&b.row_index))
        });

        let office_index: HashMap<&str, &Office> =
            offices.iter().map(|o| (o.id.as_str(), o)).collect();

        requests
            .into_iter()
            .map(|request| self.route_one(request, agents, &office_index))
            .collect()
    }

    fn route_one(
        &self,
        request: RouteRequest,
        agents: &[Agent],
        offices: &HashMap<&str, &Office>,
    ) -> RouteDecision {
        let candidates = self.geo_filter(&request, agents, offices);
        if candidates.is_empty() {
            warn!(ticket_id = %request.ticket_id, "no active agents for geo filter");
            return RouteDecision {
                ticket_id: request.ticket_id,
                outcome: Err(RoutingFailure::NoEligibleAgents),
            };
        }

        let requirements = derive_requirements(&request);
        let (eligible, relaxed) = self.skill_filter(&candidates, &requirements, request.language);
        if eligible.is_empty() {
            return RouteDecision {
                ticket_id: request.ticket_id,
                outcome: Err(RoutingFailure::NoEligibleAgents),
            };
        }

        let decision = self.select(&request, &candidates, &eligible, &requirements, &relaxed);
        RouteDecision {
            ticket_id: request.ticket_id,
            outcome: Ok(decision),
        }
    }

    /// Agents whose home office lies within the candidate radius. Tickets
    /// without coordinates see every active agent.
    fn geo_filter<'a>(
        &self,
        request: &RouteRequest,
        agents: &'a [Agent],
        offices: &HashMap<&str, &'a Office>,
    ) -> Vec<Candidate<'a>> {
        let active = agents.iter().filter(|a| a.is_active);

        let Some(point) = request.coordinates else {
            return active
                .map(|agent| Candidate {
                    agent,
                    office: offices.get(agent.office_id.as_str()).copied(),
                    distance_km: None,
                })
                .collect();
        };

        let with_distance: Vec<Candidate<'a>> = active
            .filter_map(|agent| {
                let office = offices.get(agent.office_id.as_str()).copied()?;
                Some(Candidate {
                    agent,
                    office: Some(office),
                    distance_km: Some(haversine_km(point, office.point)),
                })
            })
            .collect();

        let Some(nearest) = with_distance
            .iter()
            .filter_map(|c| c.distance_km)
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        else {
            return with_distance;
        };

        let radius = (nearest * self.config.geo_slack_factor).max(self.config.geo_min_radius_km);
        debug!(nearest, radius, "geo filter radius");

        with_distance
            .into_iter()
            .filter(|c| c.distance_km.is_some_and(|d| d <= radius))
            .collect()
    }

    /// Apply all requirements, then drop them in the configured order
    /// until at least one agent survives. Returns the survivors and the
    /// dropped prefix.
    fn skill_filter<'a, 'c>(
        &self,
        candidates: &'c [Candidate<'a>],
        requirements: &[SkillRequirement],
        language: Language,
    ) -> (Vec<&'c Candidate<'a>>, Vec<SkillRequirement>) {
        let eligible = apply_requirements(candidates, requirements, language);
        if !eligible.is_empty() || requirements.is_empty() {
            return (eligible, Vec::new());
        }

        let mut dropped: Vec<SkillRequirement> = Vec::new();
        for req in &self.config.relaxation_order {
            if !requirements.contains(req) {
                continue;
            }
            dropped.push(*req);
            let remaining: Vec<SkillRequirement> = requirements
                .iter()
                .copied()
                .filter(|r| !dropped.contains(r))
                .collect();
            let eligible = apply_requirements(candidates, &remaining, language);
            if !eligible.is_empty() {
                return (eligible, dropped);
            }
        }

        (Vec::new(), dropped)
    }

    fn select(
        &self,
        request: &RouteRequest,
        all_candidates: &[Candidate<'_>],
        eligible: &[&Candidate<'_>],
        requirements: &[SkillRequirement],
        relaxed: &[SkillRequirement],
    ) -> Assignment {
        let snapshot = self.ledger.snapshot();
        let load_for = |c: &Candidate<'_>| {
            snapshot.get(c.agent.id.as_str()).copied().unwrap_or(0.0) + c.agent.base_load
        };

        let chosen = eligible
            .iter()
            .min_by(|a, b| {
                load_for(a)
                    .partial_cmp(&load_for(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(
                        b.agent
                            .skill_factor
                            .partial_cmp(&a.agent.skill_factor)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                    .then(a.agent.id.cmp(&b.agent.id))
            })
            .expect("eligible is non-empty");

        let difficulty = self.config.difficulty(request.detected_type);
        let load_after = self.ledger.commit(&chosen.agent.id, difficulty) + chosen.agent.base_load;
        let load_before = load_after - difficulty;

        let enforced: Vec<String> = requirements
            .iter()
            .filter(|r| !relaxed.contains(r))
            .map(|r| r.label().to_string())
            .collect();
        let relaxed_labels: Vec<String> = relaxed.iter().map(|r| r.label().to_string()).collect();

        let office_name = chosen
            .office
            .map(|o| o.name.as_str())
            .unwrap_or("unknown office");
        let distance_part = match chosen.distance_km {
            Some(d) => format!("{d:.1} km from the client"),
            None => "no client coordinates, distance not applied".to_string(),
        };
        let enforced_part = if enforced.is_empty() {
            "none".to_string()
        } else {
            enforced.join(", ")
        };
        let relaxed_part = if relaxed_labels.is_empty() {
            "none".to_string()
        } else {
            relaxed_labels.join(", ")
        };
        let explanation = format!(
            "assigned to {} ({}, {office_name}; {distance_part}); \
             constraints enforced: {enforced_part}; relaxed: {relaxed_part}; \
             load {load_before:.2} -> {load_after:.2}",
            chosen.agent.full_name,
            chosen.agent.position.as_str(),
        );

        let mut details = payload([
            ("office_name", Value::from(office_name)),
            ("enforced", Value::from(enforced)),
            ("relaxation", Value::from(relaxed_labels)),
            ("load_before", Value::from(load_before)),
            ("load_after", Value::from(load_after)),
            ("difficulty", Value::from(difficulty)),
            ("priority", Value::from(request.priority)),
        ]);
        if let Some(d) = chosen.distance_km {
            details.insert("distance_km".to_string(), Value::from(d));
        }

        debug!(
            ticket_id = %request.ticket_id,
            agent_id = %chosen.agent.id,
            load_after,
            "ticket routed"
        );

        // The full candidate pool size helps when auditing decisions.
        details.insert(
            "geo_candidates".to_string(),
            Value::from(all_candidates.len()),
        );

        Assignment {
            ticket_id: request.ticket_id,
            agent_id: chosen.agent.id.clone(),
            office_id: chosen.agent.office_id.clone(),
            explanation,
            routing_details: details,
            assigned_at: Utc::now(),
        }
    }
}

fn derive_requirements(request: &RouteRequest) -> Vec<SkillRequirement> {
    let mut requirements = Vec::new();
    if matches!(request.segment, Segment::Vip | Segment::Priority) {
        requirements.push(SkillRequirement::Vip);
    }
    if request.detected_type == TicketType::DataChange {
        requirements.push(SkillRequirement::Position);
    }
    if matches!(request.language, Language::Kz | Language::En) {
        requirements.push(SkillRequirement::Language);
    }
    requirements
}

fn apply_requirements<'a, 'c>(
    candidates: &'c [Candidate<'a>],
    requirements: &[SkillRequirement],
    language: Language,
) -> Vec<&'c Candidate<'a>> {
    candidates
        .iter()
        .filter(|c| {
            requirements.iter().all(|req| match req {
                SkillRequirement::Vip => c.agent.has_skill("VIP"),
                SkillRequirement::Position => c.agent.position == Position::Chief,
                SkillRequirement::Language => c.agent.has_skill(language.as_str()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn office(id: &str, lat: f64, lon: f64) -> Office {
        Office {
            id: id.to_string(),
            name: format!("Office {id}"),
            address: String::new(),
            point: GeoPoint::new(lat, lon),
        }
    }

    fn agent(id: &str, office_id: &str, skills: &[&str], position: Position) -> Agent {
        Agent {
            id: id.to_string(),
            full_name: format!("Agent {id}"),
            position,
            skills: skills.iter().map(|s| s.to_string()).collect(),
            skill_factor: 1.0,
            office_id: office_id.to_string(),
            base_load: 0.0,
            stress_score: 0.0,
            is_active: true,
        }
    }

    fn request(segment: Segment, priority: f64, row: usize) -> RouteRequest {
        RouteRequest {
            ticket_id: Uuid::new_v4(),
            row_index: row,
            segment,
            detected_type: TicketType::Consultation,
            language: Language::Ru,
            priority,
            coordinates: None,
        }
    }

    fn engine() -> RoutingEngine {
        RoutingEngine::new(RoutingConfig::default(), Arc::new(LoadLedger::new()))
    }

    #[test]
    fn test_geo_filter_radius() {
        // Ticket in Astana; one office in Astana, one in Almaty (~960 km).
        let offices = vec![
            office("astana", 51.1694, 71.4491),
            office("almaty", 43.2220, 76.8512),
        ];
        let agents = vec![
            agent("near", "astana", &[], Position::Specialist),
            agent("far", "almaty", &[], Position::Specialist),
        ];
        let mut req = request(Segment::Mass, 5.0, 0);
        req.coordinates = Some(GeoPoint::new(51.2, 71.5));

        let decisions = engine().route_batch(vec![req], &agents, &offices);
        let assignment = decisions[0].outcome.as_ref().unwrap();
        assert_eq!(assignment.agent_id, "near");
    }

    #[test]
    fn test_no_coordinates_passes_all_agents() {
        let offices = vec![office("astana", 51.1694, 71.4491)];
        let agents = vec![
            agent("a-1", "astana", &[], Position::Specialist),
            agent("a-2", "missing-office", &[], Position::Specialist),
        ];
        let decisions = engine().route_batch(
            vec![request(Segment::Mass, 5.0, 0)],
            &agents,
            &offices,
        );
        assert!(decisions[0].outcome.is_ok());
    }

    #[test]
    fn test_vip_relaxation_recorded() {
        // VIP segment but nobody has the VIP tag: cascade drops it.
        let offices = vec![office("astana", 51.1694, 71.4491)];
        let agents = vec![agent("a-1", "astana", &[], Position::Specialist)];
        let mut req = request(Segment::Vip, 9.0, 0);
        req.coordinates = Some(GeoPoint::new(51.2, 71.5));

        let decisions = engine().route_batch(vec![req], &agents, &offices);
        let assignment = decisions[0].outcome.as_ref().unwrap();
        let relaxation = assignment.routing_details.get("relaxation").unwrap();
        assert_eq!(relaxation, &Value::from(vec!["VIP".to_string()]));
        assert!(assignment.explanation.contains("relaxed: VIP"));
    }

    #[test]
    fn test_language_dropped_before_vip() {
        // Priority segment + KZ language; agents have VIP but no KZ tag.
        let offices = vec![office("astana", 51.1694, 71.4491)];
        let agents = vec![agent("a-1", "astana", &["VIP"], Position::Specialist)];
        let mut req = request(Segment::Priority, 7.0, 0);
        req.language = Language::Kz;

        let decisions = engine().route_batch(vec![req], &agents, &offices);
        let assignment = decisions[0].outcome.as_ref().unwrap();
        let relaxation = assignment.routing_details.get("relaxation").unwrap();
        assert_eq!(relaxation, &Value::from(vec!["language".to_string()]));
    }

    #[test]
    fn test_cascade_drops_prefix_cumulatively() {
        // Data-change VIP ticket in KZ, agent matches nothing: the whole
        // prefix language -> position -> VIP is dropped, in order.
        let offices = vec![office("astana", 51.1694, 71.4491)];
        let agents = vec![agent("a-1", "astana", &[], Position::Specialist)];
        let mut req = request(Segment::Vip, 9.0, 0);
        req.detected_type = TicketType::DataChange;
        req.language = Language::En;

        let decisions = engine().route_batch(vec![req], &agents, &offices);
        let assignment = decisions[0].outcome.as_ref().unwrap();
        let relaxation = assignment.routing_details.get("relaxation").unwrap();
        assert_eq!(
            relaxation,
            &Value::from(vec![
                "language".to_string(),
                "position".to_string(),
                "VIP".to_string(),
            ])
        );
    }

    #[test]
    fn test_no_eligible_agents() {
        let decisions = engine().route_batch(
            vec![request(Segment::Mass, 5.0, 0)],
            &[],
            &[],
        );
        assert_eq!(
            decisions[0].outcome.as_ref().unwrap_err(),
            &RoutingFailure::NoEligibleAgents
        );
    }

    #[test]
    fn test_load_balancing_spreads_evenly() {
        let offices = vec![office("astana", 51.1694, 71.4491)];
        let agents = vec![
            agent("a-1", "astana", &[], Position::Specialist),
            agent("a-2", "astana", &[], Position::Specialist),
            agent("a-3", "astana", &[], Position::Specialist),
        ];
        let requests: Vec<_> = (0..10).map(|row| request(Segment::Mass, 5.0, row)).collect();

        let engine = engine();
        let decisions = engine.route_batch(requests, &agents, &offices);
        assert!(decisions.iter().all(|d| d.outcome.is_ok()));

        let loads: Vec<f64> = ["a-1", "a-2", "a-3"]
            .iter()
            .map(|id| engine.ledger().load_of(id))
            .collect();
        let max = loads.iter().cloned().fold(f64::MIN, f64::max);
        let min = loads.iter().cloned().fold(f64::MAX, f64::min);
        assert!(max - min <= 1.0, "loads {loads:?}");
        assert_eq!(loads.iter().sum::<f64>(), 10.0);
    }

    #[test]
    fn test_higher_priority_routed_first() {
        let offices = vec![office("astana", 51.1694, 71.4491)];
        let agents = vec![agent("a-1", "astana", &[], Position::Specialist)];
        let low = request(Segment::Mass, 2.0, 0);
        let high = request(Segment::Mass, 9.0, 1);
        let high_id = high.ticket_id;

        let decisions = engine().route_batch(vec![low, high], &agents, &offices);
        assert_eq!(decisions[0].ticket_id, high_id);
    }

    #[test]
    fn test_tie_break_prefers_higher_skill_factor_then_id() {
        let offices = vec![office("astana", 51.1694, 71.4491)];
        let mut strong = agent("b-strong", "astana", &[], Position::Specialist);
        strong.skill_factor = 2.0;
        let weak = agent("a-weak", "astana", &[], Position::Specialist);
        let agents = vec![weak, strong];

        let decisions =
            engine().route_batch(vec![request(Segment::Mass, 5.0, 0)], &agents, &offices);
        let assignment = decisions[0].outcome.as_ref().unwrap();
        assert_eq!(assignment.agent_id, "b-strong");
    }
}
