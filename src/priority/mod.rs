//! Composite priority scoring.
//!
//! Pure and deterministic: a weighted base over segment, type, sentiment,
//! age and repeat-contact components, bounded additive extras, a clamp to
//! [1, 10] and a floor for fraud.

use crate::config::ScoringConfig;
use crate::domain::{Payload, Segment, Sentiment, Ticket, TicketType, Value, payload};

/// Everything the scorer needs for one ticket.
#[derive(Debug, Clone, Copy)]
pub struct PriorityInput<'a> {
    pub ticket: &'a Ticket,
    pub detected_type: TicketType,
    pub sentiment: Sentiment,
    /// Row count of the batch, for the FIFO bonus.
    pub total_rows: usize,
    /// How many tickets in this batch share the ticket's client reference.
    pub repeat_count: u32,
}

#[derive(Debug, Clone)]
pub struct PriorityScore {
    pub base: f64,
    pub extras: f64,
    pub score: f64,
    pub breakdown: Payload,
}

fn segment_score(segment: Segment) -> f64 {
    match segment {
        Segment::Vip => 1.0,
        Segment::Priority => 0.66,
        Segment::Mass => 0.25,
    }
}

fn type_score(ticket_type: TicketType) -> f64 {
    match ticket_type {
        TicketType::Fraud => 1.0,
        TicketType::Outage => 0.9,
        TicketType::Claim => 0.7,
        TicketType::DataChange => 0.6,
        TicketType::Complaint => 0.5,
        TicketType::Consultation => 0.2,
        TicketType::Spam => 0.0,
    }
}

fn sentiment_score(sentiment: Sentiment) -> f64 {
    match sentiment {
        Sentiment::Negative => 1.0,
        Sentiment::Neutral => 0.4,
        Sentiment::Positive => 0.1,
    }
}

#[derive(Debug, Clone)]
pub struct PriorityScorer {
    config: ScoringConfig,
}

impl PriorityScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn score(&self, input: PriorityInput<'_>) -> PriorityScore {
        let config = &self.config;
        let weights = &config.weights;
        let age = input.ticket.effective_age();

        let segment = segment_score(input.ticket.segment);
        let ticket_type = type_score(input.detected_type);
        let sentiment = sentiment_score(input.sentiment);
        let age_component = self.age_score(age);
        let repeat =
            (input.repeat_count as f64 / config.repeat_saturation as f64).min(1.0);

        let base = 10.0
            * (weights.segment * segment
                + weights.ticket_type * ticket_type
                + weights.sentiment * sentiment
                + weights.age * age_component
                + weights.repeat * repeat);

        let fifo = self.fifo_bonus(input.ticket.row_index, input.total_rows);
        let expansion = self.expansion_bonus(input.ticket.address.country.as_deref());
        let young_vip = self.young_vip_bonus(input.ticket.segment, age);
        let extras = fifo + expansion + young_vip;

        let mut score = (base + extras).clamp(1.0, 10.0);
        let fraud_floor_applied =
            input.detected_type == TicketType::Fraud && score < config.fraud_floor;
        if fraud_floor_applied {
            score = config.fraud_floor;
        }

        let mut breakdown = payload([
            ("segment", weights.segment * segment * 10.0),
            ("type", weights.ticket_type * ticket_type * 10.0),
            ("sentiment", weights.sentiment * sentiment * 10.0),
            ("age", weights.age * age_component * 10.0),
            ("repeat", weights.repeat * repeat * 10.0),
            ("base", base),
            ("fifo", fifo),
            ("expansion", expansion),
            ("young_vip", young_vip),
            ("extras", extras),
            ("final", score),
        ]);
        breakdown.insert(
            "fraud_floor_applied".to_string(),
            Value::Bool(fraud_floor_applied),
        );

        PriorityScore {
            base,
            extras,
            score,
            breakdown,
        }
    }

    fn age_score(&self, age: Option<u32>) -> f64 {
        let curve = &self.config.age_curve;
        match age {
            None => curve.unknown,
            Some(a) if a < curve.young_cutoff => curve.young,
            Some(a) if a >= curve.senior_cutoff => curve.senior,
            Some(_) => curve.middle,
        }
    }

    /// Linear bonus favouring earlier rows: the first row of a batch gets
    /// the full bonus, the last gets zero.
    fn fifo_bonus(&self, row_index: usize, total_rows: usize) -> f64 {
        if total_rows <= 1 {
            return self.config.fifo_bonus_max;
        }
        let position = row_index.min(total_rows - 1) as f64 / (total_rows - 1) as f64;
        self.config.fifo_bonus_max * (1.0 - position)
    }

    fn expansion_bonus(&self, country: Option<&str>) -> f64 {
        let Some(country) = country.map(str::trim).filter(|c| !c.is_empty()) else {
            return 0.0;
        };
        if country.eq_ignore_ascii_case(&self.config.home_country) {
            return 0.0;
        }
        let listed = self
            .config
            .expansion_countries
            .iter()
            .any(|c| c.eq_ignore_ascii_case(country));
        if listed { self.config.expansion_bonus } else { 0.0 }
    }

    fn young_vip_bonus(&self, segment: Segment, age: Option<u32>) -> f64 {
        match (segment, age) {
            (Segment::Vip, Some(a)) if a < self.config.young_vip_age_cutoff => {
                self.config.young_vip_bonus
            }
            _ => 0.0,
        }
    }
}
