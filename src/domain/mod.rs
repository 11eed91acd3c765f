//! Core domain types: tickets, agents, analyses, stage outcomes and the
//! dynamic payload values carried by events.

mod agent;
mod stage;
mod ticket;
mod value;

pub use agent::{Agent, Assignment, GeoPoint, Office, Position};
pub use stage::{Stage, StageOutcome, StageStatus};
pub use ticket::{
    Address, Analysis, Batch, BatchStatus, Language, Segment, Sentiment, Ticket, TicketType,
    age_from, parse_birth_date,
};
pub use value::{Payload, Value, payload};
