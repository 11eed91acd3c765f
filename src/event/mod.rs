//! Stage event model and the in-process event bus.

mod bus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use bus::{DEFAULT_QUEUE_CAPACITY, EventBus, Subscription};

use crate::domain::{Payload, Stage, StageStatus};

/// One observable pipeline transition. Batch-level events carry the
/// all-zeroes ticket id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub ticket_id: Uuid,
    pub batch_id: Uuid,
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default)]
    pub data: Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StageEvent {
    pub fn ticket(ticket_id: Uuid, batch_id: Uuid, stage: Stage) -> Self {
        Self {
            ticket_id,
            batch_id,
            stage,
            status: StageStatus::InProgress,
            field: None,
            data: Payload::new(),
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn batch(batch_id: Uuid, stage: Stage) -> Self {
        Self::ticket(Uuid::nil(), batch_id, stage)
    }

    pub fn is_batch_level(&self) -> bool {
        self.ticket_id.is_nil()
    }

    pub fn with_status(mut self, status: StageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_data(mut self, data: Payload) -> Self {
        self.data = data;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payload;

    #[test]
    fn test_batch_event_uses_nil_ticket() {
        let event = StageEvent::batch(Uuid::new_v4(), Stage::Pipeline);
        assert!(event.is_batch_level());
        assert_eq!(event.ticket_id, Uuid::nil());
    }

    #[test]
    fn test_event_serializes_rfc3339() {
        let event = StageEvent::batch(Uuid::new_v4(), Stage::Pipeline)
            .with_status(StageStatus::Completed)
            .with_data(payload([("total", 3usize)]));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stage"], "pipeline");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["data"]["total"], 3.0);
        // chrono serializes DateTime<Utc> as RFC 3339
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }
}
