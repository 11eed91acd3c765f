pub mod config;
pub mod domain;
pub mod error;
pub mod event;
pub mod geo;
pub mod pii;
pub mod pipeline;
pub mod ports;
pub mod priority;
pub mod routing;
pub mod spam;

pub use config::{FlowConfig, Secrets};
pub use domain::{
    Agent, Analysis, Assignment, Batch, BatchStatus, Office, Stage, StageOutcome, StageStatus,
    Ticket,
};
pub use error::{FlowError, Result, StageError};
pub use event::{EventBus, StageEvent, Subscription};
pub use geo::{AddressResolver, GeocodeCache, haversine_km};
pub use pii::PiiVault;
pub use pipeline::{
    BatchReport, Orchestrator, PipelinePorts, ProgressReport, ProgressStore, Roster, StageRunner,
};
pub use ports::{GeocoderPort, LlmPort, SpamClassifierPort};
pub use priority::PriorityScorer;
pub use routing::{LoadLedger, RoutingEngine};
pub use spam::SpamFilter;
