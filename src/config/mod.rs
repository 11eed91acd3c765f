//! Configuration: the policy object read at start-up and the
//! environment-sourced secrets.

mod secrets;
mod settings;

pub use secrets::{
    ENV_DB_PATH, ENV_ENCRYPTION_KEY, ENV_GEOCODER_API_KEY, ENV_LLM_API_KEY, Secrets,
};
pub use settings::{
    AgeCurve, EventsConfig, FlowConfig, GeoConfig, LastResortPoint, PipelineConfig, RoutingConfig,
    ScoreWeights, ScoringConfig, SpamConfig,
};
