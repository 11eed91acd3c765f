//! PII detection and the scrub/rehydrate vault.

mod patterns;
mod vault;

pub use patterns::{PiiKind, PiiSpan, detect};
pub use vault::{PiiBinding, PiiVault};
