//! Health status of a parking service.

use serde::{Deserialize, Serialize};

/// Stored health state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Just started, inventory not loaded
    #[default]
    Unknown,
    /// Accepting arrivals and departures
    Ready,
    /// Registry and store disagree; arrivals refused
    Defunct,
}

/// Response-only health status. FULL is derived from slot counts, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthResponse {
    Unknown,
    Ready,
    /// Ready, but no free slot of any class
    Full,
    Defunct,
}

impl From<Health> for HealthResponse {
    fn from(health: Health) -> Self {
        match health {
            Health::Unknown => HealthResponse::Unknown,
            Health::Ready => HealthResponse::Ready,
            Health::Defunct => HealthResponse::Defunct,
        }
    }
}
