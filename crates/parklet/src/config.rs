//! Configuration: TOML file, environment overrides, validation.
//!
//! Loaded once at startup. Defaults describe a single lot of twelve standard
//! bays numbered `1`..`12`, billed 20 per whole elapsed hour (partial hours
//! rounded down) with a one-hour minimum.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

use crate::codec::{IntegrityKey, KeyError, TicketCodec};
use crate::engine::{AllocationEngine, DEFAULT_MAX_RESERVE_ATTEMPTS};
use crate::fee::{Amount, RateTable, Rounding};
use crate::registry::{FallbackPolicy, RegistryError, SlotRegistry};
use crate::slot::{SlotClass, SlotId};
use crate::store::TicketStore;
use crate::transport::ServerConfig;

pub const ENV_SECRET_KEY: &str = "PARKLET_SECRET_KEY";
pub const ENV_HOST: &str = "PARKLET_HOST";
pub const ENV_PORT: &str = "PARKLET_PORT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("inventory is empty")]
    EmptyInventory,
    #[error("inventory group {0} has neither ids nor a positive count")]
    EmptyGroup(usize),
    #[error("slot id {0} is configured more than once")]
    DuplicateSlot(SlotId),
    #[error("no rate configured for {0} slots")]
    MissingRate(SlotClass),
    #[error("fees.unit_secs must be positive")]
    ZeroBillingUnit,
    #[error("allocation.max_reserve_attempts must be at least 1")]
    ZeroReserveAttempts,
    #[error("secret_key is not url-safe base64: {0}")]
    InvalidSecret(String),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("{var}={value:?} is not valid")]
    InvalidOverride { var: &'static str, value: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    pub fallback: FallbackPolicy,
    pub max_reserve_attempts: usize,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            fallback: FallbackPolicy::NextLarger,
            max_reserve_attempts: DEFAULT_MAX_RESERVE_ATTEMPTS,
        }
    }
}

/// A run of slots sharing a class: either explicit ids or `count` numbered ids.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InventoryGroup {
    pub class: SlotClass,
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub ids: Vec<String>,
}

impl InventoryGroup {
    fn slot_ids(&self) -> Vec<SlotId> {
        if !self.ids.is_empty() {
            return self.ids.iter().map(|id| SlotId::new(id.as_str())).collect();
        }
        (1..=self.count.unwrap_or(0))
            .map(|n| SlotId::new(format!("{}{n}", self.prefix)))
            .collect()
    }
}

/// Rate per billing unit for each class, in minor currency units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassRates {
    pub compact: Option<u64>,
    pub standard: Option<u64>,
    pub oversized: Option<u64>,
}

impl ClassRates {
    pub fn get(&self, class: SlotClass) -> Option<u64> {
        match class {
            SlotClass::Compact => self.compact,
            SlotClass::Standard => self.standard,
            SlotClass::Oversized => self.oversized,
        }
    }

    fn configured(&self) -> impl Iterator<Item = (SlotClass, u64)> + '_ {
        SlotClass::ALL
            .into_iter()
            .filter_map(|class| self.get(class).map(|rate| (class, rate)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FeeSchedule {
    pub unit_secs: u64,
    pub minimum_units: u64,
    pub rounding: Rounding,
    pub rates: ClassRates,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            unit_secs: RateTable::DEFAULT_UNIT.as_secs(),
            minimum_units: 1,
            rounding: Rounding::Down,
            rates: ClassRates {
                standard: Some(20),
                ..ClassRates::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ParkletConfig {
    /// URL-safe base64 secret for payload tags. Random per process when absent.
    pub secret_key: Option<String>,
    /// Deployment label reported by the health check.
    pub site: Option<String>,
    pub server: ServerConfig,
    pub allocation: AllocationConfig,
    pub inventory: Vec<InventoryGroup>,
    pub fees: FeeSchedule,
}

impl Default for ParkletConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            site: None,
            server: ServerConfig::default(),
            allocation: AllocationConfig::default(),
            inventory: vec![InventoryGroup {
                class: SlotClass::Standard,
                count: Some(12),
                prefix: String::new(),
                ids: Vec::new(),
            }],
            fees: FeeSchedule::default(),
        }
    }
}

impl ParkletConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Apply `PARKLET_*` overrides looked up through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(secret) = lookup(ENV_SECRET_KEY) {
            self.secret_key = Some(secret);
        }
        if let Some(host) = lookup(ENV_HOST) {
            self.server.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = port.trim().parse().map_err(|_| ConfigError::InvalidOverride {
                var: ENV_PORT,
                value: port.clone(),
            })?;
        }
        Ok(())
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allocation.max_reserve_attempts == 0 {
            return Err(ConfigError::ZeroReserveAttempts);
        }
        self.slots()?;
        self.rate_table()?;
        if let Some(secret) = &self.secret_key {
            decode_secret(secret)?;
        }
        Ok(())
    }

    /// Every configured slot, in inventory order.
    pub fn slots(&self) -> Result<Vec<(SlotId, SlotClass)>, ConfigError> {
        if self.inventory.is_empty() {
            return Err(ConfigError::EmptyInventory);
        }

        let mut seen = HashSet::new();
        let mut slots = Vec::new();
        for (position, group) in self.inventory.iter().enumerate() {
            let ids = group.slot_ids();
            if ids.is_empty() {
                return Err(ConfigError::EmptyGroup(position));
            }
            for id in ids {
                if !seen.insert(id.clone()) {
                    return Err(ConfigError::DuplicateSlot(id));
                }
                slots.push((id, group.class));
            }
        }
        Ok(slots)
    }

    /// Rate table for the configured inventory.
    ///
    /// Classes with no slots fall back to the highest configured rate.
    pub fn rate_table(&self) -> Result<RateTable, ConfigError> {
        if self.fees.unit_secs == 0 {
            return Err(ConfigError::ZeroBillingUnit);
        }
        for group in &self.inventory {
            if self.fees.rates.get(group.class).is_none() {
                return Err(ConfigError::MissingRate(group.class));
            }
        }

        let highest = self.fees.rates.configured().map(|(_, rate)| rate).max().unwrap_or(0);
        let table = self.fees.rates.configured().fold(
            RateTable::uniform(Amount::new(highest)),
            |table, (class, rate)| table.with_rate(class, Amount::new(rate)),
        );
        Ok(table
            .with_unit(Duration::from_secs(self.fees.unit_secs))
            .with_minimum_units(self.fees.minimum_units)
            .with_rounding(self.fees.rounding))
    }

    pub fn integrity_key(&self) -> Result<IntegrityKey, ConfigError> {
        match &self.secret_key {
            Some(secret) => Ok(IntegrityKey::from_secret(&decode_secret(secret)?)?),
            None => {
                tracing::warn!(
                    "No secret_key configured, generating an ephemeral key; issued tickets will not verify after restart"
                );
                Ok(IntegrityKey::generate()?)
            }
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        self.server.clone()
    }

    /// Validate and assemble a fresh engine with every slot Free.
    pub fn build_engine(&self) -> Result<AllocationEngine, ConfigError> {
        self.validate()?;
        let registry = SlotRegistry::new(self.slots()?, self.allocation.fallback)?;
        let engine = AllocationEngine::new(
            Arc::new(registry),
            Arc::new(TicketStore::new()),
            TicketCodec::new(self.integrity_key()?),
            Arc::new(self.rate_table()?),
        )
        .with_max_reserve_attempts(self.allocation.max_reserve_attempts);

        tracing::info!(
            slots = engine.registry().len(),
            fallback = ?self.allocation.fallback,
            "Engine configured"
        );
        Ok(engine)
    }
}

fn decode_secret(secret: &str) -> Result<Vec<u8>, ConfigError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(secret.trim().trim_end_matches('='))
        .map_err(|e| ConfigError::InvalidSecret(e.to_string()))?;
    if bytes.len() < crate::codec::MIN_SECRET_LEN {
        return Err(KeyError::TooShort(bytes.len()).into());
    }
    Ok(bytes)
}
