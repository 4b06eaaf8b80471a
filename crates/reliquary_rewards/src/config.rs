//! # Configuration
//!
//! Engine settings and catalogue data, both loaded from TOML.
//!
//! ## Engine
//!
//! ```toml
//! unit_value = 100
//! lock_timeout_ms = 250
//! rng_seed = 42                  # omit for OS entropy
//! journal_path = "data/ledger.rlqj"
//!
//! [retry]
//! max_attempts = 3
//! initial_backoff_ms = 10
//! max_backoff_ms = 200
//! ```
//!
//! ## Catalogue
//!
//! ```toml
//! [[campaigns]]
//! id = 1
//! issuer_id = 9
//! starts_at = 0
//! ends_at = 4102444800000
//! emission_rates = { 1 = 60, 2 = 20, 3 = 10, 4 = 8, 5 = 2 }
//!
//! [[items]]
//! id = 101
//! campaign_id = 1
//! rarity = 1
//!
//! [[privileges]]
//! id = 1
//! campaign_id = 1
//! expires_at = 4102444800000
//! limit_execution_times = 100
//! requirements = [{ item_id = 101, amount = 5 }]
//!
//! [[block_lists]]
//! issuer_id = 9
//! users = [13]
//! ```
//!
//! Emission rates stay raw TOML until validated, so a non-numeric tier or
//! weight is reported as `InvalidEmissionTable` rather than a parse error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::retry::RetryPolicy;
use crate::types::{CampaignId, IssuerId, Item, Privilege, Timestamp, UserId};

fn read_file(path: &Path) -> EngineResult<String> {
    std::fs::read_to_string(path).map_err(|e| {
        EngineError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
    })
}

/// Engine settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minor currency units per draw.
    pub unit_value: u64,
    /// Bounded wait for a row lock, in milliseconds.
    pub lock_timeout_ms: u64,
    /// Bound of the post-commit event queue.
    pub event_capacity: usize,
    /// Fixed seed for reproducible draws. `None` seeds from the OS.
    pub rng_seed: Option<u64>,
    /// Enables the durable journal at this path.
    pub journal_path: Option<PathBuf>,
    /// Caller-level retry of transient failures.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            unit_value: 100,
            lock_timeout_ms: 250,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            rng_seed: None,
            journal_path: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Loads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the file is unreadable, malformed or invalid.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        Self::from_toml_str(&read_file(path.as_ref())?)
    }

    /// Parses and validates TOML text.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the text is malformed or invalid.
    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` naming the first bad field.
    pub fn validate(&self) -> EngineResult<()> {
        if self.unit_value == 0 {
            return Err(EngineError::InvalidConfig(
                "unit_value must be greater than zero".to_string(),
            ));
        }
        if self.lock_timeout_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "lock_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        self.retry.validate()
    }

    /// Lock timeout as a `Duration`.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// One campaign as written in the catalogue file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Campaign id.
    pub id: CampaignId,
    /// Owning issuer.
    pub issuer_id: IssuerId,
    /// Inclusive window start.
    #[serde(default)]
    pub starts_at: Timestamp,
    /// Exclusive window end.
    #[serde(default = "open_end")]
    pub ends_at: Timestamp,
    /// Tier to weight, unvalidated.
    pub emission_rates: toml::Table,
}

const fn open_end() -> Timestamp {
    Timestamp::MAX
}

/// Users an issuer refuses to serve.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockListConfig {
    /// Issuer owning the list.
    pub issuer_id: IssuerId,
    /// Blocked users.
    #[serde(default)]
    pub users: Vec<UserId>,
}

/// Catalogue file contents.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Campaigns.
    pub campaigns: Vec<CampaignConfig>,
    /// Items.
    pub items: Vec<Item>,
    /// Privileges.
    pub privileges: Vec<Privilege>,
    /// Issuer block lists.
    pub block_lists: Vec<BlockListConfig>,
}

impl CatalogConfig {
    /// Loads a TOML file. Semantic checks happen in
    /// [`StaticCatalog::from_config`](crate::catalog::StaticCatalog::from_config).
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the file is unreadable or malformed.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        Self::from_toml_str(&read_file(path.as_ref())?)
    }

    /// Parses TOML text.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the text is malformed.
    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        toml::from_str(text).map_err(|e| EngineError::InvalidConfig(e.to_string()))
    }
}
