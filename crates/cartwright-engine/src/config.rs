//! # Engine Configuration
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     CARTWRIGHT_DB_PATH=/var/lib/cartwright.db                          │
//! │     CARTWRIGHT_TX_MAX_ATTEMPTS=5                                       │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/cartwright/cartwright.toml (Linux)                       │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "cartwright.db"
//! max_connections = 5
//!
//! [transaction]
//! max_attempts = 3
//! initial_backoff_ms = 20
//! max_backoff_ms = 500
//!
//! [features]
//! sales_channels = true
//! partial_payment_sessions = false
//! authorization_timestamps = true
//!
//! [totals]
//! rounding = "half_up"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use cartwright_core::RoundingPolicy;
use cartwright_db::{DbConfig, TransactionOptions};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CartError, CartResult};

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("cartwright.db")
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Retry bounds for conflicting transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSettings {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    20
}
fn default_max_backoff() -> u64 {
    500
}

impl Default for TransactionSettings {
    fn default() -> Self {
        TransactionSettings {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

/// Optional behaviors, passed explicitly instead of looked up at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Reject variants whose product is not in the cart's sales channel.
    #[serde(default = "default_true")]
    pub sales_channels: bool,

    /// Sessions carry an explicit amount instead of always mirroring the
    /// cart total.
    #[serde(default)]
    pub partial_payment_sessions: bool,

    /// Stamp `payment_authorized_at` when a session becomes AUTHORIZED.
    #[serde(default = "default_true")]
    pub authorization_timestamps: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FeatureFlags {
    fn default() -> Self {
        FeatureFlags {
            sales_channels: true,
            partial_payment_sessions: false,
            authorization_timestamps: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalsSettings {
    #[serde(default)]
    pub rounding: RoundingPolicy,
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub transaction: TransactionSettings,

    #[serde(default)]
    pub features: FeatureFlags,

    #[serde(default)]
    pub totals: TotalsSettings,
}

impl EngineConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (cartwright.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> CartResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading engine config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| CartError::Config(format!("{}: {e}", path.display())))?;
                config = Self::from_toml(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load engine config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn from_toml(contents: &str) -> CartResult<Self> {
        toml::from_str(contents).map_err(|e| CartError::Config(e.to_string()))
    }

    pub fn validate(&self) -> CartResult<()> {
        if self.transaction.max_attempts == 0 {
            return Err(CartError::Config("transaction.max_attempts must be at least 1".into()));
        }
        if self.transaction.initial_backoff_ms > self.transaction.max_backoff_ms {
            return Err(CartError::Config(
                "transaction.initial_backoff_ms must not exceed max_backoff_ms".into(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(CartError::Config("database.max_connections must be greater than 0".into()));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("CARTWRIGHT_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Ok(value) = std::env::var("CARTWRIGHT_TX_MAX_ATTEMPTS") {
            match value.parse::<u32>() {
                Ok(n) => self.transaction.max_attempts = n,
                Err(_) => warn!(value = %value, "Ignoring invalid CARTWRIGHT_TX_MAX_ATTEMPTS"),
            }
        }

        if let Ok(value) = std::env::var("CARTWRIGHT_ROUNDING") {
            match value.to_lowercase().as_str() {
                "half_up" => self.totals.rounding = RoundingPolicy::HalfUp,
                "half_even" => self.totals.rounding = RoundingPolicy::HalfEven,
                "floor" => self.totals.rounding = RoundingPolicy::Floor,
                _ => warn!(value = %value, "Unknown rounding policy in environment"),
            }
        }

        if let Ok(value) = std::env::var("CARTWRIGHT_PARTIAL_PAYMENT_SESSIONS") {
            if let Ok(flag) = value.parse::<bool>() {
                self.features.partial_payment_sessions = flag;
            }
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "cartwright", "cartwright")
            .map(|dirs| dirs.config_dir().join("cartwright.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn transaction_options(&self) -> TransactionOptions {
        TransactionOptions {
            max_attempts: self.transaction.max_attempts,
            initial_backoff: Duration::from_millis(self.transaction.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.transaction.max_backoff_ms),
        }
    }

    pub fn db_config(&self) -> DbConfig {
        DbConfig::new(&self.database.path).max_connections(self.database.max_connections)
    }
}
