//! Configuration management with profile support.
//!
//! Provides centralized configuration for all bot parameters with
//! support for different profiles (default, devnet, aggressive).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure containing all bot parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    /// Scan and recheck cadences
    #[serde(default)]
    pub scanner: ScannerConfig,

    /// Liquidation execution parameters
    #[serde(default)]
    pub liquidation: LiquidationConfig,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// Scanner timing and fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Full-population rescan interval (seconds)
    #[serde(default = "default_full_scan_interval")]
    pub full_scan_interval_secs: u64,

    /// At-risk recheck interval (milliseconds)
    #[serde(default = "default_at_risk_interval")]
    pub at_risk_interval_ms: u64,

    /// Concurrent deadline-assignment transactions during a scan
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,

    /// Keep running at-risk passes while a full scan is in flight
    #[serde(default)]
    pub background_full_scan: bool,

    /// Warn about oracle feeds silent for longer than this (seconds)
    #[serde(default = "default_stale_price_warn")]
    pub stale_price_warn_secs: u64,
}

fn default_full_scan_interval() -> u64 {
    40 * 60
}
fn default_at_risk_interval() -> u64 {
    5_000
}
fn default_scan_concurrency() -> usize {
    8
}
fn default_stale_price_warn() -> u64 {
    300
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            full_scan_interval_secs: default_full_scan_interval(),
            at_risk_interval_ms: default_at_risk_interval(),
            scan_concurrency: default_scan_concurrency(),
            background_full_scan: false,
            stale_price_warn_secs: default_stale_price_warn(),
        }
    }
}

impl ScannerConfig {
    pub fn full_scan_interval(&self) -> Duration {
        Duration::from_secs(self.full_scan_interval_secs)
    }
    pub fn at_risk_interval(&self) -> Duration {
        Duration::from_millis(self.at_risk_interval_ms)
    }
    pub fn stale_price_warn(&self) -> Duration {
        Duration::from_secs(self.stale_price_warn_secs)
    }
}

/// Liquidation execution parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationConfig {
    /// Share of the maximum liquidatable amount to request (per mille)
    #[serde(default = "default_amount_permille")]
    pub amount_permille: u64,

    /// Failed attempts before an account is dropped until the next full scan
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Concurrent liquidation attempts within one pass. Attempts running
    /// side by side size their repayment from the same cached stable balance,
    /// so above 1 a later attempt may request more than the wallet still holds
    /// and fail on submission.
    #[serde(default = "default_liquidation_concurrency")]
    pub liquidation_concurrency: usize,

    /// Warn at startup if the stable balance is below this (raw units)
    #[serde(default = "default_min_stable_balance")]
    pub min_stable_balance: u64,

    /// Build and log transactions without submitting them
    #[serde(default)]
    pub dry_run: bool,

    /// Compute-unit price in micro-lamports (0 = none)
    #[serde(default)]
    pub priority_fee_micro_lamports: u64,
}

fn default_amount_permille() -> u64 {
    999
}
fn default_max_attempts() -> u32 {
    5
}
fn default_liquidation_concurrency() -> usize {
    1
}
fn default_min_stable_balance() -> u64 {
    // One whole stable unit
    1_000_000
}

impl Default for LiquidationConfig {
    fn default() -> Self {
        Self {
            amount_permille: default_amount_permille(),
            max_attempts: default_max_attempts(),
            liquidation_concurrency: default_liquidation_concurrency(),
            min_stable_balance: default_min_stable_balance(),
            dry_run: false,
            priority_fee_micro_lamports: 0,
        }
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            scanner: ScannerConfig::default(),
            liquidation: LiquidationConfig::default(),
        }
    }
}

impl BotConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Devnet profile: frequent scans, dry run, small balances tolerated.
    pub fn devnet() -> Self {
        Self {
            profile: "devnet".to_string(),
            scanner: ScannerConfig {
                full_scan_interval_secs: 5 * 60,
                at_risk_interval_ms: 5_000,
                scan_concurrency: 4,
                background_full_scan: false,
                stale_price_warn_secs: 600,
            },
            liquidation: LiquidationConfig {
                dry_run: true,
                min_stable_balance: 0,
                ..Default::default()
            },
        }
    }

    /// Aggressive profile: tight recheck, concurrent attempts, priority fees.
    pub fn aggressive() -> Self {
        Self {
            profile: "aggressive".to_string(),
            scanner: ScannerConfig {
                full_scan_interval_secs: 10 * 60,
                at_risk_interval_ms: 1_000,
                scan_concurrency: 16,
                background_full_scan: true,
                stale_price_warn_secs: 60,
            },
            liquidation: LiquidationConfig {
                max_attempts: 10,
                liquidation_concurrency: 4,
                priority_fee_micro_lamports: 10_000,
                ..Default::default()
            },
        }
    }

    /// Get profile from environment variable BOT_PROFILE, or default.
    /// Supported values: default, devnet, aggressive
    pub fn from_env() -> Self {
        let profile = std::env::var("BOT_PROFILE").unwrap_or_else(|_| "default".to_string());
        Self::from_profile(&profile)
    }

    pub fn from_profile(profile: &str) -> Self {
        match profile.to_lowercase().as_str() {
            "devnet" | "dev" => Self::devnet(),
            "aggressive" | "aggro" => Self::aggressive(),
            _ => Self::default(),
        }
    }

    /// Load from the file named by BOT_CONFIG if set, otherwise from BOT_PROFILE.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var("BOT_CONFIG") {
            Ok(path) => Self::from_file(&path),
            Err(_) => Ok(Self::from_env()),
        }
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            (1..=1_000).contains(&self.liquidation.amount_permille),
            "liquidation.amount_permille must be between 1 and 1000"
        );
        anyhow::ensure!(
            self.scanner.scan_concurrency > 0,
            "scanner.scan_concurrency must be positive"
        );
        anyhow::ensure!(
            self.liquidation.liquidation_concurrency > 0,
            "liquidation.liquidation_concurrency must be positive"
        );
        anyhow::ensure!(
            self.scanner.at_risk_interval_ms > 0,
            "scanner.at_risk_interval_ms must be positive"
        );
        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Bot configuration loaded");
        tracing::info!(
            full_scan_secs = self.scanner.full_scan_interval_secs,
            at_risk_ms = self.scanner.at_risk_interval_ms,
            scan_concurrency = self.scanner.scan_concurrency,
            background_full_scan = self.scanner.background_full_scan,
            "Scanner timing"
        );
        tracing::info!(
            amount_permille = self.liquidation.amount_permille,
            max_attempts = self.liquidation.max_attempts,
            concurrency = self.liquidation.liquidation_concurrency,
            dry_run = self.liquidation.dry_run,
            priority_fee = self.liquidation.priority_fee_micro_lamports,
            "Liquidation parameters"
        );
    }
}

/// Global configuration holder using lazy initialization.
use std::sync::OnceLock;

static GLOBAL_CONFIG: OnceLock<BotConfig> = OnceLock::new();

/// Initialize global configuration.
pub fn init_config(config: BotConfig) {
    let _ = GLOBAL_CONFIG.set(config);
}

/// Get the global configuration, initializing from environment if needed.
pub fn config() -> &'static BotConfig {
    GLOBAL_CONFIG.get_or_init(BotConfig::from_env)
}
