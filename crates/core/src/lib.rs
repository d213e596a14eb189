//! Liquidator core logic.
//!
//! This crate provides the risk and orchestration side of the agent:
//! - Bot and deployment configuration
//! - Risk snapshots and account classification
//! - The deadline-ordered at-risk tracker
//! - Full-population risk scanning with deadline assignment
//! - Liquidation planning and execution
//! - Liquidator wallet provisioning
//! - The two-cadence scheduler

pub mod config;
mod deadline_tracker;
mod liquidator;
mod risk;
mod scanner;
mod scheduler;
mod wallet;

pub use config::{config, init_config, BotConfig, Deployment, LiquidationConfig, ScannerConfig};
pub use deadline_tracker::{
    AttemptGuard, Deadline, DeadlineTracker, MergeStats, RetryState, RiskEntry,
};
pub use liquidator::{
    plan_liquidation, LiquidationOutcome, LiquidationPlan, Liquidator, Plan, SkipReason,
};
pub use risk::{Classification, RiskSnapshot};
pub use scanner::{RiskScanner, ScanReport};
pub use scheduler::{Cadence, PassReport, Scheduler};
pub use wallet::LiquidatorWallet;
