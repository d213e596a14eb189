//! Configuration for the liquidation agent.
//!
//! This module provides:
//! - Bot runtime configuration (profiles, cadences, liquidation parameters)
//! - Deployment configuration (endpoints, wallet, exchange addresses)

mod bot;
mod deployment;

pub use bot::{config, init_config, BotConfig, LiquidationConfig, ScannerConfig};
pub use deployment::{Deployment, DeploymentFile};
