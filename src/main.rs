//! Synthetic exchange liquidation agent
//!
//! Watches every margin account of a synthetic-asset exchange on Solana and
//! liquidates undercollateralized ones once their liquidation deadline slot
//! has passed.
//! Features:
//! - Periodic full scan with on-chain deadline assignment
//! - Frequent deadline-ordered recheck of at-risk accounts
//! - Oracle prices and exchange state mirrored through websocket subscriptions
//! - Price refresh, approval and liquidation batched into one transaction

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use liquidator_chain::{RpcChainClient, TransactionSender};
use liquidator_core::{config, init_config, BotConfig, Deployment, Scheduler};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,liquidator_core=debug,liquidator_chain=debug")
            }),
        )
        .init();

    // BOT_CONFIG names a TOML file, otherwise BOT_PROFILE selects a profile
    let bot_config = BotConfig::load()?;
    bot_config.log_config();
    init_config(bot_config);

    info!("Starting synthetic exchange liquidation agent");

    let deployment = Deployment::from_env().context("loading deployment")?;
    deployment.log_config();

    let chain = Arc::new(
        RpcChainClient::connect(&deployment.rpc_url, &deployment.ws_url, deployment.commitment)
            .await
            .context("connecting to cluster")?,
    );

    let sender = Arc::new(
        TransactionSender::from_file(chain.clone(), &deployment.keypair_path)?
            .with_priority_fee(config().liquidation.priority_fee_micro_lamports),
    );
    info!(wallet = %sender.pubkey(), "Liquidator wallet loaded");

    info!("Bootstrapping...");
    let scheduler =
        Scheduler::bootstrap(chain, sender, deployment.exchange, config().clone()).await?;

    info!("Starting main loop...");
    tokio::select! {
        result = scheduler.run() => {
            if let Err(e) = &result {
                error!(error = format!("{e:#}"), "Scheduler stopped");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            Ok(())
        }
    }
}
