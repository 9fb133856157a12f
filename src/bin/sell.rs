/// One-shot sell: `sell <TOKEN> <PERCENT>`

use anyhow::{bail, Result};
use clap::Parser;
use colored::Colorize;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use disbelieve::config::Environment;
use disbelieve::core::constants::SOLSCAN_TX;
use disbelieve::core::types::TokenId;
use disbelieve::execution::{ExecutionGateway, TradeApiGateway, TradeOutcome};
use disbelieve::ingest::{await_confirmation, Confirmation, RpcLookup};

const CONFIRM_ATTEMPTS: u32 = 20;
const CONFIRM_DELAY: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(name = "sell", about = "Sell a percentage of the wallet's balance of a token")]
struct Args {
    /// Mint address of the token to sell
    token: TokenId,

    /// Percentage of the current balance to sell (0, 100]
    #[arg(value_parser = parse_percent)]
    percent: f64,
}

fn parse_percent(raw: &str) -> Result<f64, String> {
    let value: f64 = raw
        .trim()
        .trim_end_matches('%')
        .parse()
        .map_err(|_| format!("{:?} is not a number", raw))?;
    if value > 0.0 && value <= 100.0 {
        Ok(value)
    } else {
        Err(format!("{} is outside (0, 100]", value))
    }
}

async fn run(args: Args) -> Result<()> {
    let env = Environment::load()?;
    let lookup = RpcLookup::new(env.http_rpc_url.clone())?;
    let gateway = TradeApiGateway::new(env.trade_api.clone(), Arc::clone(&env.keypair), lookup.rpc_client())?;

    println!("Selling {}% of {} from {}", args.percent, args.token, env.wallet());

    let signature = match gateway.sell(&args.token, args.percent, env.settings.fee_sol).await? {
        TradeOutcome::Migrated => bail!("pool for {} is migrated, nothing to sell here", args.token),
        TradeOutcome::Submitted(signature) => signature,
    };
    println!("Sell transaction sent: {}/{}", SOLSCAN_TX, signature);

    match await_confirmation(&lookup, &signature, CONFIRM_ATTEMPTS, CONFIRM_DELAY).await {
        Confirmation::Confirmed => {
            println!("{}", format!("Sold {}% of {}", args.percent, args.token).green().bold());
            Ok(())
        }
        Confirmation::Failed => bail!("transaction {} failed on chain", signature),
        Confirmation::Unknown => bail!("could not confirm transaction {}", signature),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .compact()
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            println!("{}", format!("Sell failed: {:#}", e).red().bold());
            ExitCode::FAILURE
        }
    }
}
