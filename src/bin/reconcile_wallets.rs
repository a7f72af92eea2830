//! Reports wallets whose balance disagrees with their ledger.

use clap::Parser;

use docnow_server::{config::Config, db, wallet};

#[derive(Debug, Parser)]
#[command(about = "Compare wallet balances with ledger sums")]
struct Args {
    /// Rewrite drifted balances to the ledger sum.
    #[arg(long)]
    fix: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let cfg = Config::from_env()?;
    let pool = db::connect_pg(&cfg.database_url).await?;

    let drifts = wallet::reconcile(&pool).await?;
    if drifts.is_empty() {
        tracing::info!("all wallets match their ledgers");
        return Ok(());
    }

    let mut fixed = 0usize;
    for d in &drifts {
        tracing::warn!(
            user_id = %d.user_id,
            balance = d.balance_paise,
            ledger = d.ledger_sum_paise,
            difference = d.difference(),
            "wallet drift"
        );
        if args.fix {
            if wallet::fix_drift(&pool, d).await? {
                fixed += 1;
            } else {
                tracing::error!(user_id = %d.user_id, "not fixed: negative ledger sum or balance moved");
            }
        }
    }

    tracing::info!(drifted = drifts.len(), fixed, "reconciliation finished");
    if !args.fix {
        println!("{} wallet(s) drifted; rerun with --fix to repair", drifts.len());
    }
    Ok(())
}
