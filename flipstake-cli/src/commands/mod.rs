use crate::config::{parse_network, CliConfig, VAULT_KEY_ENV};
use anyhow::{Context, Result};
use bitcoin::Amount;
use comfy_table::{presets::UTF8_FULL, Table};
use dialoguer::{Confirm, Password};
use flipstake_core::{
    FailoverNetwork, FlipstakeError, PassphraseVault, SecretVault, SettlementLeg, Side, Storage,
};
use flipstake_engine::{CompositeAuditSink, WagerLifecycleCoordinator};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const DATABASE_FILE: &str = "flipstake.db";

/// Stands in for the real vault on commands that never touch escrow keys.
struct ReadOnlyVault;

impl SecretVault for ReadOnlyVault {
    fn encrypt(&self, _plaintext: &[u8]) -> flipstake_core::Result<Vec<u8>> {
        Err(FlipstakeError::vault("vault is locked for this command"))
    }

    fn decrypt(&self, _ciphertext: &[u8]) -> flipstake_core::Result<flipstake_core::EscrowSecret> {
        Err(FlipstakeError::vault("vault is locked for this command"))
    }
}

fn unlock_vault() -> Result<Arc<dyn SecretVault>> {
    let passphrase = match std::env::var(VAULT_KEY_ENV) {
        Ok(key) if !key.is_empty() => key,
        _ => Password::new()
            .with_prompt("Vault passphrase")
            .interact()
            .context("Failed to read vault passphrase")?,
    };
    Ok(Arc::new(PassphraseVault::new(passphrase)?))
}

async fn open_engine(data_dir: &Path, unlock: bool) -> Result<WagerLifecycleCoordinator> {
    let config = CliConfig::load(data_dir)?;
    let storage = Arc::new(Storage::new(&data_dir.join(DATABASE_FILE)).await?);
    let network = Arc::new(FailoverNetwork::from_config(&config.engine)?);
    let audit = Arc::new(CompositeAuditSink::standard(storage.clone()));
    let vault = if unlock {
        unlock_vault()?
    } else {
        Arc::new(ReadOnlyVault) as Arc<dyn SecretVault>
    };

    Ok(WagerLifecycleCoordinator::new(
        config.engine,
        storage,
        network,
        vault,
        audit,
    )?)
}

pub async fn init(
    data_dir: &Path,
    network: &str,
    treasury: &str,
    esplora_urls: Vec<String>,
) -> Result<()> {
    let network = parse_network(network)?;
    let mut config = CliConfig::new(network, treasury);
    if !esplora_urls.is_empty() {
        config.engine.esplora_urls = esplora_urls;
    }
    config.save(data_dir)?;

    println!("✅ Configuration written to {}", CliConfig::path(data_dir).display());
    println!("Network: {}", network);
    for (i, url) in config.engine.esplora_urls.iter().enumerate() {
        let role = if i == 0 { "primary" } else { "fallback" };
        println!("Esplora ({}): {}", role, url);
    }
    println!("Treasury: {}", config.engine.treasury_address);
    println!(
        "Participant fee: {} sat",
        config.engine.participant_fee.to_sat()
    );
    println!("Set {} to avoid the passphrase prompt", VAULT_KEY_ENV);
    Ok(())
}

pub async fn create_wager(
    data_dir: &Path,
    side: Side,
    amount: u64,
    payout_address: &str,
) -> Result<()> {
    let engine = open_engine(data_dir, true).await?;
    let created = engine
        .create_wager(side, Amount::from_sat(amount), payout_address)
        .await?;

    println!("🎲 Wager created!");
    println!("Wager ID: {}", created.wager_id);
    println!("Your side: {}", created.side);
    println!("Stake: {} sat", created.stake.to_sat());
    println!();
    println!(
        "Deposit exactly {} sat from {} to:",
        created.expected_deposit.to_sat(),
        payout_address
    );
    println!("  {}", created.escrow_address);
    println!();
    println!("Then run: flipstake confirm-creator {} <txid>", created.wager_id);
    Ok(())
}

pub async fn confirm_creator(data_dir: &Path, wager_id: &str, signature: &str) -> Result<()> {
    let engine = open_engine(data_dir, false).await?;
    let status = engine.confirm_creator_deposit(wager_id, signature).await?;

    println!("✅ Deposit confirmed for {}", status.wager_id);
    println!("Status: {}", status.status);
    println!("The wager is now listed for acceptance.");
    Ok(())
}

pub async fn accept(data_dir: &Path, wager_id: &str, payout_address: &str) -> Result<()> {
    let engine = open_engine(data_dir, true).await?;
    let ticket = engine.begin_accept(wager_id, payout_address).await?;
    let timeout = engine.config().abandon_timeout.as_secs();

    println!("🤝 Claimed wager {}", ticket.wager_id);
    println!("Your side: {}", ticket.side);
    println!(
        "Deposit exactly {} sat from {} to:",
        ticket.expected_deposit.to_sat(),
        payout_address
    );
    println!("  {}", ticket.escrow_address);
    println!();
    println!(
        "The claim is released if not confirmed within {} seconds.",
        timeout
    );
    println!("Then run: flipstake confirm-acceptor {} <txid>", ticket.wager_id);
    Ok(())
}

pub async fn confirm_acceptor(data_dir: &Path, wager_id: &str, signature: &str) -> Result<()> {
    let engine = open_engine(data_dir, true).await?;
    let outcome = engine.confirm_acceptor_deposit(wager_id, signature).await?;

    println!("🪙 The coin landed on {}!", outcome.side);
    println!("Winner: {} ({})", outcome.winner, outcome.winner_wallet);
    println!("Payout: {} sat", outcome.payout.to_sat());
    if let Some(signature) = &outcome.payout_signature {
        println!("Payout transaction: {}", signature);
    }
    println!(
        "Entropy: {} (height {})",
        outcome.entropy_token.value, outcome.entropy_token.height
    );
    println!(
        "Treasury received: {} sat",
        outcome.settlement.treasury_total.to_sat()
    );
    println!("Status: {}", outcome.status);
    Ok(())
}

pub async fn abandon(data_dir: &Path, wager_id: &str) -> Result<()> {
    let engine = open_engine(data_dir, false).await?;
    let result = engine.abandon_accept(wager_id).await?;

    println!("↩️  Claim on {} released", result.wager_id);
    println!("Status: {}", result.status);
    if result.flagged_for_recovery {
        println!("⚠️  The abandoned escrow holds funds and was flagged for recovery.");
    }
    Ok(())
}

pub async fn cancel(data_dir: &Path, wager_id: &str, yes: bool) -> Result<()> {
    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!("Cancel wager {} and refund the stake?", wager_id))
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            println!("Aborted.");
            return Ok(());
        }
    }

    let engine = open_engine(data_dir, true).await?;
    let result = engine.cancel(wager_id).await?;

    println!("🛑 Wager {} cancelled", result.wager_id);
    println!("Refunded: {} sat", result.refund_amount.to_sat());
    if let Some(signature) = &result.refund.refund_signature {
        println!("Refund transaction: {}", signature);
    }
    println!(
        "Treasury received: {} sat",
        result.refund.treasury_total.to_sat()
    );
    Ok(())
}

pub async fn show_status(data_dir: &Path, wager_id: &str) -> Result<()> {
    let engine = open_engine(data_dir, false).await?;
    let details = engine.get_wager(wager_id).await?;
    let wager = &details.wager;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec!["Field", "Value"]);
    table.add_row(vec!["Wager ID".to_string(), wager.id.clone()]);
    table.add_row(vec!["Status".to_string(), wager.status.to_string()]);
    table.add_row(vec![
        "Stake".to_string(),
        format!("{} sat", wager.stake.to_sat()),
    ]);
    table.add_row(vec![
        "Creator".to_string(),
        format!("{} ({})", wager.creator.wallet, wager.creator.side),
    ]);
    table.add_row(vec![
        "Creator escrow".to_string(),
        wager.creator_escrow.address.clone(),
    ]);
    table.add_row(vec![
        "Creator deposit".to_string(),
        wager.creator_deposit.clone().unwrap_or_else(|| "-".to_string()),
    ]);
    if let Some(acceptor) = &wager.acceptor {
        table.add_row(vec![
            "Acceptor".to_string(),
            format!("{} ({})", acceptor.wallet, acceptor.side),
        ]);
    }
    if let Some(escrow) = &wager.acceptor_escrow {
        table.add_row(vec!["Acceptor escrow".to_string(), escrow.address.clone()]);
    }
    if let Some(deposit) = &wager.acceptor_deposit {
        table.add_row(vec!["Acceptor deposit".to_string(), deposit.clone()]);
    }
    if let Some(outcome) = &details.outcome {
        table.add_row(vec!["Outcome".to_string(), outcome.side.to_string()]);
        table.add_row(vec!["Winner".to_string(), outcome.winner.to_string()]);
        table.add_row(vec!["Entropy".to_string(), outcome.entropy.value.clone()]);
    }
    table.add_row(vec![
        "Created".to_string(),
        wager.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    ]);
    println!("{table}");

    if !details.legs.is_empty() {
        println!();
        println!("{}", legs_table(&details.legs));
    }
    Ok(())
}

fn legs_table(legs: &[SettlementLeg]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["#", "Leg", "To", "Amount (sat)", "Status", "Transaction"]);

    for leg in legs {
        let outcome = match (&leg.signature, &leg.error) {
            (Some(sig), _) => sig.clone(),
            (None, Some(err)) => err.clone(),
            (None, None) => "-".to_string(),
        };
        table.add_row(vec![
            leg.seq.to_string(),
            leg.kind.as_str().to_string(),
            leg.to_address.clone(),
            leg.amount.to_sat().to_string(),
            leg.status.as_str().to_string(),
            outcome,
        ]);
    }
    table
}

pub async fn list_wagers(data_dir: &Path, limit: usize) -> Result<()> {
    let engine = open_engine(data_dir, false).await?;
    let wagers = engine.list_open_wagers(limit).await?;

    if wagers.is_empty() {
        println!("No wagers open for acceptance.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Wager ID", "Creator side", "Your side", "Stake (sat)", "Created"]);

    for wager in &wagers {
        table.add_row(vec![
            wager.id.clone(),
            wager.creator.side.to_string(),
            wager.creator.side.opposite().to_string(),
            wager.stake.to_sat().to_string(),
            wager.created_at.format("%Y-%m-%d %H:%M").to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn show_report(data_dir: &Path) -> Result<()> {
    let engine = open_engine(data_dir, false).await?;
    let report = engine.consistency_report().await?;

    println!("Escrows checked: {}", report.escrows_checked);

    if !report.inconsistencies.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL).set_header(vec![
            "Wager ID", "Status", "Role", "Escrow", "Expected", "Actual (sat)",
        ]);
        for finding in &report.inconsistencies {
            table.add_row(vec![
                finding.wager_id.clone(),
                finding
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "retired".to_string()),
                finding.role.to_string(),
                finding.escrow_address.clone(),
                finding.expected.to_string(),
                finding.actual.to_sat().to_string(),
            ]);
        }
        println!("{table}");
    }

    for wager_id in &report.pending_settlements {
        println!("⏳ Settlement pending: {}", wager_id);
    }
    for address in &report.unreachable {
        println!("❓ Balance unavailable: {}", address);
    }

    if report.is_clean() {
        println!("✅ All escrow balances match their wagers");
    }
    Ok(())
}

pub async fn verify(data_dir: &Path, wager_id: &str) -> Result<()> {
    let engine = open_engine(data_dir, false).await?;
    let verification = engine.verify_outcome(wager_id).await?;
    let outcome = &verification.outcome;

    println!("Entropy: {} (height {})", outcome.entropy.value, outcome.entropy.height);
    println!("Digest: {}", outcome.digest);
    println!("Side: {}", outcome.side);
    if verification.valid {
        println!("✅ Outcome recomputes from its entropy");
    } else {
        println!("❌ Outcome does not match its entropy");
    }
    Ok(())
}

pub async fn health(data_dir: &Path) -> Result<()> {
    let config = CliConfig::load(data_dir)?;
    let network = FailoverNetwork::from_config(&config.engine)?;
    let results = network
        .check_health(&config.engine.treasury_address)
        .await;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Endpoint", "Healthy", "Latency (ms)", "Circuit", "Error"]);
    for result in &results {
        table.add_row(vec![
            result.name.clone(),
            if result.healthy { "yes" } else { "no" }.to_string(),
            result.latency_ms.to_string(),
            result.state.to_string(),
            result.error.clone().unwrap_or_else(|| "-".to_string()),
        ]);
    }
    println!("{table}");

    let healthy = results.iter().filter(|r| r.healthy).count();
    println!("{}/{} endpoints healthy", healthy, results.len());
    if healthy == 0 {
        anyhow::bail!("no Esplora endpoint is reachable");
    }
    Ok(())
}

pub async fn reap(data_dir: &Path, watch: bool) -> Result<()> {
    let interval = CliConfig::load(data_dir)?.reaper_interval_secs;
    let engine = Arc::new(open_engine(data_dir, false).await?);

    if !watch {
        let released = engine.reap_stale_claims().await?;
        if released.is_empty() {
            println!("No stale claims.");
        }
        for wager_id in released {
            println!("↩️  Released stale claim on {}", wager_id);
        }
        return Ok(());
    }

    info!("Reaping stale claims every {}s", interval);
    let handle = engine.spawn_reaper(Duration::from_secs(interval.max(1)));
    tokio::signal::ctrl_c().await?;
    handle.abort();
    println!("Stopped.");
    Ok(())
}
