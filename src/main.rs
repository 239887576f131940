use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mailhaul::cli::Cli;
use mailhaul::gmail_api::{read_client_secrets, Authenticator, CredentialManager, GmailClient};
use mailhaul::migrate::migrate;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = read_client_secrets(&cli.secrets)?;

    println!("Authenticating source account...");
    let src_auth = Authenticator::login(CredentialManager::for_account(
        config.clone(),
        &cli.token_dir,
        "src",
    ))
    .await
    .context("source account authentication failed")?;
    let src = GmailClient::new(Arc::new(src_auth));

    println!("Authenticating destination account...");
    let dst_auth = Authenticator::login(CredentialManager::for_account(
        config,
        &cli.token_dir,
        "dst",
    ))
    .await
    .context("destination account authentication failed")?;
    let dst = GmailClient::new(Arc::new(dst_auth));

    println!("Processing messages...");
    let report = migrate(
        &src,
        &dst,
        &cli.source_label,
        &cli.destination_label,
        cli.query.as_deref(),
    )
    .await
    .context("migration failed")?;

    println!(
        "{} / {} messages migrated",
        report.processed, report.expected
    );
    if !report.failed.is_empty() {
        println!("{} messages could not be migrated:", report.failed.len());
        for failure in &report.failed {
            println!("  {}: {}", failure.id, failure.reason);
        }
    }
    println!("Done!");
    Ok(())
}
