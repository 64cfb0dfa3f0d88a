//! OpenSASE WAF Adapter - Main Entry Point

use clap::Parser;
use sase_waf::{AdapterConfig, Args};
use sase_waf_engine::{SignatureEngine, WafConfig};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("OpenSASE WAF v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let config = AdapterConfig::from_args(&args)?;

    let waf_config = config
        .rule_files
        .iter()
        .fold(WafConfig::new(), |waf, pattern| waf.with_directives_from_file(pattern.as_str()));

    let engine = match SignatureEngine::from_config(&waf_config) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("Error while initializing WAF engine: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        rules = engine.ruleset().len(),
        mode = ?config.metadata_mode,
        path = %config.inspect_path,
        "WAF engine initialized"
    );

    sase_waf::serve(&config, Arc::new(engine)).await
}
