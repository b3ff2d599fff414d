//! Offline validator for a model alias configuration file.
//!
//! Usage: `validate-aliases [--json] [PATH]`
//!
//! PATH defaults to `MODEL_ALIASES_PATH`, then `config/model-aliases.json`.
//! Exits with status 1 when the audit finds errors.

use anyhow::Context;
use model_relay::aliases::{audit, AliasResolver, AuditReport};
use model_relay::config::Config;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn print_report(path: &std::path::Path, hash: &str, report: &AuditReport) {
    println!("Configuration: {}", path.display());
    println!("Config hash:   {}", hash);
    println!("Entries:       {}", report.checked);

    for finding in &report.errors {
        println!("  ERROR   {}: {}", finding.alias, finding.message);
    }
    for finding in &report.warnings {
        println!("  WARNING {}: {}", finding.alias, finding.message);
    }

    if report.is_clean() {
        println!("OK ({} warning(s))", report.warnings.len());
    } else {
        println!(
            "FAILED ({} error(s), {} warning(s))",
            report.errors.len(),
            report.warnings.len()
        );
    }
}

fn run() -> anyhow::Result<bool> {
    let mut json = false;
    let mut path: Option<PathBuf> = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--json" => json = true,
            flag if flag.starts_with("--") => anyhow::bail!("Unknown flag: {}", flag),
            value => path = Some(PathBuf::from(value)),
        }
    }
    let path = match path {
        Some(path) => path,
        None => Config::from_env()?.aliases_path,
    };

    let resolver = AliasResolver::load(&path)
        .with_context(|| format!("Could not load {}", path.display()))?;
    let report = audit(&resolver.config());
    let hash = resolver.get_config_hash();
    tracing::info!(
        path = %path.display(),
        errors = report.errors.len(),
        warnings = report.warnings.len(),
        "Validated alias configuration"
    );

    if json {
        let output = serde_json::json!({
            "path": path.display().to_string(),
            "configHash": hash,
            "metadata": resolver.config_metadata(),
            "report": report,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_report(&path, &hash, &report);
    }
    Ok(report.is_clean())
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("validate-aliases: {:#}", e);
            std::process::exit(2);
        }
    }
}
