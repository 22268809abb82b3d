use std::io;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use crossterm::style::{self, Stylize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::report;
use crate::client::cli::CliRegistryClient;
use crate::config::AppConfig;
use crate::kustomize;
use crate::patcher;
use crate::pipeline::{Pipeline, RunReport, Stage};
use crate::progress::Spinner;

/// Run one command end to end. Returns `false` when the run left failures behind.
pub async fn run(config: AppConfig) -> Result<bool> {
    let options = config.pipeline_options();
    let client = resolve_client(&config).await?;

    let spinner = Spinner::new(
        format!("Scanning {} ...", config.root.display()),
        config.interactive(),
    );
    let pipeline = Pipeline::builder(options.clone())
        .client(Arc::new(client))
        .progress(spinner.clone_bar())
        .build()?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling outstanding registry operations");
            trigger.cancel();
        }
    });

    let report = pipeline.run(&config.root, config.stage, &cancel).await;
    if report.discovery.registry.is_empty() {
        warn!("No image references found under {}", config.root.display());
    }
    spinner.finish(finish_message(&report, &options.target_registry));

    if let Some(path) = &config.kustomize {
        let overlay = if config.stage == Stage::Scan {
            kustomize::plan(&report.discovery.registry, &options.target_registry)
        } else {
            kustomize::generate(
                &report.discovery.registry,
                &report.results,
                config.include_pulled(),
            )
        };
        if overlay.is_empty() {
            warn!("Kustomization overlay has no images");
        }
        let yaml = overlay
            .to_yaml()
            .context("Failed to serialize kustomization")?;
        patcher::write_atomic(path, yaml.as_bytes())
            .with_context(|| format!("Failed to write kustomization to {}", path.display()))?;
        eprintln!(
            "{} Wrote {} ({} images)",
            "✔".green(),
            style::style(path.display()).cyan(),
            overlay.pairs.len()
        );
    }

    if let Some(dest) = config.json.as_deref() {
        let output = report::to_json(&report)?;
        if dest == "-" {
            println!("{output}");
        } else {
            std::fs::write(dest, &output)
                .with_context(|| format!("Failed to write JSON to {dest}"))?;
            eprintln!("{} Wrote {dest}", "✔".green());
        }
    } else {
        report::render(&report, &options.target_registry, &mut io::stdout().lock())?;
    }

    Ok(!report.has_failures())
}

/// Container CLI for the registry phase. Scans never invoke it.
async fn resolve_client(config: &AppConfig) -> Result<CliRegistryClient> {
    let program = match (&config.runtime, config.stage) {
        (Some(runtime), _) => runtime.clone(),
        (None, Stage::Scan) => "docker".to_string(),
        (None, _) => match CliRegistryClient::detect().await {
            Some(program) => program.to_string(),
            None => bail!(
                "No container runtime detected. Install Docker or Podman, or pass --runtime."
            ),
        },
    };
    let client = CliRegistryClient::new(program);
    if config.stage > Stage::Scan {
        info!(runtime = client.program(), "Using container runtime");
    }
    Ok(client)
}

fn finish_message(report: &RunReport, target_registry: &str) -> String {
    let found = report.discovery.registry.len();
    if report.stage == Stage::Scan {
        return format!("Found {found} image references");
    }
    let failed = report.results.values().filter(|r| r.is_failed()).count();
    format!(
        "Rehomed {}/{} references to {target_registry}",
        report.results.len() - failed,
        report.results.len()
    )
}
