mod client;
mod cmd;
mod config;
mod kustomize;
mod patcher;
mod pipeline;
mod progress;
mod reference;
mod references;
mod scanner;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use config::AppConfig;
use pipeline::Stage;

#[derive(Parser)]
#[command(name = "korp")]
#[command(about = "Mirror the container images used by Kubernetes manifests into a private registry")]
#[command(version)]
struct Cli {
    /// Output the report as JSON (optionally to a file)
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "-")]
    json: Option<String>,

    /// Container CLI used for pull/tag/push (docker, podman, nerdctl)
    #[arg(long, global = true, env = "KORP_RUNTIME")]
    runtime: Option<String>,

    /// Number of images processed at once
    #[arg(long, global = true, env = "KORP_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Process one image at a time
    #[arg(long, global = true)]
    sequential: bool,

    /// Push attempts per image before giving up
    #[arg(long, global = true, env = "KORP_RETRIES", default_value_t = 3)]
    retries: u32,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TargetArgs {
    /// Directory to scan for manifests
    #[arg(short, long, default_value = ".")]
    path: PathBuf,

    /// Target registry host
    #[arg(short, long, default_value = "docker.io")]
    registry: String,

    /// Also write a kustomization overlay to this file
    #[arg(long)]
    kustomize: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the image references found in manifests
    #[command(alias = "s")]
    Scan {
        /// Directory to scan for manifests
        #[arg(short, long, default_value = ".")]
        files: PathBuf,

        /// Registry used for a planned overlay
        #[arg(short, long, default_value = "docker.io")]
        registry: String,

        /// Write a planned kustomization overlay to this file
        #[arg(long)]
        kustomize: Option<PathBuf>,
    },

    /// Pull every referenced image
    #[command(alias = "p")]
    Pull(TargetArgs),

    /// Pull, retag and push every referenced image to the target registry
    #[command(alias = "u")]
    Push {
        #[command(flatten)]
        target: TargetArgs,

        /// Pull and tag only, never push
        #[arg(long)]
        dry_run: bool,
    },

    /// Push, then rewrite manifests to point at the target registry
    #[command(alias = "a")]
    Patch(TargetArgs),
}

impl Cli {
    fn into_config(self) -> AppConfig {
        let (stage, target) = match self.command {
            Commands::Scan {
                files,
                registry,
                kustomize,
            } => (
                Stage::Scan,
                TargetArgs {
                    path: files,
                    registry,
                    kustomize,
                },
            ),
            Commands::Pull(target) => (Stage::Pull, target),
            Commands::Push { target, dry_run } => {
                (if dry_run { Stage::Tag } else { Stage::Push }, target)
            }
            Commands::Patch(target) => (Stage::Patch, target),
        };

        AppConfig {
            stage,
            root: target.path,
            registry: target.registry,
            kustomize: target.kustomize,
            runtime: self.runtime,
            concurrency: self.concurrency,
            sequential: self.sequential,
            retries: self.retries,
            json: self.json,
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = cli.into_config().validate()?;
    let ok = cmd::rehome::run(config).await?;

    Ok(if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(args: &[&str]) -> AppConfig {
        Cli::try_parse_from(args).unwrap().into_config()
    }

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_commands_map_to_stages() {
        assert_eq!(config(&["korp", "scan"]).stage, Stage::Scan);
        assert_eq!(config(&["korp", "p"]).stage, Stage::Pull);
        assert_eq!(config(&["korp", "push"]).stage, Stage::Push);
        assert_eq!(config(&["korp", "push", "--dry-run"]).stage, Stage::Tag);
        assert_eq!(config(&["korp", "a"]).stage, Stage::Patch);
    }

    #[test]
    fn test_flags_reach_config() {
        let cfg = config(&[
            "korp",
            "patch",
            "-p",
            "deploy",
            "-r",
            "corp.example.com",
            "--kustomize",
            "overlay/kustomization.yaml",
            "--concurrency",
            "8",
            "--json",
        ]);
        assert_eq!(cfg.root, PathBuf::from("deploy"));
        assert_eq!(cfg.registry, "corp.example.com");
        assert_eq!(cfg.kustomize, Some(PathBuf::from("overlay/kustomization.yaml")));
        assert_eq!(cfg.concurrency, 8);
        assert_eq!(cfg.json.as_deref(), Some("-"));

        let cfg = config(&["korp", "scan", "-f", "manifests"]);
        assert_eq!(cfg.root, PathBuf::from("manifests"));
        assert_eq!(cfg.registry, "docker.io");
    }
}
