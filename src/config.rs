//! Per-invocation configuration.
//!
//! Built once in `main` from CLI flags (which also read `KORP_*` environment
//! variables) and handed to the command layer by value.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::pipeline::{BackoffPolicy, PipelineOptions, Stage};
use crate::reference;

/// Delay before the first push retry.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Longest delay between push retries.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// How far to drive the pipeline
    pub stage: Stage,
    /// Directory scanned for manifests
    pub root: PathBuf,
    /// Target registry host
    pub registry: String,
    /// Where to write a kustomization overlay, if anywhere
    pub kustomize: Option<PathBuf>,
    /// Container CLI; auto-detected when unset
    pub runtime: Option<String>,
    pub concurrency: usize,
    pub sequential: bool,
    /// Push attempts per image
    pub retries: u32,
    /// JSON report destination (`-` for stdout)
    pub json: Option<String>,
}

impl AppConfig {
    pub fn validate(self) -> Result<Self> {
        if self.concurrency == 0 {
            bail!("--concurrency must be at least 1");
        }
        if self.retries == 0 {
            bail!("--retries must be at least 1");
        }
        if let Err(err) = reference::validate_host(&self.registry) {
            bail!(
                "Invalid registry host '{}': {}. Pass a bare host such as corp.example.com or registry.local:5000.",
                self.registry,
                err.reason()
            );
        }
        if !self.root.is_dir() {
            bail!("{} is not a directory", self.root.display());
        }
        if let Some(runtime) = &self.runtime {
            if runtime.trim().is_empty() {
                bail!("--runtime must not be empty");
            }
        }
        Ok(self)
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            target_registry: reference::normalize_host(&self.registry),
            concurrency: self.concurrency,
            sequential: self.sequential,
            backoff: BackoffPolicy {
                max_attempts: self.retries,
                base: RETRY_BASE_DELAY,
                max: RETRY_MAX_DELAY,
            },
        }
    }

    /// Whether an overlay written by this run should include images that were
    /// pulled but not pushed.
    pub fn include_pulled(&self) -> bool {
        self.stage < Stage::Push
    }

    /// Whether human-oriented progress output belongs on the terminal.
    pub fn interactive(&self) -> bool {
        self.json.as_deref() != Some("-")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: PathBuf) -> AppConfig {
        AppConfig {
            stage: Stage::Push,
            root,
            registry: "Corp.Example.com".to_string(),
            kustomize: None,
            runtime: None,
            concurrency: 4,
            sequential: false,
            retries: 3,
            json: None,
        }
    }

    #[test]
    fn test_valid_config_maps_to_pipeline_options() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path().to_path_buf()).validate().unwrap();
        let options = cfg.pipeline_options();
        assert_eq!(options.target_registry, "corp.example.com");
        assert_eq!(options.backoff.max_attempts, 3);
        assert!(!cfg.include_pulled());
        assert!(cfg.interactive());
    }

    #[test]
    fn test_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        let mut cfg = config(root.clone());
        cfg.concurrency = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = config(root.clone());
        cfg.retries = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = config(root.clone());
        cfg.registry = "corp.example.com/mirror".to_string();
        assert!(cfg.validate().is_err());

        let cfg = config(root.join("missing"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_pull_overlays_include_pulled_images() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path().to_path_buf());
        cfg.stage = Stage::Pull;
        cfg.json = Some("-".to_string());
        assert!(cfg.include_pulled());
        assert!(!cfg.interactive());
    }

    #[test]
    fn test_hub_alias_target_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path().to_path_buf());
        cfg.registry = "Index.Docker.io".to_string();
        let options = cfg.validate().unwrap().pipeline_options();
        assert_eq!(options.target_registry, "docker.io");
    }
}
