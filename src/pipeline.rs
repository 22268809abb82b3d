//! The image-rehoming pipeline.
//!
//! One [`Pipeline`] serves every command: `scan` stops after discovery, `pull`
//! after pulling, `push` after pushing and `patch` after rewriting manifests.
//! Discovery runs synchronously; only the registry phase uses a worker pool.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use indicatif::ProgressBar;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{RegistryClient, RegistryError};
use crate::patcher::{self, PatchOutcome};
use crate::progress;
use crate::reference::{self, ImageReference, ParseError};
use crate::references::{ReferenceOccurrence, ReferenceRegistry};
use crate::scanner::{self, FileLister, ScanError};

/// How far to drive the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Scan,
    Pull,
    /// Pull and tag locally, without pushing
    Tag,
    Push,
    Patch,
}

/// Furthest registry step a reference reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pulled,
    Tagged,
    Pushed,
    Failed,
}

/// What happened to one reference during a run.
#[derive(Debug, Clone, Serialize)]
pub struct RehomingResult {
    pub source: ImageReference,
    pub target: ImageReference,
    pub outcome: Outcome,
    /// Push attempts made (0 when push was never reached)
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RegistryError>,
}

impl RehomingResult {
    fn new(source: ImageReference, target: ImageReference) -> Self {
        Self {
            source,
            target,
            outcome: Outcome::Failed,
            attempts: 0,
            error: None,
        }
    }

    fn fail(mut self, error: RegistryError) -> Self {
        self.outcome = Outcome::Failed;
        self.error = Some(error);
        self
    }

    pub fn is_failed(&self) -> bool {
        self.outcome == Outcome::Failed
    }
}

pub type RehomingResults = HashMap<ImageReference, RehomingResult>;

/// Exponential backoff between push attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Total push attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
}

impl BackoffPolicy {
    /// Delay after the given failed attempt (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Per-invocation pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub target_registry: String,
    pub concurrency: usize,
    /// Force a worker pool of one
    pub sequential: bool,
    pub backoff: BackoffPolicy,
}

/// A token that was found but could not be parsed. Reported, never fatal.
#[derive(Debug)]
pub struct ParseWarning {
    pub occurrence: ReferenceOccurrence,
    pub token: String,
    pub error: ParseError,
}

/// Result of scanning a tree.
#[derive(Debug, Default)]
pub struct Discovery {
    pub registry: ReferenceRegistry,
    pub warnings: Vec<ParseWarning>,
    pub errors: Vec<ScanError>,
}

/// Everything a run produced, for reporting.
#[derive(Debug)]
pub struct RunReport {
    pub stage: Stage,
    pub discovery: Discovery,
    pub results: RehomingResults,
    pub patches: BTreeMap<PathBuf, PatchOutcome>,
}

impl RunReport {
    /// Any failure that should make the process exit non-zero.
    /// Parse warnings and skipped occurrences do not count.
    pub fn has_failures(&self) -> bool {
        !self.discovery.errors.is_empty()
            || self.results.values().any(RehomingResult::is_failed)
            || self
                .patches
                .values()
                .any(|outcome| matches!(outcome, PatchOutcome::Failed { .. }))
    }

    /// Results in the registry's first-seen order.
    pub fn ordered_results(&self) -> Vec<&RehomingResult> {
        self.discovery
            .registry
            .all_references()
            .into_iter()
            .filter_map(|reference| self.results.get(reference))
            .collect()
    }
}

pub struct Pipeline {
    lister: Box<dyn FileLister>,
    client: Arc<dyn RegistryClient>,
    options: PipelineOptions,
    progress: Option<ProgressBar>,
}

pub struct PipelineBuilder {
    lister: Option<Box<dyn FileLister>>,
    client: Option<Arc<dyn RegistryClient>>,
    options: PipelineOptions,
    progress: Option<ProgressBar>,
}

impl PipelineBuilder {
    pub fn lister(mut self, lister: impl FileLister + 'static) -> Self {
        self.lister = Some(Box::new(lister));
        self
    }

    pub fn client(mut self, client: Arc<dyn RegistryClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Progress bar advanced once per finished reference.
    pub fn progress(mut self, bar: ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    pub fn build(self) -> anyhow::Result<Pipeline> {
        Ok(Pipeline {
            lister: self
                .lister
                .unwrap_or_else(|| Box::new(scanner::WalkDirLister)),
            client: self
                .client
                .ok_or_else(|| anyhow::anyhow!("pipeline needs a registry client"))?,
            options: self.options,
            progress: self.progress,
        })
    }
}

impl Pipeline {
    pub fn builder(options: PipelineOptions) -> PipelineBuilder {
        PipelineBuilder {
            lister: None,
            client: None,
            options,
            progress: None,
        }
    }

    /// Drive the pipeline over `root` as far as `stage`.
    pub async fn run(&self, root: &Path, stage: Stage, cancel: &CancellationToken) -> RunReport {
        let discovery = self.discover(root);

        let mut results = RehomingResults::new();
        if stage > Stage::Scan {
            let references = discovery.registry.all_references();
            results = self.rehome(&references, stage, cancel).await;
        }

        let mut patches = BTreeMap::new();
        if stage == Stage::Patch {
            patches = patcher::patch(&discovery.registry, &results);
        }

        RunReport {
            stage,
            discovery,
            results,
            patches,
        }
    }

    /// Scan `root` and build the deduplicated reference registry.
    pub fn discover(&self, root: &Path) -> Discovery {
        let mut discovery = Discovery::default();

        for item in scanner::scan(self.lister.as_ref(), root) {
            let found = match item {
                Ok(found) => found,
                Err(err) => {
                    warn!(path = %err.path.display(), "Skipping unreadable manifest: {}", err.cause);
                    discovery.errors.push(err);
                    continue;
                }
            };

            let occurrence = ReferenceOccurrence {
                manifest_path: found.manifest_path,
                byte_offset: found.byte_offset,
                byte_length: found.byte_length,
                written_name: reference::written_name(&found.token).to_string(),
            };
            match ImageReference::parse(&found.token) {
                Ok(reference) => discovery.registry.register(occurrence, reference),
                Err(error) => {
                    warn!(
                        path = %occurrence.manifest_path.display(),
                        offset = occurrence.byte_offset,
                        token = %found.token,
                        "Skipping image reference: {}",
                        error.reason()
                    );
                    discovery.warnings.push(ParseWarning {
                        occurrence,
                        token: found.token,
                        error,
                    });
                }
            }
        }

        info!(
            references = discovery.registry.len(),
            warnings = discovery.warnings.len(),
            errors = discovery.errors.len(),
            "Scanned {}",
            root.display()
        );
        discovery
    }

    /// Pull (and, depending on `stage`, tag and push) every reference.
    ///
    /// Never fails as a whole: each reference gets its own result. References
    /// already hosted on the target registry are left out.
    pub async fn rehome(
        &self,
        references: &[&ImageReference],
        stage: Stage,
        cancel: &CancellationToken,
    ) -> RehomingResults {
        let target_registry = self.options.target_registry.as_str();
        let pending: Vec<&ImageReference> = references
            .iter()
            .copied()
            .filter(|reference| {
                let on_target = reference.registry == target_registry;
                if on_target {
                    debug!("{} is already on {}", reference, target_registry);
                }
                !on_target
            })
            .collect();

        let workers = if self.options.sequential || !self.client.supports_concurrency() {
            1
        } else {
            self.options.concurrency.max(1)
        };

        if let Some(bar) = &self.progress {
            progress::start_bar(bar, pending.len() as u64, format!("Rehoming to {target_registry}"));
        }
        info!(references = pending.len(), workers, "Rehoming to {}", target_registry);

        stream::iter(pending)
            .map(|reference| async move {
                let result = self.rehome_one(reference, stage, cancel).await;
                if let Some(bar) = &self.progress {
                    bar.inc(1);
                }
                result
            })
            .buffer_unordered(workers)
            .map(|result| (result.source.clone(), result))
            .collect()
            .await
    }

    async fn rehome_one(
        &self,
        source: &ImageReference,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> RehomingResult {
        let target = source.with_registry(&self.options.target_registry);
        let mut result = RehomingResult::new(source.clone(), target);
        let client = self.client.as_ref();

        if cancel.is_cancelled() {
            return result.fail(RegistryError::Cancelled);
        }

        if let Err(err) = cancellable(cancel, client.pull(source)).await {
            warn!("{}", err);
            return result.fail(err);
        }
        result.outcome = Outcome::Pulled;
        if stage < Stage::Tag {
            return result;
        }

        if let Err(err) = cancellable(cancel, client.tag(source, &result.target)).await {
            warn!("{}", err);
            return result.fail(err);
        }
        result.outcome = Outcome::Tagged;
        if stage < Stage::Push {
            return result;
        }

        let backoff = &self.options.backoff;
        loop {
            result.attempts += 1;
            match cancellable(cancel, client.push(&result.target)).await {
                Ok(()) => {
                    result.outcome = Outcome::Pushed;
                    debug!(attempts = result.attempts, "Pushed {}", result.target);
                    return result;
                }
                Err(err) if err.is_transient() && result.attempts < backoff.max_attempts => {
                    let delay = backoff.delay(result.attempts - 1);
                    warn!(
                        attempt = result.attempts,
                        "{}. Retrying in {:?}...", err, delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return result.fail(RegistryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    warn!(attempts = result.attempts, "{}", err);
                    return result.fail(err);
                }
            }
        }
    }
}

/// Run a registry operation unless cancellation arrives first.
async fn cancellable<F>(cancel: &CancellationToken, op: F) -> Result<(), RegistryError>
where
    F: Future<Output = Result<(), RegistryError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RegistryError::Cancelled),
        result = op => result,
    }
}
