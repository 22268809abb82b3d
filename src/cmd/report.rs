//! Human and JSON renderings of a [`RunReport`].

use std::io::{self, Write};
use std::path::Path;

use crossterm::style::{self, Stylize};
use serde::Serialize;

use crate::patcher::PatchOutcome;
use crate::pipeline::{Outcome, RehomingResult, RunReport, Stage};
use crate::reference::ImageReference;

#[derive(Serialize)]
struct JsonReport<'a> {
    stage: Stage,
    failed: bool,
    manifests: Vec<JsonManifest<'a>>,
    results: Vec<&'a RehomingResult>,
    warnings: Vec<JsonWarning<'a>>,
    errors: Vec<JsonScanError<'a>>,
}

#[derive(Serialize)]
struct JsonManifest<'a> {
    path: &'a Path,
    references: Vec<JsonOccurrence<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    patch: Option<&'a PatchOutcome>,
}

#[derive(Serialize)]
struct JsonOccurrence<'a> {
    reference: &'a ImageReference,
    offset: usize,
    length: usize,
}

#[derive(Serialize)]
struct JsonWarning<'a> {
    path: &'a Path,
    offset: usize,
    token: &'a str,
    reason: &'static str,
}

#[derive(Serialize)]
struct JsonScanError<'a> {
    path: &'a Path,
    error: String,
}

pub fn to_json(report: &RunReport) -> serde_json::Result<String> {
    let discovery = &report.discovery;
    let manifests = discovery
        .registry
        .by_manifest()
        .into_iter()
        .map(|(path, occurrences)| JsonManifest {
            path,
            references: occurrences
                .into_iter()
                .map(|(occurrence, reference)| JsonOccurrence {
                    reference,
                    offset: occurrence.byte_offset,
                    length: occurrence.byte_length,
                })
                .collect(),
            patch: report.patches.get(path),
        })
        .collect();

    let json = JsonReport {
        stage: report.stage,
        failed: report.has_failures(),
        manifests,
        results: report.ordered_results(),
        warnings: discovery
            .warnings
            .iter()
            .map(|warning| JsonWarning {
                path: &warning.occurrence.manifest_path,
                offset: warning.occurrence.byte_offset,
                token: &warning.token,
                reason: warning.error.reason(),
            })
            .collect(),
        errors: discovery
            .errors
            .iter()
            .map(|err| JsonScanError {
                path: &err.path,
                error: err.cause.to_string(),
            })
            .collect(),
    };
    serde_json::to_string_pretty(&json)
}

/// Write the terminal report for `report` to `out`.
pub fn render(report: &RunReport, target_registry: &str, out: &mut impl Write) -> io::Result<()> {
    if report.stage == Stage::Scan {
        render_scan(report, out)?;
    } else {
        render_results(report, target_registry, out)?;
    }
    if report.stage == Stage::Patch {
        render_patches(report, out)?;
    }
    render_problems(report, out)?;
    render_summary(report, out)
}

fn render_scan(report: &RunReport, out: &mut impl Write) -> io::Result<()> {
    for (path, occurrences) in report.discovery.registry.by_manifest() {
        writeln!(out, "{}", style::style(path.display()).cyan())?;
        let mut seen: Vec<&ImageReference> = Vec::new();
        for (_, reference) in occurrences {
            if !seen.contains(&reference) {
                seen.push(reference);
                writeln!(out, "  {reference}")?;
            }
        }
    }
    Ok(())
}

fn render_results(report: &RunReport, target_registry: &str, out: &mut impl Write) -> io::Result<()> {
    for reference in report.discovery.registry.all_references() {
        let Some(result) = report.results.get(reference) else {
            writeln!(
                out,
                "{} {} {}",
                "-".dim(),
                reference,
                format!("(already on {target_registry})").dim()
            )?;
            continue;
        };

        let uses = report.discovery.registry.occurrences_of(reference).len();
        let uses = if uses > 1 {
            format!(" [{uses} uses]")
        } else {
            String::new()
        };

        match (&result.outcome, &result.error) {
            (Outcome::Failed, error) => {
                let reason = error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "failed".to_string());
                writeln!(out, "{} {}: {}", "✘".red(), result.source, reason)?;
            }
            (Outcome::Pulled, _) => {
                writeln!(out, "{} {} {}{}", "✔".green(), result.source, "(pulled)".dim(), uses.dim())?;
            }
            (outcome, _) => {
                let label = if *outcome == Outcome::Pushed { "(pushed)" } else { "(tagged)" };
                writeln!(
                    out,
                    "{} {} → {} {}{}",
                    "✔".green(),
                    result.source,
                    style::style(&result.target).cyan(),
                    label.dim(),
                    uses.dim()
                )?;
            }
        }
    }
    Ok(())
}

fn render_patches(report: &RunReport, out: &mut impl Write) -> io::Result<()> {
    if report.patches.is_empty() {
        return Ok(());
    }
    writeln!(out)?;
    for (path, outcome) in &report.patches {
        match outcome {
            PatchOutcome::Patched { replaced, skipped } => writeln!(
                out,
                "{} {} ({replaced} replaced, {skipped} skipped)",
                "✔".green(),
                style::style(path.display()).cyan()
            )?,
            PatchOutcome::Skipped { skipped } => writeln!(
                out,
                "{} {} {}",
                "-".dim(),
                path.display(),
                format!("(unchanged, {skipped} skipped)").dim()
            )?,
            PatchOutcome::Failed { error } => writeln!(out, "{} {}", "✘".red(), error)?,
        }
    }
    Ok(())
}

fn render_problems(report: &RunReport, out: &mut impl Write) -> io::Result<()> {
    let discovery = &report.discovery;
    if discovery.warnings.is_empty() && discovery.errors.is_empty() {
        return Ok(());
    }
    writeln!(out)?;
    for warning in &discovery.warnings {
        writeln!(
            out,
            "{} {}:{} {}: {}",
            "!".yellow().bold(),
            warning.occurrence.manifest_path.display(),
            warning.occurrence.byte_offset,
            warning.error.reason(),
            warning.token.as_str().dim()
        )?;
    }
    for err in &discovery.errors {
        writeln!(out, "{} {}", "✘".red(), err)?;
    }
    Ok(())
}

fn render_summary(report: &RunReport, out: &mut impl Write) -> io::Result<()> {
    let discovery = &report.discovery;
    let manifests = discovery.registry.by_manifest().len();
    let mut line = format!(
        "{} references in {} manifests",
        discovery.registry.len(),
        manifests
    );

    if report.stage > Stage::Scan {
        let failed = report.results.values().filter(|r| r.is_failed()).count();
        let done = report.results.len() - failed;
        let verb = match report.stage {
            Stage::Pull => "pulled",
            Stage::Tag => "tagged",
            _ => "pushed",
        };
        line.push_str(&format!(", {done} {verb}, {failed} failed"));
    }
    if report.stage == Stage::Patch {
        let patched = report
            .patches
            .values()
            .filter(|outcome| matches!(outcome, PatchOutcome::Patched { .. }))
            .count();
        line.push_str(&format!(", {patched} patched"));
    }
    if !discovery.warnings.is_empty() {
        line.push_str(&format!(", {} warnings", discovery.warnings.len()));
    }

    writeln!(out)?;
    writeln!(out, "{}", line.dim())
}
