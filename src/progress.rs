use std::time::Duration;

use crossterm::style::Stylize;
use indicatif::{ProgressBar, ProgressStyle};

/// A simple spinner for long-running stages.
pub struct Spinner {
    bar: ProgressBar,
}

impl Spinner {
    /// A ticking spinner, or a hidden one when output is not for a human.
    pub fn new(message: impl Into<String>, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(spinner_style());
        bar.set_message(message.into());
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    /// Handle for components that report their own progress.
    pub fn clone_bar(&self) -> ProgressBar {
        self.bar.clone()
    }

    /// Clear the spinner and print a `✔ message` line to stderr.
    pub fn finish(self, message: impl Into<String>) {
        let hidden = self.bar.is_hidden();
        self.bar.finish_and_clear();
        if !hidden {
            eprintln!("{} {}", "✔".green(), message.into());
        }
    }
}

/// Switch a spinner into a `pos/len` bar.
pub fn start_bar(bar: &ProgressBar, total: u64, message: impl Into<String>) {
    bar.set_length(total);
    bar.set_position(0);
    bar.set_message(message.into());
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.dim} {msg} [{bar:20}] {pos}/{len} ({elapsed_precise:.>5})",
        )
        .map(|style| {
            style
                .with_key(
                    "elapsed_precise",
                    |state: &indicatif::ProgressState, w: &mut dyn std::fmt::Write| {
                        let _ = write!(w, "{}s", state.elapsed().as_secs());
                    },
                )
                .progress_chars("━╸░")
        })
        .unwrap_or_else(|_| spinner_style()),
    );
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.dim} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}
