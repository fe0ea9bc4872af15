//! Step progress reporting and cancellation

use std::ops::ControlFlow;

use indicatif::{ProgressBar, ProgressStyle};

/// Reported after each completed timestep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepProgress {
    /// Current step (0-indexed)
    pub step: usize,
    pub total_steps: usize,
    /// Timestep that was just denoised
    pub timestep: usize,
}

impl StepProgress {
    pub fn completed(&self) -> usize {
        self.step + 1
    }
}

/// Observer that never cancels
pub fn no_progress(_: StepProgress) -> ControlFlow<()> {
    ControlFlow::Continue(())
}

/// Drives an `indicatif` progress bar from step reports
pub struct ProgressBarObserver {
    bar: ProgressBar,
}

impl ProgressBarObserver {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} steps {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        Self { bar }
    }

    /// A bar that draws nothing, for tests and non-interactive runs
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn bar(&self) -> &ProgressBar {
        &self.bar
    }

    /// Callback to hand to a pipeline run
    pub fn observer(&self) -> impl FnMut(StepProgress) -> ControlFlow<()> + '_ {
        move |progress| {
            self.bar.set_length(progress.total_steps as u64);
            self.bar.set_position(progress.completed() as u64);
            self.bar.set_message(format!("t={}", progress.timestep));
            if progress.completed() == progress.total_steps {
                self.bar.finish();
            }
            ControlFlow::Continue(())
        }
    }
}

impl Default for ProgressBarObserver {
    fn default() -> Self {
        Self::new()
    }
}
