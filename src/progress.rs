//! Progress indicators for hostwright runs
//!
//! One bar per host inside a shared [`MultiProgress`]. Each bar implements
//! [`ProgressCallback`] so the executor can drive it directly.

use declarative::{ApplyResult, ProgressCallback};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// Container for per-host bars
pub fn multi(quiet: bool) -> MultiProgress {
    if quiet {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    } else {
        MultiProgress::new()
    }
}

/// A spinner for single blocking steps (fact gathering, planning)
pub fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Progress of one host through its modules
pub struct HostProgress {
    bar: ProgressBar,
    host: String,
    failed: bool,
}

impl HostProgress {
    pub fn new(multi: &MultiProgress, host: &str) -> Self {
        let bar = multi.add(ProgressBar::new(0));
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} {prefix:.bold} [{bar:30.cyan/blue}] {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
        );
        bar.set_prefix(host.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));
        Self {
            bar,
            host: host.to_string(),
            failed: false,
        }
    }

    /// Show a transient status (connecting, gathering facts)
    pub fn status(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    /// Mark the host failed before any module ran
    pub fn fail(&mut self, message: &str) {
        self.failed = true;
        self.bar.set_message(message.to_string());
    }

    /// Stop the bar with a final message
    pub fn finish(&self) {
        let message = if self.failed { "failed" } else { "done" };
        self.bar.finish_with_message(message);
        log::debug!("{}: {}", self.host, message);
    }
}

impl ProgressCallback for HostProgress {
    fn on_module_start(&mut self, module: &str, operations: usize) {
        self.bar.inc_length(operations as u64);
        self.bar.set_message(module.to_string());
    }

    fn on_operation_start(&mut self, id: &str, _description: &str) {
        // handlers are not counted up front
        if self
            .bar
            .length()
            .is_some_and(|len| self.bar.position() >= len)
        {
            self.bar.inc_length(1);
        }
        self.bar.set_message(id.to_string());
    }

    fn on_operation_complete(&mut self, _id: &str, result: &ApplyResult) {
        if !result.is_success() {
            self.failed = true;
        }
        self.bar.inc(1);
    }

    fn on_module_complete(&mut self, module: &str, success: bool) {
        if !success {
            self.failed = true;
            self.bar.set_message(format!("{} failed", module));
        }
    }
}
