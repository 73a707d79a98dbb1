use chrono::{DateTime, Local};
use std::fmt::Display;

use crate::error::Result;

/// Explicit execution context handed to every stage runner.
pub struct RunContext<'a> {
    pub run_id: String,
    pub started: DateTime<Local>,
    progress: &'a dyn Fn(f64, &str),
}

impl<'a> RunContext<'a> {
    pub fn new(progress: &'a dyn Fn(f64, &str)) -> Self {
        let started = Local::now();
        RunContext {
            run_id: started.format("%Y%m%d%H%M%S").to_string(),
            started,
            progress,
        }
    }

    pub fn progress(&self, fraction: f64, message: &str) {
        (self.progress)(fraction, message);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

/// Process each item independently. Per-item failures are logged and skipped;
/// run-level failures abort immediately.
pub fn run_items<T, L, F>(
    ctx: &RunContext<'_>,
    stage: &str,
    items: &[T],
    label: L,
    mut process: F,
) -> Result<BatchOutcome>
where
    L: Fn(&T) -> String,
    F: FnMut(&T) -> Result<()>,
{
    let mut outcome = BatchOutcome::default();
    let total = items.len();
    for (i, item) in items.iter().enumerate() {
        match process(item) {
            Ok(()) => outcome.succeeded += 1,
            Err(e) if e.is_run_fatal() => {
                log::error!("[{}] {stage}: aborting run at {}: {e}", ctx.run_id, label(item));
                return Err(e);
            }
            Err(e) => {
                log::error!("[{}] {stage}: failed on {}: {e}", ctx.run_id, label(item));
                outcome.failed += 1;
            }
        }
        ctx.progress(
            (i + 1) as f64 / total as f64,
            &format!("{stage} {}/{}", i + 1, total),
        );
    }
    log::info!(
        "[{}] {stage}: {} succeeded, {} failed",
        ctx.run_id,
        outcome.succeeded,
        outcome.failed
    );
    Ok(outcome)
}

pub fn display_label<T: Display>(item: &T) -> String {
    item.to_string()
}
