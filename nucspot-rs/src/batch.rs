//! Batch sharding and the job request handed to the cluster scheduler.
//!
//! Nothing here executes work: it only shapes per-file items into
//! size-bounded batches and describes one command per batch.

use chrono::{DateTime, TimeZone};
use serde::Serialize;
use std::fmt::Display;
use std::fs;
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::paths;

/// One unit of per-file work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItem {
    /// A single source file.
    File { path: PathBuf },
    /// A glob selecting one z-stack.
    Pattern { glob: String },
    /// A source image together with one nuclear mask.
    ImageMask { image: PathBuf, mask: PathBuf },
}

impl WorkItem {
    /// Positional command-line arguments for this item.
    pub fn args(&self) -> Vec<String> {
        match self {
            WorkItem::File { path } => vec![path.display().to_string()],
            WorkItem::Pattern { glob } => vec![glob.clone()],
            WorkItem::ImageMask { image, mask } => {
                vec![image.display().to_string(), mask.display().to_string()]
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    pub index: usize,
    pub items: Vec<T>,
}

/// Contiguous, order-preserving chunks of at most `batch_size` items.
pub fn partition<T>(items: Vec<T>, batch_size: NonZeroUsize) -> Vec<Batch<T>> {
    let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size.get()));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        let chunk: Vec<T> = iter.by_ref().take(batch_size.get()).collect();
        batches.push(Batch {
            index: batches.len(),
            items: chunk,
        });
    }
    batches
}

/// `<job_kind>_<YYYYMMDDHHMMSS>`.
pub fn job_name<Tz: TimeZone>(job_kind: &str, run_time: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    format!("{job_kind}_{}", run_time.format("%Y%m%d%H%M%S"))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceProfile {
    pub memory_gb: f64,
    pub items_per_invocation: usize,
}

/// A structured command; rendered to a shell line only at the scheduler boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobCommand {
    pub program: String,
    pub args: Vec<String>,
}

fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r#"'"'"'"#))
    }
}

impl JobCommand {
    pub fn to_shell_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|w| shell_quote(w))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRequest {
    pub job_name: String,
    pub commands: Vec<JobCommand>,
    pub resources: ResourceProfile,
}

impl JobRequest {
    /// Build one command per batch: the stage's fixed arguments followed by
    /// every item's positional arguments.
    pub fn from_batches(
        job_name: String,
        program: &str,
        fixed_args: &[String],
        batches: &[Batch<WorkItem>],
        resources: ResourceProfile,
    ) -> Self {
        let commands = batches
            .iter()
            .map(|batch| JobCommand {
                program: program.to_string(),
                args: fixed_args
                    .iter()
                    .cloned()
                    .chain(batch.items.iter().flat_map(WorkItem::args))
                    .collect(),
            })
            .collect();
        JobRequest {
            job_name,
            commands,
            resources,
        }
    }

    /// Write `<job_name>.swarm` (one shell line per batch) and
    /// `<job_name>.json` into `log_dir`.
    pub fn write(&self, log_dir: &Path) -> Result<(PathBuf, PathBuf)> {
        paths::ensure_dir(log_dir)?;
        let swarm_path = log_dir.join(format!("{}.swarm", self.job_name));
        let mut swarm = fs::File::create(&swarm_path)?;
        for command in &self.commands {
            writeln!(swarm, "{}", command.to_shell_line())?;
        }
        let json_path = log_dir.join(format!("{}.json", self.job_name));
        fs::write(&json_path, serde_json::to_string_pretty(self)?)?;
        Ok((swarm_path, json_path))
    }
}
