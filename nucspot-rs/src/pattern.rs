//! Wildcard search over address-encoded file trees.

use glob::{MatchOptions, Pattern};
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::address::{Address, Field};
use crate::error::{PipelineError, Result};

/// A pattern field: either fixed or matching any value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot<T> {
    Any,
    Exact(T),
}

/// Search-only counterpart of [`Address`]. Never written to disk.
///
/// `suffix` and `extension` hold glob text, so overrides such as
/// `_nuclear_mask_???` are passed through as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPattern {
    pub experiment: Slot<String>,
    pub well: Slot<String>,
    pub well_separator: bool,
    pub t: Slot<Option<u32>>,
    pub f: Slot<Option<u32>>,
    pub l: Slot<Option<u32>>,
    pub a: Slot<Option<u32>>,
    pub z: Slot<Option<u32>>,
    pub c: Slot<Option<u32>>,
    pub suffix: Slot<String>,
    pub extension: Slot<String>,
}

/// Build a pattern from `addr`, wildcarding every field in `excluding`.
pub fn pattern_from(
    addr: &Address,
    excluding: &[Field],
    suffix_override: Option<&str>,
    extension_override: Option<&str>,
) -> AddressPattern {
    let mut pattern = AddressPattern::from_address(addr).excluding(excluding);
    if let Some(suffix) = suffix_override {
        pattern = pattern.with_suffix(suffix);
    }
    if let Some(extension) = extension_override {
        pattern = pattern.with_extension(extension);
    }
    pattern
}

impl AddressPattern {
    pub fn from_address(addr: &Address) -> Self {
        AddressPattern {
            experiment: Slot::Exact(addr.experiment.clone()),
            well: Slot::Exact(addr.well.clone()),
            well_separator: addr.well_separator,
            t: Slot::Exact(addr.t),
            f: Slot::Exact(addr.f),
            l: Slot::Exact(addr.l),
            a: Slot::Exact(addr.a),
            z: Slot::Exact(addr.z),
            c: Slot::Exact(addr.c),
            suffix: Slot::Exact(addr.suffix.to_string()),
            extension: Slot::Exact(addr.extension.clone()),
        }
    }

    pub fn excluding(mut self, fields: &[Field]) -> Self {
        for field in fields {
            match field {
                Field::Experiment => self.experiment = Slot::Any,
                Field::Well => self.well = Slot::Any,
                Field::T => self.t = Slot::Any,
                Field::F => self.f = Slot::Any,
                Field::L => self.l = Slot::Any,
                Field::A => self.a = Slot::Any,
                Field::Z => self.z = Slot::Any,
                Field::C => self.c = Slot::Any,
            }
        }
        self
    }

    pub fn with_suffix(mut self, suffix: &str) -> Self {
        self.suffix = Slot::Exact(suffix.to_string());
        self
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = Slot::Exact(extension.to_string());
        self
    }

    fn numeric(&self, field: Field) -> Option<&Slot<Option<u32>>> {
        match field {
            Field::T => Some(&self.t),
            Field::F => Some(&self.f),
            Field::L => Some(&self.l),
            Field::A => Some(&self.a),
            Field::Z => Some(&self.z),
            Field::C => Some(&self.c),
            Field::Experiment | Field::Well => None,
        }
    }

    pub fn glob(&self) -> Result<Glob> {
        Glob::new(&self.to_string())
    }
}

impl fmt::Display for AddressPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = |slot: &Slot<String>| match slot {
            Slot::Any => "*".to_string(),
            Slot::Exact(s) => s.clone(),
        };
        write!(f, "{}_{}", text(&self.experiment), text(&self.well))?;
        if self.well_separator {
            write!(f, "_")?;
        }
        for field in Field::NUMERIC {
            let (Some(letter), Some(width), Some(slot)) = (field.letter(), field.width(), self.numeric(field)) else {
                continue;
            };
            // Wildcards span the exact digit width so neighbouring tokens cannot bleed in.
            match slot {
                Slot::Any => write!(f, "{letter}{}", "?".repeat(width))?,
                Slot::Exact(Some(v)) => write!(f, "{letter}{v:0width$}")?,
                Slot::Exact(None) => {}
            }
        }
        write!(f, "{}.{}", text(&self.suffix), text(&self.extension))
    }
}

/// A compiled filesystem glob. `?` and `*` never cross a `/`.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: Pattern,
    components: usize,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl Glob {
    pub fn new(text: &str) -> Result<Self> {
        Ok(Glob {
            pattern: Pattern::new(text)?,
            components: text.split('/').count(),
        })
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }

    /// Match against a `/`-separated relative path. The glob may cover only the
    /// trailing components, like a recursive glob.
    pub fn is_match(&self, relative: &str) -> bool {
        let parts: Vec<&str> = relative.split('/').collect();
        if parts.len() < self.components {
            return false;
        }
        let tail = parts[parts.len() - self.components..].join("/");
        self.pattern.matches_with(&tail, MATCH_OPTIONS)
    }
}

fn relative_slash_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Lazy, single-use walk of a directory tree yielding files that match a glob.
pub struct Matches {
    root: PathBuf,
    glob: Glob,
    walker: walkdir::IntoIter,
}

impl Iterator for Matches {
    type Item = Result<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(PipelineError::Walk(e))),
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if self.glob.is_match(&relative_slash_path(&self.root, entry.path())) {
                return Some(Ok(entry.into_path()));
            }
        }
    }
}

/// Walk `root` recursively (in file-name order) for files matching `glob`.
pub fn find_matches(glob: &Glob, root: &Path) -> Result<Matches> {
    if !root.is_dir() {
        return Err(PipelineError::MissingDirectory(root.to_path_buf()));
    }
    Ok(Matches {
        root: root.to_path_buf(),
        glob: glob.clone(),
        walker: WalkDir::new(root).sort_by_file_name().into_iter(),
    })
}
