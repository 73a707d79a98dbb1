//! Structured filename addressing.
//!
//! Every artifact in the pipeline is named
//! `<experiment>_<well>[T####][F###][L##][A##][Z###][C##]<suffix>.<extension>`.
//! Numeric tokens are fixed width and zero padded; absent tokens are left out
//! entirely. The suffix is a sequence of `_`-separated stage tags such as
//! `_maximum_projection_nuclear_mask_007_3`.

use regex::Regex;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::{PipelineError, Result};

const ADDRESS_RE: &str = r"^(?P<experiment>.+?)_(?P<well>[A-Z]{1,2}\d{2})(?P<separator>_)?(?:T(?P<t>\d{4}))?(?:F(?P<f>\d{3}))?(?:L(?P<l>\d{2}))?(?:A(?P<a>\d{2}))?(?:Z(?P<z>\d{3}|X+))?(?:C(?P<c>\d{2}))?(?P<suffix>_[^/]*)?\.(?P<extension>[A-Za-z0-9]+)$";

fn address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(ADDRESS_RE).expect("address grammar is a valid regex"))
}

/// Addressable fields of a filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Experiment,
    Well,
    T,
    F,
    L,
    A,
    Z,
    C,
}

impl Field {
    pub const NUMERIC: [Field; 6] = [Field::T, Field::F, Field::L, Field::A, Field::Z, Field::C];

    /// Token letter for numeric fields.
    pub fn letter(self) -> Option<char> {
        match self {
            Field::T => Some('T'),
            Field::F => Some('F'),
            Field::L => Some('L'),
            Field::A => Some('A'),
            Field::Z => Some('Z'),
            Field::C => Some('C'),
            Field::Experiment | Field::Well => None,
        }
    }

    /// Zero-padded digit width for numeric fields.
    pub fn width(self) -> Option<usize> {
        match self {
            Field::T => Some(4),
            Field::F | Field::Z => Some(3),
            Field::L | Field::A | Field::C => Some(2),
            Field::Experiment | Field::Well => None,
        }
    }
}

/// One tag of a pipeline-stage suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SuffixPart {
    MaximumProjection,
    ZCenter,
    NuclearSegmentation,
    NuclearMask(u32),
    DistanceTransform(u32),
    /// `width` is the zero-padded digit count, 1 when written unpadded.
    Spot { index: u32, width: usize },
    Other(String),
}

impl SuffixPart {
    pub fn spot(index: u32) -> Self {
        SuffixPart::Spot { index, width: 1 }
    }
}

impl fmt::Display for SuffixPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuffixPart::MaximumProjection => write!(f, "_maximum_projection"),
            SuffixPart::ZCenter => write!(f, "_z_center"),
            SuffixPart::NuclearSegmentation => write!(f, "_nuclear_segmentation"),
            SuffixPart::NuclearMask(n) => write!(f, "_nuclear_mask_{n:03}"),
            SuffixPart::DistanceTransform(n) => write!(f, "_distance_transform_{n:03}"),
            SuffixPart::Spot { index, width } => write!(f, "_{index:0width$}"),
            SuffixPart::Other(word) => write!(f, "_{word}"),
        }
    }
}

/// Tagged suffix, parsed once and re-formatted losslessly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Suffix(Vec<SuffixPart>);

fn three_digit_index(word: &str) -> Option<u32> {
    if word.len() == 3 && word.bytes().all(|b| b.is_ascii_digit()) {
        word.parse().ok()
    } else {
        None
    }
}

fn spot_part(word: &str) -> Option<SuffixPart> {
    if word.is_empty() || !word.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index = word.parse().ok()?;
    let width = if word.starts_with('0') { word.len() } else { 1 };
    Some(SuffixPart::Spot { index, width })
}

impl Suffix {
    pub fn new(parts: Vec<SuffixPart>) -> Self {
        Suffix(parts)
    }

    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Suffix::default());
        }
        let body = s
            .strip_prefix('_')
            .ok_or_else(|| PipelineError::MalformedAddress(s.to_string()))?;
        let words: Vec<&str> = body.split('_').collect();
        let mut parts = Vec::new();
        let mut i = 0;
        while i < words.len() {
            let rest = &words[i..];
            let (part, used) = match rest {
                ["maximum", "projection", ..] => (SuffixPart::MaximumProjection, 2),
                ["z", "center", ..] => (SuffixPart::ZCenter, 2),
                ["nuclear", "segmentation", ..] => (SuffixPart::NuclearSegmentation, 2),
                ["nuclear", "mask", n, ..] => match three_digit_index(n) {
                    Some(index) => (SuffixPart::NuclearMask(index), 3),
                    None => (SuffixPart::Other(rest[0].to_string()), 1),
                },
                ["distance", "transform", n, ..] => match three_digit_index(n) {
                    Some(index) => (SuffixPart::DistanceTransform(index), 3),
                    None => (SuffixPart::Other(rest[0].to_string()), 1),
                },
                [n, ..] if matches!(parts.last(), Some(SuffixPart::NuclearMask(_))) => {
                    match spot_part(n) {
                        Some(spot) => (spot, 1),
                        None => (SuffixPart::Other(n.to_string()), 1),
                    }
                }
                [word, ..] => (SuffixPart::Other(word.to_string()), 1),
                [] => break,
            };
            parts.push(part);
            i += used;
        }
        Ok(Suffix(parts))
    }

    pub fn parts(&self) -> &[SuffixPart] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy with `part` appended.
    pub fn with(&self, part: SuffixPart) -> Self {
        let mut parts = self.0.clone();
        parts.push(part);
        Suffix(parts)
    }

    /// Copy with all of `other`'s parts appended.
    pub fn concat(&self, other: &Suffix) -> Self {
        let mut parts = self.0.clone();
        parts.extend(other.0.iter().cloned());
        Suffix(parts)
    }

    /// Index of the last nuclear mask (or distance transform) tag.
    pub fn nucleus_index(&self) -> Option<u32> {
        self.0.iter().rev().find_map(|p| match p {
            SuffixPart::NuclearMask(n) | SuffixPart::DistanceTransform(n) => Some(*n),
            _ => None,
        })
    }

    pub fn spot_index(&self) -> Option<u32> {
        self.0.iter().rev().find_map(|p| match p {
            SuffixPart::Spot { index, .. } => Some(*index),
            _ => None,
        })
    }

    pub fn ends_with(&self, part: &SuffixPart) -> bool {
        self.0.last() == Some(part)
    }
}

impl fmt::Display for Suffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in &self.0 {
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

impl From<Vec<SuffixPart>> for Suffix {
    fn from(parts: Vec<SuffixPart>) -> Self {
        Suffix(parts)
    }
}

/// Decoded filename metadata. Derived addresses are built as modified copies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub experiment: String,
    pub well: String,
    /// Legacy names put an `_` between the well and the first numeric token.
    pub well_separator: bool,
    pub t: Option<u32>,
    pub f: Option<u32>,
    pub l: Option<u32>,
    pub a: Option<u32>,
    pub z: Option<u32>,
    pub c: Option<u32>,
    pub suffix: Suffix,
    pub extension: String,
}

fn capture_u32(cap: &regex::Captures<'_>, name: &str) -> Option<u32> {
    cap.name(name).and_then(|m| m.as_str().parse().ok())
}

impl Address {
    /// Parse a file name (no directories) against the address grammar.
    pub fn parse(name: &str) -> Result<Self> {
        let cap = address_re()
            .captures(name)
            .ok_or_else(|| PipelineError::MalformedAddress(name.to_string()))?;
        let suffix = Suffix::parse(cap.name("suffix").map_or("", |m| m.as_str()))?;
        Ok(Address {
            experiment: cap["experiment"].to_string(),
            well: cap["well"].to_string(),
            well_separator: cap.name("separator").is_some(),
            t: capture_u32(&cap, "t"),
            f: capture_u32(&cap, "f"),
            l: capture_u32(&cap, "l"),
            a: capture_u32(&cap, "a"),
            // `ZXX` placeholders carry no plane index.
            z: capture_u32(&cap, "z"),
            c: capture_u32(&cap, "c"),
            suffix,
            extension: cap["extension"].to_string(),
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PipelineError::MalformedAddress(path.display().to_string()))?;
        Address::parse(&name)
    }

    pub fn get(&self, field: Field) -> Option<u32> {
        match field {
            Field::T => self.t,
            Field::F => self.f,
            Field::L => self.l,
            Field::A => self.a,
            Field::Z => self.z,
            Field::C => self.c,
            Field::Experiment | Field::Well => None,
        }
    }

    /// Copy with the given numeric fields cleared.
    pub fn without(&self, fields: &[Field]) -> Self {
        let mut out = self.clone();
        for field in fields {
            match field {
                Field::T => out.t = None,
                Field::F => out.f = None,
                Field::L => out.l = None,
                Field::A => out.a = None,
                Field::Z => out.z = None,
                Field::C => out.c = None,
                Field::Experiment | Field::Well => {}
            }
        }
        out
    }

    pub fn with_suffix(&self, suffix: Suffix) -> Self {
        Address {
            suffix,
            ..self.clone()
        }
    }

    pub fn with_extension(&self, extension: &str) -> Self {
        Address {
            extension: extension.to_string(),
            ..self.clone()
        }
    }

    /// Encoded file name, e.g. `384_B07T0001F007L01A01C03_z_center.npy`.
    pub fn file_name(&self) -> String {
        self.to_string()
    }

    /// File name without the extension.
    pub fn stem(&self) -> String {
        let mut out = format!("{}_{}", self.experiment, self.well);
        if self.well_separator {
            out.push('_');
        }
        for field in Field::NUMERIC {
            if let (Some(v), Some(letter), Some(width)) = (self.get(field), field.letter(), field.width()) {
                out.push_str(&format!("{letter}{v:0width$}"));
            }
        }
        out.push_str(&self.suffix.to_string());
        out
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stem(), self.extension)
    }
}

impl FromStr for Address {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Address::parse(s)
    }
}
