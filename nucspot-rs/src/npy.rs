//! Minimal `.npy` header handling and the half-precision codec.
//!
//! `ndarray-npy` covers the common element types; `<f2` (used for z-centroid
//! rasters) is encoded here.

use half::f16;
use ndarray::Array2;
use regex::Regex;
use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::OnceLock;

use crate::error::{PipelineError, Result};

const MAGIC: &[u8; 6] = b"\x93NUMPY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyHeader {
    pub descr: String,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
}

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"'descr':\s*'(?P<descr>[^']+)'.*'fortran_order':\s*(?P<fortran>True|False).*'shape':\s*\((?P<shape>[^)]*)\)")
            .expect("npy header pattern is a valid regex")
    })
}

fn invalid(path: &Path, reason: impl Into<String>) -> PipelineError {
    PipelineError::InvalidNpy {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn read_header_from(reader: &mut impl Read, path: &Path) -> Result<NpyHeader> {
    let mut preamble = [0u8; 8];
    reader.read_exact(&mut preamble)?;
    if &preamble[..6] != MAGIC {
        return Err(invalid(path, "missing NUMPY magic"));
    }
    let header_len = match preamble[6] {
        1 => {
            let mut len = [0u8; 2];
            reader.read_exact(&mut len)?;
            u16::from_le_bytes(len) as usize
        }
        2 | 3 => {
            let mut len = [0u8; 4];
            reader.read_exact(&mut len)?;
            u32::from_le_bytes(len) as usize
        }
        v => return Err(invalid(path, format!("unsupported format version {v}"))),
    };
    let mut dict = vec![0u8; header_len];
    reader.read_exact(&mut dict)?;
    let dict = String::from_utf8_lossy(&dict);
    let cap = header_re()
        .captures(&dict)
        .ok_or_else(|| invalid(path, format!("unrecognised header {dict:?}")))?;
    let shape = cap["shape"]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().map_err(|_| invalid(path, format!("bad shape entry {s:?}"))))
        .collect::<Result<Vec<_>>>()?;
    Ok(NpyHeader {
        descr: cap["descr"].to_string(),
        fortran_order: &cap["fortran"] == "True",
        shape,
    })
}

pub fn read_header(path: &Path) -> Result<NpyHeader> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    read_header_from(&mut reader, path)
}

pub fn read_f16(path: &Path) -> Result<Array2<f16>> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    let header = read_header_from(&mut reader, path)?;
    if header.descr != "<f2" {
        return Err(invalid(path, format!("expected <f2, found {}", header.descr)));
    }
    if header.fortran_order {
        return Err(invalid(path, "fortran-ordered arrays are not supported"));
    }
    let &[rows, cols] = header.shape.as_slice() else {
        return Err(invalid(path, format!("expected 2-D array, found shape {:?}", header.shape)));
    };
    let mut bytes = vec![0u8; rows * cols * 2];
    reader.read_exact(&mut bytes)?;
    let values: Vec<f16> = bytes
        .chunks_exact(2)
        .map(|b| f16::from_le_bytes([b[0], b[1]]))
        .collect();
    Ok(Array2::from_shape_vec((rows, cols), values)?)
}

pub fn write_f16(path: &Path, array: &Array2<f16>) -> Result<()> {
    let (rows, cols) = array.dim();
    let mut dict = format!("{{'descr': '<f2', 'fortran_order': False, 'shape': ({rows}, {cols}), }}");
    // Preamble (10 bytes) + dict + newline is padded to a multiple of 64.
    let unpadded = MAGIC.len() + 4 + dict.len() + 1;
    dict.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    dict.push('\n');

    let mut writer = BufWriter::new(fs::File::create(path)?);
    writer.write_all(MAGIC)?;
    writer.write_all(&[1, 0])?;
    writer.write_all(&(dict.len() as u16).to_le_bytes())?;
    writer.write_all(dict.as_bytes())?;
    for v in array.iter() {
        writer.write_all(&v.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}
