use half::f16;
use ndarray::{Array2, ArrayView2};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use std::fs;
use std::io::BufWriter;
use std::path::Path;
use tiff::encoder::{colortype::Gray16, TiffEncoder};

use crate::error::{PipelineError, Result};
use crate::npy;

/// A 2-D raster of any element type the pipeline stores.
#[derive(Debug, Clone, PartialEq)]
pub enum Raster {
    U16(Array2<u16>),
    U32(Array2<u32>),
    F16(Array2<f16>),
    F64(Array2<f64>),
}

impl Raster {
    pub fn dim(&self) -> (usize, usize) {
        match self {
            Raster::U16(a) => a.dim(),
            Raster::U32(a) => a.dim(),
            Raster::F16(a) => a.dim(),
            Raster::F64(a) => a.dim(),
        }
    }

    /// Value at `(row, col)` widened to f64; `None` outside the raster.
    pub fn get_f64(&self, row: usize, col: usize) -> Option<f64> {
        match self {
            Raster::U16(a) => a.get((row, col)).map(|&v| v as f64),
            Raster::U32(a) => a.get((row, col)).map(|&v| v as f64),
            Raster::F16(a) => a.get((row, col)).map(|v| v.to_f64()),
            Raster::F64(a) => a.get((row, col)).copied(),
        }
    }

    /// Label raster view; only integer rasters qualify.
    pub fn into_labels(self) -> Option<Array2<u32>> {
        match self {
            Raster::U16(a) => Some(a.mapv(u32::from)),
            Raster::U32(a) => Some(a),
            Raster::F16(_) | Raster::F64(_) => None,
        }
    }

    pub fn dtype(&self) -> &'static str {
        match self {
            Raster::U16(_) => "<u2",
            Raster::U32(_) => "<u4",
            Raster::F16(_) => "<f2",
            Raster::F64(_) => "<f8",
        }
    }
}

/// Read a single-plane grayscale TIFF (8 or 16 bit) as u16.
pub fn read_tiff(path: &Path) -> Result<Array2<u16>> {
    let file = fs::File::open(path)?;
    let mut decoder = tiff::decoder::Decoder::new(file)?;
    let (width, height) = decoder.dimensions()?;
    let data = match decoder.read_image()? {
        tiff::decoder::DecodingResult::U16(v) => v,
        tiff::decoder::DecodingResult::U8(v) => v.into_iter().map(u16::from).collect(),
        _ => {
            return Err(PipelineError::UnsupportedPixelFormat {
                path: path.to_path_buf(),
                format: "need u8 or u16 grayscale".to_string(),
            })
        }
    };
    Ok(Array2::from_shape_vec((height as usize, width as usize), data)?)
}

pub fn write_tiff(path: &Path, image: ArrayView2<'_, u16>) -> Result<()> {
    let (height, width) = image.dim();
    let data: Vec<u16> = image.iter().copied().collect();
    let file = fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    let mut encoder = TiffEncoder::new(&mut writer)?;
    encoder.write_image::<Gray16>(width as u32, height as u32, &data)?;
    Ok(())
}

/// Read a 2-D `.npy` raster, dispatching on its stored dtype.
pub fn read_npy(path: &Path) -> Result<Raster> {
    let header = npy::read_header(path)?;
    let open = || fs::File::open(path);
    let raster = match header.descr.as_str() {
        "<f2" => Raster::F16(npy::read_f16(path)?),
        "<u2" => Raster::U16(Array2::<u16>::read_npy(open()?)?),
        "<u4" => Raster::U32(Array2::<u32>::read_npy(open()?)?),
        "<i4" => Raster::U32(Array2::<i32>::read_npy(open()?)?.mapv(|v| v.max(0) as u32)),
        "<i8" => Raster::U32(Array2::<i64>::read_npy(open()?)?.mapv(|v| v.max(0) as u32)),
        "<f4" => Raster::F64(Array2::<f32>::read_npy(open()?)?.mapv(f64::from)),
        "<f8" => Raster::F64(Array2::<f64>::read_npy(open()?)?),
        other => {
            return Err(PipelineError::UnsupportedPixelFormat {
                path: path.to_path_buf(),
                format: other.to_string(),
            })
        }
    };
    Ok(raster)
}

pub fn write_npy(path: &Path, raster: &Raster) -> Result<()> {
    match raster {
        Raster::F16(a) => npy::write_f16(path, a)?,
        Raster::U16(a) => a.write_npy(BufWriter::new(fs::File::create(path)?))?,
        Raster::U32(a) => a.write_npy(BufWriter::new(fs::File::create(path)?))?,
        Raster::F64(a) => a.write_npy(BufWriter::new(fs::File::create(path)?))?,
    }
    Ok(())
}

/// Read either container by extension: `tif`/`tiff` or `npy`.
pub fn read_raster(path: &Path) -> Result<Raster> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("tif") | Some("tiff") => Ok(Raster::U16(read_tiff(path)?)),
        _ => read_npy(path),
    }
}
