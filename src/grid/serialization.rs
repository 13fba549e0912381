//! Binary persistence of model photometry grids.
//!
//! Layout (every integer and float little-endian, strings as `u32` byte length
//! followed by UTF-8 bytes):
//!
//! ```text
//! magic        8 bytes  "PHZGRID\0"
//! version      u32
//! n_regions    u32
//! per region:  name, z (u64 len + f64s), ebv (u64 len + f64s),
//!              reddening curves (u64 len + strings), seds (u64 len + strings)
//! n_filters    u64, then the filter names (written once)
//! per region:  (flux f64, error f64) for every cell and filter, storage order
//! ```
//!
//! The number of values in the trailing block is derived from the axis sizes;
//! a stream that ends early is a format error. Nothing is preallocated from the
//! declared lengths, so a corrupt header fails on the missing data instead of
//! on the allocation. Missing and upper-limit flags are
//! not part of the layout: model photometry is always a plain measurement.
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::sync::Arc;

use camino::Utf8Path;

use super::{Grid, GridAxes, PhotometryGrid};
use crate::constants::RegionMap;
use crate::photometry::{FluxErrorPair, Photometry};
use crate::phz_errors::PhzError;

const MAGIC: &[u8; 8] = b"PHZGRID\0";
const FORMAT_VERSION: u32 = 1;

fn format_err(what: &str) -> impl FnOnce(io::Error) -> PhzError + '_ {
    move |e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            PhzError::GridFormat(format!("unexpected end of data while reading {what}"))
        } else {
            PhzError::IoError(e)
        }
    }
}

fn read_u32_le<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64_le<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f64_le<R: Read>(reader: &mut R) -> io::Result<f64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_string<R: Read>(reader: &mut R, what: &str) -> Result<String, PhzError> {
    let len = read_u32_le(reader).map_err(format_err(what))?;
    let mut buf = Vec::new();
    (&mut *reader)
        .take(u64::from(len))
        .read_to_end(&mut buf)
        .map_err(format_err(what))?;
    if buf.len() != len as usize {
        return Err(PhzError::GridFormat(format!(
            "unexpected end of data while reading {what}"
        )));
    }
    String::from_utf8(buf).map_err(|e| PhzError::GridFormat(format!("{what} is not UTF-8: {e}")))
}

fn read_len<R: Read>(reader: &mut R, what: &str) -> Result<usize, PhzError> {
    let len = read_u64_le(reader).map_err(format_err(what))?;
    usize::try_from(len).map_err(|_| PhzError::GridFormat(format!("{what} length {len} too large")))
}

fn read_f64_vec<R: Read>(reader: &mut R, what: &str) -> Result<Vec<f64>, PhzError> {
    let len = read_len(reader, what)?;
    (0..len)
        .map(|_| read_f64_le(reader).map_err(format_err(what)))
        .collect()
}

fn read_string_vec<R: Read>(reader: &mut R, what: &str) -> Result<Vec<String>, PhzError> {
    let len = read_len(reader, what)?;
    (0..len).map(|_| read_string(reader, what)).collect()
}

fn write_string<W: Write>(writer: &mut W, s: &str) -> io::Result<()> {
    let len = u32::try_from(s.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string too long"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(s.as_bytes())
}

fn write_f64_slice<W: Write>(writer: &mut W, values: &[f64]) -> io::Result<()> {
    writer.write_all(&(values.len() as u64).to_le_bytes())?;
    for v in values {
        writer.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn write_string_slice<W: Write>(writer: &mut W, values: &[String]) -> io::Result<()> {
    writer.write_all(&(values.len() as u64).to_le_bytes())?;
    for v in values {
        write_string(writer, v)?;
    }
    Ok(())
}

/// Check that every cell of every region shares one filter list and return it.
fn common_filters(grids: &RegionMap<PhotometryGrid>) -> Result<&Photometry, PhzError> {
    let reference = grids
        .values()
        .find_map(|g| g.cells().first())
        .ok_or(PhzError::EmptyGrid)?;
    for (name, grid) in grids {
        if grid.is_empty() {
            return Err(PhzError::EmptyGrid);
        }
        for (flat, cell) in grid.cells().iter().enumerate() {
            if !cell.same_filters(reference) {
                return Err(PhzError::HeterogeneousGrid(format!(
                    "region {name} cell {flat} has filters {:?}, expected {:?}",
                    cell.filters(),
                    reference.filters()
                )));
            }
        }
    }
    Ok(reference)
}

/// Serialize a region map of photometry grids.
///
/// Return
/// ----------
/// * `Err(PhzError::EmptyGrid)` if the map or any region holds no cell.
/// * `Err(PhzError::HeterogeneousGrid)` if the cells do not all share the same filters.
/// * `Err(PhzError::IoError)` on write failure.
pub fn write_grid<W: Write>(writer: &mut W, grids: &RegionMap<PhotometryGrid>) -> Result<(), PhzError> {
    let reference = common_filters(grids)?;
    let n_regions = u32::try_from(grids.len())
        .map_err(|_| PhzError::GridFormat("too many regions".into()))?;

    writer.write_all(MAGIC)?;
    writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
    writer.write_all(&n_regions.to_le_bytes())?;

    for (name, grid) in grids {
        let axes = grid.axes();
        write_string(writer, name)?;
        write_f64_slice(writer, axes.z())?;
        write_f64_slice(writer, axes.ebv())?;
        write_string_slice(writer, axes.reddening_curve())?;
        write_string_slice(writer, axes.sed())?;
    }

    write_string_slice(writer, reference.filters())?;

    for grid in grids.values() {
        for cell in grid.cells() {
            for v in cell.values() {
                writer.write_all(&v.flux.to_le_bytes())?;
                writer.write_all(&v.error.to_le_bytes())?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

/// Deserialize a region map of photometry grids.
///
/// Arguments
/// -----------------
/// * `reader` – the byte source.
/// * `expected_filters` – when given, the embedded filter list must equal it exactly
///   (same names, same order).
///
/// Return
/// ----------
/// * `Err(PhzError::GridFormat)` on a bad header, an invalid region layout (numeric
///   axes not strictly ascending, cell count overflowing), a filter-list mismatch, or a
///   stream holding fewer values than the axes imply.
pub fn read_grid<R: Read>(
    reader: &mut R,
    expected_filters: Option<&[String]>,
) -> Result<RegionMap<PhotometryGrid>, PhzError> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic).map_err(format_err("header"))?;
    if &magic != MAGIC {
        return Err(PhzError::GridFormat("not a grid file (bad magic)".into()));
    }
    let version = read_u32_le(reader).map_err(format_err("header"))?;
    if version != FORMAT_VERSION {
        return Err(PhzError::GridFormat(format!(
            "unsupported format version {version}"
        )));
    }
    let n_regions = read_u32_le(reader).map_err(format_err("header"))?;
    if n_regions == 0 {
        return Err(PhzError::GridFormat("grid file holds no region".into()));
    }

    let mut layout = Vec::new();
    for _ in 0..n_regions {
        let name = read_string(reader, "region name")?;
        let z = read_f64_vec(reader, "redshift axis")?;
        let ebv = read_f64_vec(reader, "E(B-V) axis")?;
        let reddening = read_string_vec(reader, "reddening curve axis")?;
        let sed = read_string_vec(reader, "SED axis")?;
        let axes = GridAxes::new(z, ebv, reddening, sed).map_err(|e| {
            PhzError::GridFormat(format!("region {name} has an invalid layout: {e}"))
        })?;
        layout.push((name, axes));
    }

    let filters: Arc<[String]> = read_string_vec(reader, "filter list")?.into();
    if let Some(expected) = expected_filters {
        if &*filters != expected {
            return Err(PhzError::GridFormat(format!(
                "grid filters {:?} do not match the expected filters {expected:?}",
                &*filters
            )));
        }
    }

    let mut grids = RegionMap::new();
    for (name, axes) in layout {
        let n_cells = axes.cell_count();
        let mut cells = Vec::new();
        for _ in 0..n_cells {
            let mut values = Vec::with_capacity(filters.len());
            for _ in 0..filters.len() {
                let flux = read_f64_le(reader).map_err(format_err("photometry values"))?;
                let error = read_f64_le(reader).map_err(format_err("photometry values"))?;
                values.push(FluxErrorPair::new(flux, error));
            }
            cells.push(Photometry::new(Arc::clone(&filters), values)?);
        }
        grids.insert(name, Grid::new(axes, cells)?);
    }
    Ok(grids)
}

/// Write `grids` to a file at `path`.
pub fn save_grid_file(path: &Utf8Path, grids: &RegionMap<PhotometryGrid>) -> Result<(), PhzError> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_grid(&mut writer, grids)
}

/// Read grids from a file at `path`; see [`read_grid`].
pub fn load_grid_file(
    path: &Utf8Path,
    expected_filters: Option<&[String]>,
) -> Result<RegionMap<PhotometryGrid>, PhzError> {
    let mut reader = BufReader::new(File::open(path)?);
    read_grid(&mut reader, expected_filters)
}
