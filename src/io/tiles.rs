//! Waterfall tile naming and `.npy` spectrogram persistence.
//!
//! Tiles are row-major float32 matrices in the NumPy `.npy` container, named
//! `waterfall[_LABEL]-S{tile}-B{beam}T{tune}.npy` where `tile` is the global
//! starting row of the tile. The combiner recovers shape information from the
//! `.npy` header, so tile height never has to be carried out of band.

use crate::comm::{partition_rows, Rank};
use anyhow::{Context, Result};
use memmap2::Mmap;
use ndarray::{s, Array2, ArrayView2};
use ndarray_npy::{ReadNpyExt, ViewNpyExt, WriteNpyExt};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Compose the path of one spectrogram tile.
pub fn tile_filepath(
    work_dir: &Path,
    label: Option<&str>,
    tile: usize,
    beam: u8,
    tuning: u8,
) -> PathBuf {
    let label = label.map(|l| format!("_{l}")).unwrap_or_default();
    work_dir.join(format!("waterfall{label}-S{tile}-B{beam}T{tuning}.npy"))
}

/// Parse `(beam, tuning, tile)` back out of a tile path. Returns `None` for
/// paths that do not follow the tile naming scheme.
pub fn parse_tile_filepath(path: &Path) -> Option<(u8, u8, usize)> {
    let name = path.file_name()?.to_str()?;
    let mut fields = name.split('-');
    let prefix = fields.next()?;
    if !prefix.starts_with("waterfall") {
        return None;
    }
    let tile = fields.next()?.strip_prefix('S')?.parse().ok()?;
    let beam_tune = fields.next()?.strip_suffix(".npy")?;
    let (beam, tune) = beam_tune.strip_prefix('B')?.split_once('T')?;
    Some((beam.parse().ok()?, tune.parse().ok()?, tile))
}

/// Sort tile paths by their numeric tile index.
pub fn sort_tile_filepaths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut indexed: Vec<(usize, PathBuf)> = paths
        .iter()
        .map(|path| {
            parse_tile_filepath(path)
                .map(|(_, _, tile)| (tile, path.clone()))
                .with_context(|| format!("not a waterfall tile path: {}", path.display()))
        })
        .collect::<Result<_>>()?;
    indexed.sort_by_key(|(tile, _)| *tile);
    Ok(indexed.into_iter().map(|(_, path)| path).collect())
}

/// Write one float32 matrix as an `.npy` file.
pub fn write_matrix(path: &Path, matrix: &Array2<f32>) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("could not create {}", path.display()))?;
    matrix
        .write_npy(BufWriter::new(file))
        .with_context(|| format!("could not write {}", path.display()))?;
    Ok(())
}

/// Load a float32 matrix from an `.npy` file.
pub fn read_matrix(path: &Path) -> Result<Array2<f32>> {
    let file = File::open(path)
        .with_context(|| format!("could not open {}", path.display()))?;
    Array2::<f32>::read_npy(file)
        .with_context(|| format!("malformed spectrogram file {}", path.display()))
}

/// Scatter the rows of an on-disk `.npy` spectrogram across the worker team.
///
/// The root memory-maps the file once and shares the read-only mapping; each
/// rank copies out its contiguous row segment (rank 0 absorbs the residue).
/// Returns the local segment together with the segment sizes, offsets and the
/// full matrix shape, which every rank needs for later collectives.
pub fn scatter_npy_rows(
    rank: &Rank,
    root: usize,
    path: &Path,
) -> Result<(Array2<f32>, Vec<usize>, Vec<usize>, (usize, usize))> {
    let map: Arc<Mmap> = if rank.rank() == root {
        let file = File::open(path)
            .with_context(|| format!("could not open spectrogram file {}", path.display()))?;
        let map = unsafe { Mmap::map(&file) }
            .with_context(|| format!("could not map spectrogram file {}", path.display()))?;
        rank.broadcast(root, Some(Arc::new(map)))
    } else {
        rank.broadcast(root, None)
    };

    let view = ArrayView2::<f32>::view_npy(&map[..])
        .with_context(|| format!("malformed spectrogram file {}", path.display()))?;
    let shape = (view.nrows(), view.ncols());
    let (sizes, offsets) = partition_rows(shape.0, rank.size());
    let (size, offset) = (sizes[rank.rank()], offsets[rank.rank()]);
    let segment = view.slice(s![offset..offset + size, ..]).to_owned();
    Ok((segment, sizes, offsets, shape))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_paths_round_trip() {
        let path = tile_filepath(Path::new("/work"), Some("run7"), 1200, 2, 1);
        assert_eq!(
            path,
            PathBuf::from("/work/waterfall_run7-S1200-B2T1.npy")
        );
        assert_eq!(parse_tile_filepath(&path), Some((2, 1, 1200)));

        let unlabeled = tile_filepath(Path::new("."), None, 0, 1, 0);
        assert_eq!(parse_tile_filepath(&unlabeled), Some((1, 0, 0)));
    }

    #[test]
    fn sorting_is_numeric_not_lexicographic() {
        let dir = Path::new(".");
        let paths = vec![
            tile_filepath(dir, None, 1000, 1, 0),
            tile_filepath(dir, None, 200, 1, 0),
            tile_filepath(dir, None, 30, 1, 0),
        ];
        let sorted = sort_tile_filepaths(&paths).unwrap();
        let indices: Vec<usize> = sorted
            .iter()
            .map(|p| parse_tile_filepath(p).unwrap().2)
            .collect();
        assert_eq!(indices, vec![30, 200, 1000]);
    }

    #[test]
    fn matrix_npy_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.npy");
        let matrix = Array2::from_shape_fn((3, 5), |(r, c)| (r * 5 + c) as f32);
        write_matrix(&path, &matrix).unwrap();
        assert_eq!(read_matrix(&path).unwrap(), matrix);
    }
}
