//! Combiner: concatenates per-worker waterfall tiles into one memory-mapped
//! spectrogram matrix.

use crate::io::params::ParamsFile;
use crate::io::tiles;
use anyhow::{bail, Context, Result};
use memmap2::MmapMut;
use ndarray::{s, ArrayViewMut2};
use ndarray_npy::{write_zeroed_npy, ViewMutNpyExt};
use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone)]
pub struct CombineConfig {
    /// Tile files for a single tuning, in any order.
    pub tile_paths: Vec<PathBuf>,
    pub out_path: PathBuf,
    pub params_path: PathBuf,
}

/// Concatenate the tiles into the combined spectrogram file.
///
/// The output is allocated sparse at its exact final size (header plus
/// `L * N * 4` bytes) and tiles are copied in ascending tile-index order;
/// the run fails if the tiles do not cover every row exactly once.
pub fn run(config: &CombineConfig) -> Result<()> {
    if config.tile_paths.is_empty() {
        bail!("must provide paths to waterfall tiles to be combined");
    }
    let params = ParamsFile::load(&config.params_path)?;
    let num_lines = params.get_usize("Reduced DFT Data", "numspectrogramlines")?;
    let dft_length = params.get_usize("Reduced DFT Data", "dftlength")?;

    let sorted = tiles::sort_tile_filepaths(&config.tile_paths)?;

    info!(
        rows = num_lines,
        cols = dft_length,
        "creating combined spectrogram {}",
        config.out_path.display()
    );
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&config.out_path)
        .with_context(|| format!("could not create {}", config.out_path.display()))?;
    write_zeroed_npy::<f32, _>(&file, (num_lines, dft_length))
        .with_context(|| format!("could not allocate {}", config.out_path.display()))?;
    let mut map = unsafe { MmapMut::map_mut(&file) }
        .with_context(|| format!("could not map {}", config.out_path.display()))?;
    let mut combined = ArrayViewMut2::<f32>::view_mut_npy(&mut map)
        .context("combined spectrogram mapping is malformed")?;

    let mut begin = 0usize;
    for path in &sorted {
        info!("loading {} into combined spectrogram", path.display());
        let tile = tiles::read_matrix(path)?;
        if tile.ncols() != dft_length {
            bail!(
                "tile {} is {} channels wide, expected {dft_length}",
                path.display(),
                tile.ncols()
            );
        }
        let end = begin + tile.nrows();
        if end > num_lines {
            bail!(
                "tile {} overruns the spectrogram ({end} > {num_lines} rows)",
                path.display()
            );
        }
        combined.slice_mut(s![begin..end, ..]).assign(&tile);
        begin = end;
    }
    if begin != num_lines {
        bail!("tiles cover {begin} rows, expected {num_lines}");
    }
    map.flush()
        .with_context(|| format!("could not flush {}", config.out_path.display()))?;
    info!("combined spectrogram written");
    Ok(())
}
