mod common;

use anyhow::Result;
use common::{
    cleanup_test_dir, create_test_drx, noise_samples, setup_test_dir, tone_samples, zero_samples,
    TEST_BEAM,
};
use ndarray::{concatenate, Array2, Axis};
use radiotrans::io::drx::SAMPLES_PER_FRAME;
use radiotrans::io::params::ParamsFile;
use radiotrans::io::tiles::{parse_tile_filepath, read_matrix, sort_tile_filepaths, tile_filepath};
use radiotrans::stages::waterfall::{self, WaterfallConfig};
use std::fs::File;
use std::path::{Path, PathBuf};

const FRAME_TIME: f64 = SAMPLES_PER_FRAME as f64 / 50_000.0;

fn builder_config(dir: &Path, drx: &Path, integration_time: f64, workers: usize) -> WaterfallConfig {
    WaterfallConfig {
        drx_path: drx.to_path_buf(),
        work_dir: dir.to_path_buf(),
        params_path: dir.join("radiotrans.ini"),
        integration_time,
        memory_limit_mb: 1000,
        data_util_frac: 1.0,
        label: None,
        enable_hann: false,
        num_workers: workers,
        scratch_dir: None,
        injections: None,
    }
}

/// Collect and sort the tile files of one tuning under `dir`.
fn tuning_tiles(dir: &Path, tuning: u8) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some((_, tune, _)) = parse_tile_filepath(&path) {
            if tune == tuning {
                paths.push(path);
            }
        }
    }
    sort_tile_filepaths(&paths)
}

/// Concatenate the tiles of one tuning in tile-index order.
fn stack_tiles(dir: &Path, tuning: u8) -> Result<Array2<f32>> {
    let mut parts = Vec::new();
    for path in tuning_tiles(dir, tuning)? {
        parts.push(read_matrix(&path)?);
    }
    let views: Vec<_> = parts.iter().map(|m| m.view()).collect();
    Ok(concatenate(Axis(0), &views)?)
}

#[test]
fn zero_frame_file_yields_one_zero_line() -> Result<()> {
    let dir = setup_test_dir()?;
    let drx = dir.join("empty.drx");
    File::create(&drx)?;

    let config = builder_config(&dir, &drx, 0.082, 2);
    waterfall::run(&config)?;

    let params = ParamsFile::load(&config.params_path)?;
    assert_eq!(params.get_usize("Reduced DFT Data", "numspectrogramlines")?, 1);

    for tuning in 0..2u8 {
        let tiles = tuning_tiles(&dir, tuning)?;
        assert_eq!(tiles.len(), 1, "tuning {tuning} should have a single tile");
        let tile = read_matrix(&tiles[0])?;
        assert_eq!(tile.dim(), (1, SAMPLES_PER_FRAME));
        assert!(tile.iter().all(|&v| v == 0.0));
    }

    cleanup_test_dir(&dir)?;
    Ok(())
}

#[test]
fn power_is_conserved_through_the_build() -> Result<()> {
    let dir = setup_test_dir()?;
    let drx = dir.join("noise.drx");
    let num_groups = 12;
    create_test_drx(&drx, num_groups, |g, t, p| noise_samples(g, t, p))?;

    // Two DFT groups per line: 6 output rows split across 2 workers.
    let config = builder_config(&dir, &drx, 2.0 * FRAME_TIME + 1e-4, 2);
    waterfall::run(&config)?;

    let dfts_per_line = 2usize;
    for tuning in 0..2u8 {
        let spect = stack_tiles(&dir, tuning)?;
        assert_eq!(spect.dim(), (6, SAMPLES_PER_FRAME));

        // By Parseval, sum_k |X_k|^2 = N * sum_n |x_n|^2, so the integrated
        // spectrogram power has a closed form in the raw samples.
        let mut expected = 0.0f64;
        for group in 0..num_groups {
            for pol in 0..2u8 {
                let samples = noise_samples(group, tuning, pol);
                let frame_power: f64 = samples
                    .iter()
                    .map(|&(i, q)| (i as f64).powi(2) + (q as f64).powi(2))
                    .sum();
                expected += frame_power / (4.0 * dfts_per_line as f64);
            }
        }
        let total: f64 = spect.iter().map(|&v| v as f64).sum();
        let relative = (total - expected).abs() / expected;
        assert!(relative < 1e-4, "tuning {tuning}: {total} vs {expected}");
    }

    cleanup_test_dir(&dir)?;
    Ok(())
}

#[test]
fn pure_tone_concentrates_in_one_column() -> Result<()> {
    let dir = setup_test_dir()?;
    let drx = dir.join("tone.drx");
    let bin = 300usize;
    create_test_drx(&drx, 4, |_, tune, _| {
        if tune == 0 { tone_samples(bin) } else { zero_samples() }
    })?;

    let config = builder_config(&dir, &drx, 0.082, 1);
    waterfall::run(&config)?;

    // fftshift puts DFT bin k in column (k + N/2) mod N.
    let expected_col = (bin + SAMPLES_PER_FRAME / 2) % SAMPLES_PER_FRAME;
    let spect = stack_tiles(&dir, 0)?;
    assert_eq!(spect.nrows(), 4);
    for row in spect.rows() {
        let peak_col = row
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(col, _)| col)
            .unwrap();
        assert_eq!(peak_col, expected_col);
        let peak = row[expected_col];
        let runner_up = row
            .iter()
            .enumerate()
            .filter(|(col, _)| *col != expected_col)
            .map(|(_, &v)| v)
            .fold(0.0f32, f32::max);
        assert!(peak > 50.0 * runner_up, "peak {peak} vs runner-up {runner_up}");
    }

    // The quiet tuning stays at zero.
    let quiet = stack_tiles(&dir, 1)?;
    assert!(quiet.iter().all(|&v| v == 0.0));

    cleanup_test_dir(&dir)?;
    Ok(())
}

#[test]
fn build_is_invariant_to_worker_count() -> Result<()> {
    let dir_a = setup_test_dir()?;
    let dir_b = setup_test_dir()?;
    let drx = dir_a.join("noise.drx");
    create_test_drx(&drx, 8, |g, t, p| noise_samples(g, t, p))?;

    waterfall::run(&builder_config(&dir_a, &drx, 0.082, 1))?;
    waterfall::run(&builder_config(&dir_b, &drx, 0.082, 3))?;

    // Three workers produce interleaved tiles of 2 rows; their ordered
    // concatenation must be bit-identical to the single-worker build.
    let tiles_b = tuning_tiles(&dir_b, 0)?;
    let indices: Vec<usize> = tiles_b
        .iter()
        .map(|p| parse_tile_filepath(p).unwrap().2)
        .collect();
    assert_eq!(indices, vec![0, 2, 4, 6]);

    for tuning in 0..2u8 {
        let a = stack_tiles(&dir_a, tuning)?;
        let b = stack_tiles(&dir_b, tuning)?;
        assert_eq!(a, b, "tuning {tuning} differs between worker counts");
    }

    cleanup_test_dir(&dir_a)?;
    cleanup_test_dir(&dir_b)?;
    Ok(())
}

#[test]
fn tile_paths_follow_the_naming_scheme() -> Result<()> {
    let dir = setup_test_dir()?;
    let drx = dir.join("noise.drx");
    create_test_drx(&drx, 4, |g, t, p| noise_samples(g, t, p))?;

    let mut config = builder_config(&dir, &drx, 0.082, 2);
    config.label = Some("run7".to_string());
    waterfall::run(&config)?;

    let expected = tile_filepath(&dir, Some("run7"), 0, TEST_BEAM, 0);
    assert!(expected.exists(), "missing {}", expected.display());
    let expected = tile_filepath(&dir, Some("run7"), 2, TEST_BEAM, 1);
    assert!(expected.exists(), "missing {}", expected.display());

    cleanup_test_dir(&dir)?;
    Ok(())
}
