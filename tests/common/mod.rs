use anyhow::Result;
use radiotrans::io::drx::{encode_frame, FrameParams, SAMPLES_PER_FRAME};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Decimation giving a 50 kHz sample rate: one frame lasts 81.92 ms, so a
/// few thousand frames cover minutes of data and dispersion delays span a
/// useful number of spectrogram rows.
pub const TEST_DECIMATION: u16 = 3920;

/// Tuning words for the two bands (about 5.87 MHz and 6.85 MHz).
pub const TEST_TUNING_WORDS: [u32; 2] = [128_632_000, 150_000_000];

pub const TEST_BEAM: u8 = 2;

/// Creates a fresh test directory for running tests
pub fn setup_test_dir() -> Result<PathBuf> {
    // Create a unique directory name by concatenating strings
    let dir_name = format!("test-data-{}", Uuid::new_v4());
    let test_dir = PathBuf::from(dir_name);

    if test_dir.exists() {
        fs::remove_dir_all(&test_dir)?;
    }
    fs::create_dir(&test_dir)?;
    Ok(test_dir)
}

/// Cleans up the test directory after tests are complete
pub fn cleanup_test_dir(test_dir: &Path) -> Result<()> {
    if test_dir.exists() {
        fs::remove_dir_all(test_dir)?;
    }
    Ok(())
}

/// Write a synthetic DRX recording of `num_groups` complete frame groups.
/// The sample generator receives `(group, tune, pol)` and returns the frame's
/// (I, Q) samples.
#[allow(dead_code)]
pub fn create_test_drx<F>(path: &Path, num_groups: usize, mut samples: F) -> Result<()>
where
    F: FnMut(usize, u8, u8) -> Vec<(i8, i8)>,
{
    let mut out = BufWriter::new(File::create(path)?);
    for group in 0..num_groups {
        for tune in 0..2u8 {
            for pol in 0..2u8 {
                let params = FrameParams {
                    beam: TEST_BEAM,
                    tune,
                    pol,
                    decimation: TEST_DECIMATION,
                    time_tag: (group * SAMPLES_PER_FRAME) as u64,
                    tuning_word: TEST_TUNING_WORDS[tune as usize],
                };
                encode_frame(&mut out, &params, &samples(group, tune, pol))?;
            }
        }
    }
    Ok(())
}

/// All-zero frame payload.
#[allow(dead_code)]
pub fn zero_samples() -> Vec<(i8, i8)> {
    vec![(0, 0); SAMPLES_PER_FRAME]
}

/// A full-scale complex tone centered on DFT bin `bin`.
#[allow(dead_code)]
pub fn tone_samples(bin: usize) -> Vec<(i8, i8)> {
    (0..SAMPLES_PER_FRAME)
        .map(|n| {
            let phase =
                2.0 * std::f64::consts::PI * bin as f64 * n as f64 / SAMPLES_PER_FRAME as f64;
            ((7.0 * phase.cos()).round() as i8, (7.0 * phase.sin()).round() as i8)
        })
        .collect()
}

/// Deterministic pseudo-random 4-bit samples, distinct per frame.
#[allow(dead_code)]
pub fn noise_samples(group: usize, tune: u8, pol: u8) -> Vec<(i8, i8)> {
    let mut state = (group as u64)
        .wrapping_mul(6364136223846793005)
        .wrapping_add(((tune as u64) << 32) | ((pol as u64) << 16) | 1442695040888963407);
    (0..SAMPLES_PER_FRAME)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let i = ((state >> 33) % 15) as i8 - 7;
            let q = ((state >> 17) % 15) as i8 - 7;
            (i, q)
        })
        .collect()
}
