//! RFI and bandpass filtration.
//!
//! The spectrogram is trimmed to the bandpass of interest, flattened along
//! both axes (divide by a smoothed bandpass curve, subtract a smoothed
//! baseline curve), and then cleaned of residual interference by zeroing
//! whole rows and columns whose means are outliers. Rows are partitioned
//! across the worker team; both curves are fitted on the root from globally
//! reduced means and broadcast, so every segment is corrected consistently.

use crate::comm::Communicator;
use crate::dsp::savgol::savitzky_golay;
use crate::dsp::stats::{clip, clip_to_odd, polyfit_eval, snr};
use crate::io::params::ParamsFile;
use crate::io::tiles::{self, scatter_npy_rows};
use anyhow::{bail, Context, Result};
use ndarray::{s, Array2};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RfiBandpassConfig {
    pub spect_path: PathBuf,
    pub out_path: PathBuf,
    pub params_path: PathBuf,
    pub work_dir: PathBuf,
    pub lower_fft_index: i64,
    pub upper_fft_index: i64,
    pub bandpass_window: i64,
    pub baseline_window: i64,
    pub rfi_std_cutoff: f64,
    /// Filter tuning 1 rather than tuning 0.
    pub tuning1: bool,
    pub num_workers: usize,
}

/// Fit a smooth curve to a bandpass (or baseline) profile.
///
/// The profile is first divided by a light Savitzky-Golay smoothing of
/// itself; points that stand out of that ratio by more than one sigma are
/// treated as interference and replaced with a degree-4 polynomial fitted to
/// the remaining points, after which the repaired profile is smoothed again.
fn bpf(x: &[f32], window: usize) -> Vec<f32> {
    let smooth = savitzky_golay(x, window, 1, 0);
    let ratio: Vec<f32> = x
        .iter()
        .zip(smooth.iter())
        .map(|(&v, &s)| if s != 0.0 { v / s } else { 0.0 })
        .collect();
    let mask: Vec<bool> = snr(&ratio).iter().map(|&v| v > 1.0).collect();

    let fitted = polyfit_eval(x, &mask, 4);
    let mut repaired = x.to_vec();
    for ((slot, &masked), &fit) in repaired.iter_mut().zip(mask.iter()).zip(fitted.iter()) {
        if masked {
            *slot = fit as f32;
        }
    }
    savitzky_golay(&repaired, window, 2, 0)
}

/// Row and column indices to excise, per the outlier rule on the axis means.
fn rfi_mask(row_means: &[f32], col_means: &[f32]) -> (Vec<usize>, Vec<usize>) {
    let flag = |means: &[f32]| -> Vec<usize> {
        let mut sorted = means.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let median = sorted[sorted.len() / 2];
        let cutoff = 2.0 * median - sorted[1.min(sorted.len() - 1)];
        means
            .iter()
            .enumerate()
            .filter(|&(_, &m)| m.abs() > cutoff)
            .map(|(i, _)| i)
            .collect()
    };
    (flag(row_means), flag(col_means))
}

pub fn run(config: &RfiBandpassConfig) -> Result<()> {
    let params = ParamsFile::load(&config.params_path)?;
    let dft_length = params.get_usize("Reduced DFT Data", "dftlength")?;

    let lower = clip(config.lower_fft_index, 0, dft_length as i64 - 2) as usize;
    let upper = clip(config.upper_fft_index, 0, dft_length as i64 - 2) as usize;
    let bp_window = clip_to_odd(config.bandpass_window, 1, 9999) as usize;
    let bl_window = clip_to_odd(config.baseline_window, 1, 9999) as usize;
    if bp_window as i64 != config.bandpass_window {
        warn!("bandpass window adjusted to {bp_window} (odd value required)");
    }
    if bl_window as i64 != config.baseline_window {
        warn!("baseline window adjusted to {bl_window} (odd value required)");
    }
    if upper <= lower {
        bail!("upper FFT cutoff must be greater than lower FFT cutoff");
    }

    // Record the bandpass selection for the search stage.
    let mut params = params;
    let tuning_suffix = if config.tuning1 { "1" } else { "0" };
    params.set(
        "RFI Bandpass",
        &format!("lowerfftindex{tuning_suffix}"),
        lower,
    );
    params.set(
        "RFI Bandpass",
        &format!("upperfftindex{tuning_suffix}"),
        upper,
    );
    params.set("RFI Bandpass", "bandpasswindow", bp_window);
    params.set("RFI Bandpass", "baselinewindow", bl_window);
    params.set("RFI Bandpass", "rfistdcutoff", config.rfi_std_cutoff);
    params
        .save(&config.params_path)
        .context("could not update common parameters file")?;

    let bandpass_length = upper - lower + 1;
    let filtered = std::sync::Mutex::new(None);
    let comm = Communicator::new(config.num_workers).with_scratch_dir(&config.work_dir);
    comm.run(|rank| {
        info!(rank = rank.rank(), "distributing spectrogram segments");
        let (segment, _sizes, offsets, shape) = scatter_npy_rows(&rank, 0, &config.spect_path)?;
        if shape.1 != dft_length {
            bail!(
                "spectrogram is {} channels wide, expected {dft_length}",
                shape.1
            );
        }
        let num_lines = shape.0;
        let offset = offsets[rank.rank()];

        // Trim to the bandpass and zero anything non-finite so a stray
        // NaN cannot poison the axis means.
        let mut segment: Array2<f32> = segment.slice(s![.., lower..=upper]).to_owned();
        segment.mapv_inplace(|v| if v.is_finite() { v } else { 0.0 });

        info!(rank = rank.rank(), "performing RFI and bandpass filtration on segment");

        // Global bandpass curve from the reduced column means.
        let col_sums: Vec<f32> = (0..bandpass_length)
            .map(|j| segment.column(j).sum())
            .collect();
        let col_sums = rank.allreduce_sum_f32(&col_sums);
        let col_means: Vec<f32> = col_sums.iter().map(|&s| s / num_lines as f32).collect();
        let bandpass: Vec<f32> = if rank.is_root() {
            let curve = bpf(&col_means, bp_window);
            rank.broadcast(0, Some(curve))
        } else {
            rank.broadcast(0, None)
        };

        // Global baseline curve from the reduced row means. Each rank owns a
        // disjoint row range, so a rank-ordered sum assembles the full curve.
        let mut row_means = vec![0.0f32; num_lines];
        for (t, row) in segment.rows().into_iter().enumerate() {
            row_means[offset + t] = row.mean().unwrap_or(0.0);
        }
        let row_means = rank.allreduce_sum_f32(&row_means);
        let baseline: Vec<f32> = if rank.is_root() {
            let curve = bpf(&row_means, bl_window);
            rank.broadcast(0, Some(curve))
        } else {
            rank.broadcast(0, None)
        };

        // Flatten: divide out the bandpass, subtract the baseline.
        for (t, mut row) in segment.rows_mut().into_iter().enumerate() {
            let bl = baseline[offset + t];
            for (j, value) in row.iter_mut().enumerate() {
                let bp = bandpass[j];
                if bp.is_finite() && bp != 0.0 {
                    *value /= bp;
                }
                *value -= bl;
                if !value.is_finite() {
                    *value = 0.0;
                }
            }
        }

        // Outlier excision from the corrected axis means.
        let col_sums: Vec<f32> = (0..bandpass_length)
            .map(|j| segment.column(j).sum())
            .collect();
        let col_sums = rank.allreduce_sum_f32(&col_sums);
        let col_means: Vec<f32> = col_sums.iter().map(|&s| s / num_lines as f32).collect();
        let mut row_means = vec![0.0f32; num_lines];
        for (t, row) in segment.rows().into_iter().enumerate() {
            row_means[offset + t] = row.mean().unwrap_or(0.0);
        }
        let row_means = rank.allreduce_sum_f32(&row_means);

        let (flag_rows, flag_cols) = if rank.is_root() {
            let masks = rfi_mask(&row_means, &col_means);
            info!(
                flagged_rows = masks.0.len(),
                flagged_cols = masks.1.len(),
                "excising flagged rows and columns"
            );
            rank.broadcast(0, Some(masks))
        } else {
            rank.broadcast(0, None)
        };

        // Mean of the surviving region, reduced as (sum, count).
        let mut partial = [0.0f32; 2];
        for (t, row) in segment.rows().into_iter().enumerate() {
            if flag_rows.binary_search(&(offset + t)).is_ok() {
                continue;
            }
            for (j, &value) in row.iter().enumerate() {
                if flag_cols.binary_search(&j).is_err() {
                    partial[0] += value;
                    partial[1] += 1.0;
                }
            }
        }
        let reduced = rank.allreduce_sum_f32(&partial);
        let clean_mean = if reduced[1] > 0.0 { reduced[0] / reduced[1] } else { 0.0 };

        segment.mapv_inplace(|v| v - clean_mean);
        for &t in &flag_rows {
            if t >= offset && t < offset + segment.nrows() {
                segment.row_mut(t - offset).fill(0.0);
            }
        }
        for &j in &flag_cols {
            segment.column_mut(j).fill(0.0);
        }

        info!(rank = rank.rank(), "re-integrating segments of filtered spectrogram");
        if let Some(full) = rank.gatherv_rows(0, segment) {
            *filtered.lock().unwrap() = Some(full);
        }
        Ok(())
    });

    let full = filtered
        .lock()
        .unwrap()
        .take()
        .context("filtered spectrogram was not gathered")?;
    info!("writing RFI and bandpass filtered spectrogram");
    tiles::write_matrix(&config.out_path, &full)?;
    Ok(())
}
