//! De-dispersion search for single-pulse transients.
//!
//! For every trial DM the spectrogram rows, scattered across the worker team,
//! are shifted per channel by the dispersion delay and summed into one
//! de-dispersed time series (an allreduce across the team). Each rank then
//! searches the same series at its own matched pulse width by decimating with
//! a factor of 2^rank and thresholding in SNR units. Events stream to one
//! shared output file; ids are `{counter}_{rank}` so no coordination is
//! needed for uniqueness.

use crate::comm::{Communicator, SharedWriter};
use crate::dsp::dispersion::{channel_freqs, scale_delays};
use crate::dsp::stats::{decimate, mean, std_dev, EPSILON};
use crate::io::params::ParamsFile;
use crate::io::tiles::scatter_npy_rows;
use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct DedisperseConfig {
    pub spect_path: PathBuf,
    pub out_path: PathBuf,
    pub params_path: PathBuf,
    pub work_dir: PathBuf,
    pub dm_start: f64,
    pub dm_end: f64,
    pub dm_step: f64,
    /// Widest matched pulse width, in seconds.
    pub max_pulse_width: f64,
    pub snr_threshold: f64,
    /// Search tuning 1 rather than tuning 0.
    pub tuning1: bool,
    pub num_workers: usize,
}

/// One detected pulse, formatted as a fixed-column text record.
pub struct PulseSignal {
    pub pulse: String,
    pub snr: f64,
    pub dm: f64,
    pub time: f64,
    pub dtau: f64,
    pub dnu: f64,
    pub nu: f64,
    pub mean: f64,
    pub rms: f64,
    pub nu1: f64,
    pub nu2: f64,
}

impl fmt::Display for PulseSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:10}  {:10.6}  {:10.4}  {:10.6}  {:10.6}  {:.4}  {:.4}  {:.5}  {:.5}  {:.4}  {:.4}",
            self.pulse,
            self.snr,
            self.dm,
            self.time,
            self.dtau,
            self.dnu,
            self.nu,
            self.mean,
            self.rms,
            self.nu1,
            self.nu2,
        )
    }
}

/// Bandpass geometry shared by every DM trial.
struct Bandpass {
    center_freq: f64,
    channel_width: f64,
    bottom_freq: f64,
    top_freq: f64,
    /// Per-channel upper-edge frequencies plus the pinned top frequency.
    delay_freqs: Vec<f64>,
}

fn bandpass_geometry(params: &ParamsFile, tuning1: bool) -> Result<Bandpass> {
    let dft_length = params.get_usize("Reduced DFT Data", "dftlength")?;
    let bandwidth = params.get_f64("Raw Data", "samplerate")? / 1.0e6;
    let tuning_key = if tuning1 { "tuningfreq1" } else { "tuningfreq0" };
    let center_freq = params.get_f64("Raw Data", tuning_key)? / 1.0e6;

    let (mut lower, mut upper) = (0, dft_length - 1);
    let suffix = if tuning1 { "1" } else { "0" };
    if params.get("RFI Bandpass", &format!("lowerfftindex{suffix}")).is_some() {
        lower = params.get_usize("RFI Bandpass", &format!("lowerfftindex{suffix}"))?;
        upper = params.get_usize("RFI Bandpass", &format!("upperfftindex{suffix}"))?;
    }

    let channel_width = bandwidth / dft_length as f64;
    let ch_freqs = channel_freqs(center_freq, bandwidth, lower, upper, dft_length);
    let num_channels = ch_freqs.len();
    let bottom_freq = ch_freqs[0];
    let top_freq = ch_freqs[num_channels - 1] + channel_width;

    // Delays are evaluated at each channel's upper edge; the final entry pins
    // the top of the bandpass with zero delay.
    let mut delay_freqs: Vec<f64> = (0..num_channels)
        .map(|k| bottom_freq + channel_width * (k as f64 + 0.5))
        .collect();
    delay_freqs.push(top_freq);

    Ok(Bandpass {
        center_freq,
        channel_width,
        bottom_freq,
        top_freq,
        delay_freqs,
    })
}

pub fn run(config: &DedisperseConfig) -> Result<()> {
    if config.dm_start < 0.0 {
        bail!("DM start ({}) must be non-negative", config.dm_start);
    }
    if config.dm_end <= config.dm_start {
        bail!(
            "DM end ({}) must be greater than DM start ({})",
            config.dm_end,
            config.dm_start
        );
    }
    let mut params = ParamsFile::load(&config.params_path)?;
    let integration_time = params.get_f64("Reduced DFT Data", "integrationtime")?;
    let bandpass = bandpass_geometry(&params, config.tuning1)?;
    let num_channels = bandpass.delay_freqs.len() - 1;

    params.set("De-disperse Search", "dmstart", config.dm_start);
    params.set("De-disperse Search", "dmend", config.dm_end);
    params.set("De-disperse Search", "dmstep", config.dm_step);
    params.set("De-disperse Search", "maxpulsewidth", config.max_pulse_width);
    params
        .save(&config.params_path)
        .context("could not update common parameters file")?;

    // Scaled delays in units of the integration time; index num_channels is
    // the pinned top frequency with exactly zero delay.
    let scaled_delays: Vec<f64> = scale_delays(&bandpass.delay_freqs, Some(bandpass.top_freq))
        .iter()
        .map(|&d| d / integration_time)
        .collect();

    let num_trials = ((config.dm_end - config.dm_start) / config.dm_step).ceil() as usize;
    let search_ranks = (config.max_pulse_width / integration_time).log2().ceil() as i64 + 1;
    if search_ranks < 1 {
        warn!("max pulse width is below the integration time; no rank will search");
    }
    info!(
        trials = num_trials,
        channels = num_channels,
        search_ranks,
        "starting de-dispersion search"
    );

    let comm = Communicator::new(config.num_workers).with_scratch_dir(&config.work_dir);
    comm.run(|rank| {
        info!(rank = rank.rank(), "distributing spectrogram segments");
        let (segment, sizes, offsets, shape) = scatter_npy_rows(&rank, 0, &config.spect_path)?;
        if shape.1 != num_channels {
            bail!(
                "spectrogram is {} channels wide but the bandpass selects {num_channels}",
                shape.1
            );
        }
        let num_lines = shape.0;
        let (seg_rows, seg_offset) = (sizes[rank.rank()], offsets[rank.rank()]);

        let writer = rank.open_shared_writer(0, &config.out_path)?;

        // Worst-case shift for the whole sweep sizes the series once.
        let tb_max = (config.dm_end * scaled_delays[0]).floor() as usize;
        let mut ts = vec![0.0f32; tb_max + num_lines];
        let mut pulse_id: u64 = 0;

        for trial in 0..num_trials {
            let dm = config.dm_start + trial as f64 * config.dm_step;
            info!(rank = rank.rank(), "de-dispersion with DM = {dm}");

            let t_shifts: Vec<i64> = scaled_delays
                .iter()
                .map(|&d| (dm * d).floor() as i64)
                .collect();
            for k in 0..num_channels {
                let f_shift = (t_shifts[0] - t_shifts[k]) as usize;
                let begin = seg_offset + f_shift;
                for (slot, &value) in ts[begin..begin + seg_rows]
                    .iter_mut()
                    .zip(segment.column(k).iter())
                {
                    *slot += value;
                }
            }

            let ts_total = rank.allreduce_sum_f32(&ts);

            if (rank.rank() as i64) < search_ranks.min(63) {
                let ndown = 1usize << rank.rank();
                let cut_start = (t_shifts[0] as usize).min(num_lines);
                let dedispersed = decimate(&ts_total[cut_start..num_lines], ndown);
                if !dedispersed.is_empty() {
                    pulse_id = emit_pulses(
                        &writer,
                        &dedispersed,
                        dm,
                        ndown,
                        integration_time,
                        config.snr_threshold,
                        &bandpass,
                        rank.rank(),
                        pulse_id,
                    )?;
                }
            }

            ts.fill(0.0);
            rank.barrier();
        }
        Ok(())
    });
    info!("de-dispersion search complete");
    Ok(())
}

/// Threshold one de-dispersed, decimated series and append its events.
#[allow(clippy::too_many_arguments)]
fn emit_pulses(
    writer: &SharedWriter,
    series: &[f32],
    dm: f64,
    ndown: usize,
    integration_time: f64,
    threshold: f64,
    bandpass: &Bandpass,
    rank: usize,
    mut pulse_id: u64,
) -> Result<u64> {
    let series_mean = mean(series);
    let series_rms = std_dev(series).max(EPSILON);

    let mut found = 0usize;
    for (index, &value) in series.iter().enumerate() {
        let snr = (value as f64 - series_mean) / series_rms;
        if snr < threshold {
            continue;
        }
        let pulse = PulseSignal {
            pulse: format!("{pulse_id}_{rank}"),
            snr,
            dm,
            time: (index as f64 + 0.5) * integration_time * ndown as f64,
            dtau: integration_time * ndown as f64,
            dnu: bandpass.channel_width,
            nu: bandpass.center_freq,
            mean: series_mean,
            rms: series_rms,
            nu1: bandpass.bottom_freq,
            nu2: bandpass.top_freq,
        };
        writer.write_line(&pulse.to_string())?;
        pulse_id += 1;
        found += 1;
    }
    if found > 0 {
        info!(rank, found, dm, "pulses found, written to file");
    }
    Ok(pulse_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_record_is_fixed_column() {
        let pulse = PulseSignal {
            pulse: "3_1".to_string(),
            snr: 7.25,
            dm: 30.0,
            time: 5.0001,
            dtau: 0.002,
            dnu: 0.0048,
            nu: 60.0,
            mean: 0.00012,
            rms: 0.004,
            nu1: 58.8,
            nu2: 61.2,
        };
        let line = pulse.to_string();
        assert!(line.ends_with('\n'));
        let fields: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(fields.len(), 11);
        assert_eq!(fields[0], "3_1");
        assert_eq!(fields[2], "30.0000");
        assert_eq!(fields[4], "0.002000");
    }
}
