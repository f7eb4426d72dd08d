//! Spectrogram builder: streams a DRX recording into per-worker waterfall
//! tiles, one set per tuning, and establishes the run parameters every later
//! stage reads.
//!
//! Each worker walks a strided sequence of contiguous file regions. One
//! output row integrates I groups of four frames: every frame is (optionally
//! Hann-windowed and) transformed with a length-N DFT, fftshifted so column 0
//! is the most negative frequency, and its power added to the accumulator of
//! its tuning. Rows are normalized by 4 * N * I on the way into the tile.

use crate::comm::Communicator;
use crate::dsp::dispersion::channel_freqs;
use crate::dsp::sparse::CsrMatrix;
use crate::dsp::stats::clip;
use crate::dsp::window::create_hann_window;
use crate::io::drx::{self, DrxReader};
use crate::io::params::ParamsFile;
use crate::io::tiles;
use crate::stages::inject::{create_injections, InjectionConfig};
use anyhow::{Context, Result};
use ndarray::Array2;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};

/// Number of complex samples per frame and DFT length.
pub const DFT_LENGTH: usize = drx::SAMPLES_PER_FRAME;

#[derive(Debug, Clone)]
pub struct WaterfallConfig {
    pub drx_path: PathBuf,
    pub work_dir: PathBuf,
    pub params_path: PathBuf,
    /// Spectral integration time per output row, in seconds.
    pub integration_time: f64,
    /// Aggregate memory budget for tile buffers, in megabytes.
    pub memory_limit_mb: i64,
    /// Fraction of the recording to reduce; negative values anchor the
    /// window at the end of the file.
    pub data_util_frac: f64,
    pub label: Option<String>,
    pub enable_hann: bool,
    pub num_workers: usize,
    /// Directory for large-broadcast temporaries; defaults to the work dir.
    pub scratch_dir: Option<PathBuf>,
    pub injections: Option<InjectionRequest>,
}

/// User-facing injection request; argument hygiene is applied in [`run`].
#[derive(Debug, Clone)]
pub struct InjectionRequest {
    pub power: f64,
    pub spectral_index: f64,
    pub time_span: (Option<f64>, Option<f64>),
    pub dm_span: (Option<f64>, Option<f64>),
    pub num_injects: usize,
    pub regular_times: bool,
    pub regular_dms: bool,
    pub seed: Option<u64>,
}

/// Run metadata captured from the first frames of the recording.
struct RawMetadata {
    file_size: u64,
    num_frames: usize,
    num_frames_per_tune: usize,
    sample_rate: f64,
    beam: u8,
    tuning_freq: [f64; 2],
}

/// Quantities derived from the raw metadata and the user's request.
struct Derived {
    /// Groups of four frames integrated into one output row.
    dfts_per_line: usize,
    /// Total output rows across the whole run.
    num_lines: usize,
    /// Rows per tile.
    lines_per_tile: usize,
    /// Rows skipped from the start of the file (negative utilization).
    skip_lines: usize,
    data_util_frac: f64,
}

fn read_metadata(config: &WaterfallConfig) -> Result<RawMetadata> {
    let file_size = std::fs::metadata(&config.drx_path)
        .with_context(|| {
            format!(
                "DRX file {} not found or could not be opened",
                config.drx_path.display()
            )
        })?
        .len();
    let num_frames = (file_size / drx::FRAME_SIZE as u64) as usize;
    let num_frames_per_tune = num_frames / drx::FRAMES_PER_BEAM;

    let mut sample_rate = drx::BASE_CLOCK / 10.0;
    let mut beam = 0u8;
    let mut tuning_freq = [0.0f64; 2];
    if num_frames == 0 {
        warn!("DRX file contains no complete frames; using default metadata");
    } else {
        let mut reader = DrxReader::open(&config.drx_path)?;
        // The first four frames carry both tunings of one time slot.
        for _ in 0..drx::FRAMES_PER_BEAM.min(num_frames) {
            let frame = match reader.read_frame()? {
                Some(frame) => frame,
                None => break,
            };
            sample_rate = frame.sample_rate();
            beam = frame.beam;
            if frame.pol == 0 {
                tuning_freq[frame.tune.min(1) as usize] = frame.central_freq();
            }
        }
    }

    Ok(RawMetadata {
        file_size,
        num_frames,
        num_frames_per_tune,
        sample_rate,
        beam,
        tuning_freq,
    })
}

fn derive(config: &WaterfallConfig, raw: &RawMetadata, memory_limit: f64) -> Derived {
    let mut data_util_frac = config.data_util_frac;
    if data_util_frac == 0.0 || data_util_frac.abs() > 1.0 {
        warn!("invalid value for data utilization; forcing to 1.0");
        data_util_frac = 1.0;
    }

    let frame_time = DFT_LENGTH as f64 / raw.sample_rate;
    let dfts_per_line = ((config.integration_time / frame_time) as usize).max(1);
    let max_lines = (raw.num_frames_per_tune / dfts_per_line).max(1);
    let num_lines = ((data_util_frac.abs() * max_lines as f64) as usize).max(1);

    let mem_lines =
        (memory_limit / (2 * config.num_workers * DFT_LENGTH * 4) as f64) as usize;
    let lines_per_tile = (num_lines / config.num_workers).min(mem_lines).max(1);

    let skip_lines = if data_util_frac < 0.0 {
        ((1.0 + data_util_frac) * max_lines as f64).ceil() as usize
    } else {
        0
    };

    Derived {
        dfts_per_line,
        num_lines,
        lines_per_tile,
        skip_lines,
        data_util_frac,
    }
}

fn write_params(
    config: &WaterfallConfig,
    raw: &RawMetadata,
    derived: &Derived,
    injections: &Option<InjectionConfig>,
) -> Result<()> {
    let mut params = ParamsFile::new();
    let filename = config
        .drx_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    params.set("Raw Data", "filepath", config.drx_path.display());
    params.set("Raw Data", "filename", filename);
    params.set("Raw Data", "filesize", raw.file_size);
    params.set("Raw Data", "framesize", drx::FRAME_SIZE);
    params.set("Raw Data", "numframes", raw.num_frames);
    params.set("Raw Data", "numframesperbeam", drx::FRAMES_PER_BEAM);
    params.set("Raw Data", "numframespertune", raw.num_frames_per_tune);
    params.set("Raw Data", "numsamplesperframe", drx::SAMPLES_PER_FRAME);
    params.set("Raw Data", "samplerate", raw.sample_rate);
    params.set("Raw Data", "sampletime", 1.0 / raw.sample_rate);
    params.set("Raw Data", "frametime", DFT_LENGTH as f64 / raw.sample_rate);
    params.set("Raw Data", "tuningfreq0", raw.tuning_freq[0]);
    params.set("Raw Data", "tuningfreq1", raw.tuning_freq[1]);
    params.set("Raw Data", "beam", raw.beam);
    params.set("Raw Data", "datautilfrac", derived.data_util_frac);

    params.set("Reduced DFT Data", "dftlength", DFT_LENGTH);
    params.set("Reduced DFT Data", "integrationtime", config.integration_time);
    params.set("Reduced DFT Data", "numspectrogramlines", derived.num_lines);
    params.set("Reduced DFT Data", "numdftsperspectrogramline", derived.dfts_per_line);
    params.set("Reduced DFT Data", "numspectrogramlinespertile", derived.lines_per_tile);
    let whole_tiles = config.num_workers * derived.lines_per_tile;
    params.set(
        "Reduced DFT Data",
        "numspectrogramlinesresiduetile",
        derived.num_lines.saturating_sub(whole_tiles),
    );
    params.set("Reduced DFT Data", "enablehannwindow", config.enable_hann);

    params.set("Run", "label", config.label.clone().unwrap_or_default());

    if let Some(inj) = injections {
        params.set("Injections", "numinjects", inj.num_injects);
        params.set("Injections", "injectpower", inj.total_power);
        params.set("Injections", "injectspectralindex", inj.spectral_index);
        params.set(
            "Injections",
            "injecttemporalprofile",
            format!(
                "{} {}",
                inj.time_span.0.unwrap_or(f64::NAN),
                inj.time_span.1.unwrap_or(f64::NAN)
            ),
        );
        params.set(
            "Injections",
            "injectdmprofile",
            format!(
                "{} {}",
                inj.dm_span.0.unwrap_or(f64::NAN),
                inj.dm_span.1.unwrap_or(f64::NAN)
            ),
        );
    }

    params
        .save(&config.params_path)
        .context("could not open or write common parameters file")?;
    Ok(())
}

/// Apply the argument hygiene of the injection request and convert it to a
/// generator configuration. The generator receives the power premultiplied
/// by the builder's normalization factor 4 * N * I.
fn injection_config(config: &WaterfallConfig, dfts_per_line: usize) -> Option<InjectionConfig> {
    let request = config.injections.as_ref()?;
    let power = request.power.max(0.0);
    let num_injects = if power == 0.0 {
        0
    } else {
        clip(request.num_injects as i64, 0, 50) as usize
    };
    if num_injects == 0 {
        return None;
    }
    Some(InjectionConfig {
        total_power: power * (4 * DFT_LENGTH * dfts_per_line) as f64,
        spectral_index: clip(request.spectral_index, -2.0, 2.0),
        time_span: request.time_span,
        dm_span: request.dm_span,
        num_injects,
        regular_times: request.regular_times,
        regular_dms: request.regular_dms,
        seed: request.seed,
    })
}

/// Build the waterfall tiles for both tunings and write the run parameters.
pub fn run(config: &WaterfallConfig) -> Result<()> {
    let memory_limit = clip(config.memory_limit_mb, 100, 64000) as f64 * 1e6;
    let raw = read_metadata(config)?;
    let derived = derive(config, &raw, memory_limit);
    info!(
        lines = derived.num_lines,
        lines_per_tile = derived.lines_per_tile,
        dfts_per_line = derived.dfts_per_line,
        "reducing {} frames",
        raw.num_frames
    );

    let inj_config = injection_config(config, derived.dfts_per_line);
    write_params(config, &raw, &derived, &inj_config)?;

    // Injection spectrograms are built once and broadcast to the team.
    let bandwidth = raw.sample_rate / 1.0e6;
    let channel_width = bandwidth / DFT_LENGTH as f64;
    let frame_time = DFT_LENGTH as f64 / raw.sample_rate;
    let mut injections: [Option<CsrMatrix>; 2] = [None, None];
    if let Some(inj) = &inj_config {
        for tune in 0..2 {
            info!(tune, "generating waterfall injections");
            let freqs = channel_freqs(
                raw.tuning_freq[tune] / 1.0e6,
                bandwidth,
                0,
                DFT_LENGTH - 1,
                DFT_LENGTH,
            );
            injections[tune] = create_injections(
                &freqs,
                channel_width,
                raw.num_frames_per_tune,
                frame_time,
                inj,
            );
        }
    }
    let has_injections = injections[0].is_some() || injections[1].is_some();
    let [inj0, inj1] = injections;
    let inj_cells = [Mutex::new(inj0), Mutex::new(inj1)];

    let scratch = config
        .scratch_dir
        .clone()
        .unwrap_or_else(|| config.work_dir.clone());
    let comm = Communicator::new(config.num_workers).with_scratch_dir(scratch);
    comm.run(|rank| {
        let injections: [Option<CsrMatrix>; 2] = if has_injections {
            let mut out = [None, None];
            for tune in 0..2 {
                info!(rank = rank.rank(), tune, "broadcasting injections");
                let local = rank
                    .is_root()
                    .then(|| inj_cells[tune].lock().unwrap().take())
                    .flatten();
                out[tune] = Some(CsrMatrix::broadcast(&rank, 0, local)?);
            }
            out
        } else {
            [None, None]
        };
        build_tiles(rank.rank(), rank.size(), config, &raw, &derived, &injections)
    });

    info!("Done creating waterfall!");
    Ok(())
}

/// Produce every tile owned by one worker.
fn build_tiles(
    rank: usize,
    num_workers: usize,
    config: &WaterfallConfig,
    raw: &RawMetadata,
    derived: &Derived,
    injections: &[Option<CsrMatrix>; 2],
) -> Result<()> {
    let n = DFT_LENGTH;
    let dfts_per_line = derived.dfts_per_line;
    let bytes_per_line = (drx::FRAMES_PER_BEAM * drx::FRAME_SIZE * dfts_per_line) as u64;
    let base_offset = derived.skip_lines as u64 * bytes_per_line;
    let norm_factor = (drx::FRAMES_PER_BEAM * n * dfts_per_line) as f32;

    let mut reader = DrxReader::open(&config.drx_path)?;
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n);
    let hann = config.enable_hann.then(|| create_hann_window(n));

    let mut dft_buf = vec![Complex::<f32>::new(0.0, 0.0); n];
    let mut group_power = [vec![0.0f32; n], vec![0.0f32; n]];
    let mut line_power = [vec![0.0f32; n], vec![0.0f32; n]];

    let mut eof = false;
    let mut tile_start = rank * derived.lines_per_tile;
    while tile_start < derived.num_lines {
        let tile_rows = derived.lines_per_tile.min(derived.num_lines - tile_start);
        info!(
            rank,
            "integrating lines {tile_start} to {}",
            tile_start + tile_rows - 1
        );
        let mut tile = [
            Array2::<f32>::zeros((tile_rows, n)),
            Array2::<f32>::zeros((tile_rows, n)),
        ];
        if !eof {
            reader.seek_to(base_offset + tile_start as u64 * bytes_per_line)?;
        }

        for row in 0..tile_rows {
            line_power[0].fill(0.0);
            line_power[1].fill(0.0);
            for group in 0..dfts_per_line {
                if !eof {
                    group_power[0].fill(0.0);
                    group_power[1].fill(0.0);
                    let mut frames_read = 0;
                    while frames_read < drx::FRAMES_PER_BEAM {
                        match reader.read_frame()? {
                            Some(frame) => {
                                accumulate_frame_power(
                                    &frame,
                                    hann.as_deref(),
                                    fft.as_ref(),
                                    &mut dft_buf,
                                    &mut group_power[frame.tune.min(1) as usize],
                                );
                                frames_read += 1;
                            }
                            None => {
                                // End of recording inside a group: the
                                // partially integrated group is discarded and
                                // the remaining rows stay zero.
                                eof = true;
                                break;
                            }
                        }
                    }
                    if !eof {
                        for tune in 0..2 {
                            for (acc, &p) in line_power[tune].iter_mut().zip(&group_power[tune]) {
                                *acc += p;
                            }
                        }
                    }
                }
                // Injected power is deposited per raw DFT regardless of how
                // much real data the recording supplied.
                let global_group = (tile_start + row) * dfts_per_line + group;
                for tune in 0..2 {
                    if let Some(inj) = &injections[tune] {
                        if global_group < inj.shape().0 {
                            inj.add_row_into(global_group, &mut line_power[tune]);
                        }
                    }
                }
            }
            for tune in 0..2 {
                for (slot, &p) in tile[tune]
                    .row_mut(row)
                    .iter_mut()
                    .zip(line_power[tune].iter())
                {
                    *slot = p / norm_factor;
                }
            }
        }

        for tune in 0..2 {
            let path = tiles::tile_filepath(
                &config.work_dir,
                config.label.as_deref(),
                tile_start,
                raw.beam,
                tune as u8,
            );
            info!(rank, tune, "writing spectrogram tile {}", path.display());
            tiles::write_matrix(&path, &tile[tune])?;
        }
        tile_start += num_workers * derived.lines_per_tile;
    }
    Ok(())
}

/// DFT one frame, fftshift, and add its power into `power`.
fn accumulate_frame_power(
    frame: &drx::Frame,
    hann: Option<&[f32]>,
    fft: &dyn rustfft::Fft<f32>,
    dft_buf: &mut [Complex<f32>],
    power: &mut [f32],
) {
    let n = dft_buf.len();
    match hann {
        Some(window) => {
            for ((slot, &sample), &w) in dft_buf.iter_mut().zip(&frame.iq).zip(window) {
                *slot = sample * w;
            }
        }
        None => dft_buf.copy_from_slice(&frame.iq),
    }
    fft.process(dft_buf);
    for (k, value) in dft_buf.iter().enumerate() {
        power[(k + n / 2) % n] += value.norm_sqr();
    }
}
