use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use radiotrans::stages::combine::{self, CombineConfig};
use radiotrans::stages::dedisperse::{self, DedisperseConfig};
use radiotrans::stages::rfibandpass::{self, RfiBandpassConfig};
use radiotrans::stages::waterfall::{self, InjectionRequest, WaterfallConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "radiotrans",
    version,
    about = "Offline transient search pipeline for dual-tuning DRX radio voltage recordings"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reduce a DRX recording into per-worker spectrogram tiles
    Waterfall(WaterfallArgs),
    /// Concatenate spectrogram tiles into one combined spectrogram
    Combine(CombineArgs),
    /// RFI and bandpass filter a combined spectrogram
    Rfibandpass(RfiBandpassArgs),
    /// De-dispersion search of a filtered spectrogram
    Dedisperse(DedisperseArgs),
}

#[derive(Args)]
struct WaterfallArgs {
    /// Path to the raw DRX data file
    radio_filepath: PathBuf,

    /// Spectral integration time in milliseconds
    #[arg(short = 't', long = "integrate-time", default_value_t = 1.0, value_name = "MSECS")]
    integrate_time: f64,

    /// Working directory path
    #[arg(short = 'w', long = "work-dir", default_value = ".", value_name = "PATH")]
    work_dir: PathBuf,

    /// Common parameters file path
    #[arg(short = 'c', long = "commconfig", default_value = "./radiotrans.ini", value_name = "PATH")]
    commconfig: PathBuf,

    /// Total memory usage limit, in MB, for all workers' tile buffers
    #[arg(short = 'm', long = "memory-limit", default_value_t = 16, value_name = "MB")]
    memory_limit: i64,

    /// Label attached to output files to help identify them to the user
    #[arg(short = 'l', long = "label", value_name = "LABEL")]
    label: Option<String>,

    /// Apply a Hann window to raw data DFTs to reduce harmonic leakage
    #[arg(short = 'e', long = "enable-hann")]
    enable_hann: bool,

    /// Fraction (0 < |x| <= 1.0) of total spectrogram lines to create
    #[arg(short = 'u', long = "data-utilization", default_value_t = 1.0, value_name = "FRAC")]
    data_utilization: f64,

    /// Number of parallel workers
    #[arg(long = "num-workers", default_value_t = num_cpus::get(), value_name = "NUM")]
    num_workers: usize,

    /// Directory for large-broadcast temporary files
    #[arg(long = "scratch-dir", value_name = "PATH")]
    scratch_dir: Option<PathBuf>,

    /// Number of simulated burst signals to inject
    #[arg(long = "num-injections", default_value_t = 0, value_name = "NUM")]
    num_injections: usize,

    /// Total spectral power of injected simulated burst signals
    #[arg(long = "inject-power", default_value_t = 10.0, value_name = "POWR")]
    inject_power: f64,

    /// Spectral index for injected simulated burst signals
    #[arg(long = "inject-spectral-index", default_value_t = 0.0, value_name = "INDEX")]
    inject_spectral_index: f64,

    /// Time span in data, (BEGIN END) in seconds, containing injections
    #[arg(long = "injection-time-span", num_args = 2, value_names = ["BEGIN", "END"])]
    injection_time_span: Option<Vec<f64>>,

    /// Range of DMs, (BEGIN END) in pc cm^-3, spanned by injections
    #[arg(long = "injection-dm-span", num_args = 2, value_names = ["BEGIN", "END"])]
    injection_dm_span: Option<Vec<f64>>,

    /// Inject simulated signals at regular time intervals
    #[arg(long = "inject-regular-times")]
    inject_regular_times: bool,

    /// Inject simulated signals at regular DM intervals
    #[arg(long = "inject-regular-dms")]
    inject_regular_dms: bool,

    /// Seed for random injection placement
    #[arg(long = "inject-seed", value_name = "SEED")]
    inject_seed: Option<u64>,
}

#[derive(Args)]
struct CombineArgs {
    /// Paths to the waterfall tiles of one tuning
    tiles: Vec<PathBuf>,

    /// Path of the output combined spectrogram file
    #[arg(short = 'o', long = "outfile", default_value = "./spectrogram.npy", value_name = "PATH")]
    outfile: PathBuf,

    /// Working directory path
    #[arg(short = 'w', long = "work-dir", default_value = ".", value_name = "PATH")]
    work_dir: PathBuf,

    /// Common parameters file path
    #[arg(short = 'c', long = "commconfig", default_value = "./radiotrans.ini", value_name = "PATH")]
    commconfig: PathBuf,
}

#[derive(Args)]
struct RfiBandpassArgs {
    /// Path to the combined spectrogram file
    spectrogram: PathBuf,

    /// Lower FFT index for bandpass filtering
    #[arg(short = 'l', long = "lower-fft-index", default_value_t = 0, value_name = "INDEX")]
    lower_fft_index: i64,

    /// Upper FFT index for bandpass filtering
    #[arg(short = 'u', long = "upper-fft-index", default_value_t = 4094, value_name = "INDEX")]
    upper_fft_index: i64,

    /// Working directory path
    #[arg(short = 'w', long = "work-dir", default_value = ".", value_name = "PATH")]
    work_dir: PathBuf,

    /// Common parameters file path
    #[arg(short = 'c', long = "commconfig", default_value = "./radiotrans.ini", value_name = "PATH")]
    commconfig: PathBuf,

    /// Path to the output file
    #[arg(short = 'o', long = "output-file", default_value = "./rfibp-spectrogram.npy", value_name = "PATH")]
    output_file: PathBuf,

    /// Bandpass smoothing window size; must be a positive odd number
    #[arg(long = "bandpass-window", default_value_t = 11, value_name = "INT")]
    bandpass_window: i64,

    /// Baseline smoothing window size; must be a positive odd number
    #[arg(long = "baseline-window", default_value_t = 51, value_name = "INT")]
    baseline_window: i64,

    /// Standard-deviation cutoff recorded for downstream excision
    #[arg(long = "rfi-std-cutoff", default_value_t = 5.0, value_name = "STD")]
    rfi_std_cutoff: f64,

    /// Filter tuning 1 rather than tuning 0
    #[arg(long = "tuning1")]
    tuning1: bool,

    /// Number of parallel workers
    #[arg(long = "num-workers", default_value_t = num_cpus::get(), value_name = "NUM")]
    num_workers: usize,
}

#[derive(Args)]
struct DedisperseArgs {
    /// Path to the filtered spectrogram file
    spectrogram: PathBuf,

    /// Working directory path
    #[arg(short = 'w', long = "work-dir", default_value = ".", value_name = "PATH")]
    work_dir: PathBuf,

    /// Common parameters file path
    #[arg(short = 'c', long = "commconfig", default_value = "./radiotrans.ini", value_name = "PATH")]
    commconfig: PathBuf,

    /// Path to the output file of transient events
    #[arg(short = 'o', long = "output-file", default_value = "./transients.txt", value_name = "PATH")]
    output_file: PathBuf,

    /// Maximum pulse width to search, in seconds
    #[arg(short = 'p', long = "max-pulse-width", default_value_t = 1.0, value_name = "SECS")]
    max_pulse_width: f64,

    /// SNR lower-bound cutoff threshold
    #[arg(short = 't', long = "snr-threshold", default_value_t = 5.0, value_name = "SNR")]
    snr_threshold: f64,

    /// Search tuning 1 rather than tuning 0
    #[arg(long = "tuning1")]
    tuning1: bool,

    /// Starting dispersion measure value
    #[arg(short = 's', long = "dm-start", value_name = "DM")]
    dm_start: f64,

    /// Ending dispersion measure value
    #[arg(short = 'e', long = "dm-end", default_value_t = 1000.0, value_name = "DM")]
    dm_end: f64,

    /// Interval step-size for the dispersion measure search
    #[arg(long = "dm-step", default_value_t = 1.0, value_name = "STEP")]
    dm_step: f64,

    /// Number of parallel workers
    #[arg(long = "num-workers", default_value_t = num_cpus::get(), value_name = "NUM")]
    num_workers: usize,
}

fn span_pair(values: &Option<Vec<f64>>) -> (Option<f64>, Option<f64>) {
    match values.as_deref() {
        Some([begin, end]) => (Some(*begin), Some(*end)),
        _ => (None, None),
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Waterfall(args) => {
            let injections = (args.num_injections > 0).then(|| InjectionRequest {
                power: args.inject_power,
                spectral_index: args.inject_spectral_index,
                time_span: span_pair(&args.injection_time_span),
                dm_span: span_pair(&args.injection_dm_span),
                num_injects: args.num_injections,
                regular_times: args.inject_regular_times,
                regular_dms: args.inject_regular_dms,
                seed: args.inject_seed,
            });
            waterfall::run(&WaterfallConfig {
                drx_path: args.radio_filepath,
                work_dir: args.work_dir,
                params_path: args.commconfig,
                integration_time: args.integrate_time / 1000.0,
                memory_limit_mb: args.memory_limit,
                data_util_frac: args.data_utilization,
                label: args.label,
                enable_hann: args.enable_hann,
                num_workers: args.num_workers.max(1),
                scratch_dir: args.scratch_dir,
                injections,
            })
        }
        Command::Combine(args) => combine::run(&CombineConfig {
            tile_paths: args.tiles,
            out_path: args.outfile,
            params_path: args.commconfig,
        }),
        Command::Rfibandpass(args) => rfibandpass::run(&RfiBandpassConfig {
            spect_path: args.spectrogram,
            out_path: args.output_file,
            params_path: args.commconfig,
            work_dir: args.work_dir,
            lower_fft_index: args.lower_fft_index,
            upper_fft_index: args.upper_fft_index,
            bandpass_window: args.bandpass_window,
            baseline_window: args.baseline_window,
            rfi_std_cutoff: args.rfi_std_cutoff,
            tuning1: args.tuning1,
            num_workers: args.num_workers.max(1),
        }),
        Command::Dedisperse(args) => dedisperse::run(&DedisperseConfig {
            spect_path: args.spectrogram,
            out_path: args.output_file,
            params_path: args.commconfig,
            work_dir: args.work_dir,
            dm_start: args.dm_start,
            dm_end: args.dm_end,
            dm_step: args.dm_step,
            max_pulse_width: args.max_pulse_width,
            snr_threshold: args.snr_threshold,
            tuning1: args.tuning1,
            num_workers: args.num_workers.max(1),
        }),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = dispatch(cli) {
        // A fatal error in any stage aborts the whole run with the tagged
        // diagnostic and exit code 1.
        radiotrans::comm::abort(0, &err);
    }
}
