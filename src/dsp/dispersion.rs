//! Channel frequencies and cold-plasma dispersion delays.

/// Dispersion constant in MHz^2 s / (pc cm^-3).
pub const DISPERSION_CONSTANT: f64 = 4.148808e3;

/// Compute the channel center frequencies, in MHz, for the bandpass region
/// `[bot_index, top_index]` of a band of `num_bins` channels centered on
/// `center_freq` with total `bandwidth` (both in MHz).
///
/// Channel `k` of the full band is centered on
/// `center + (bandwidth / num_bins) * (k - num_bins / 2)`, matching the
/// fftshifted DFT layout of the spectrogram columns.
pub fn channel_freqs(
    center_freq: f64,
    bandwidth: f64,
    bot_index: usize,
    top_index: usize,
    num_bins: usize,
) -> Vec<f64> {
    let top_index = top_index.min(num_bins - 1);
    let bw_factor = bandwidth / (2.0 * num_bins as f64);
    (bot_index..=top_index)
        .map(|k| center_freq + bw_factor * (2.0 * k as f64 - num_bins as f64))
        .collect()
}

/// Relative dispersion delays, in seconds per unit DM, of each frequency with
/// respect to `top_freq` (default: the maximum of `freqs`). Frequencies are
/// in MHz. The delay of `top_freq` itself is exactly zero.
pub fn scale_delays(freqs: &[f64], top_freq: Option<f64>) -> Vec<f64> {
    let top = top_freq.unwrap_or_else(|| freqs.iter().cloned().fold(f64::MIN, f64::max));
    let inv_top_sqr = 1.0 / (top * top);
    freqs
        .iter()
        .map(|&f| DISPERSION_CONSTANT * (1.0 / (f * f) - inv_top_sqr))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_freqs_center_full_band() {
        let freqs = channel_freqs(60.0, 19.6, 0, 4095, 4096);
        assert_eq!(freqs.len(), 4096);
        // Channel N/2 sits on the tuning center.
        assert!((freqs[2048] - 60.0).abs() < 1e-9);
        let width = freqs[1] - freqs[0];
        assert!((width - 19.6 / 4096.0).abs() < 1e-9);
    }

    #[test]
    fn top_frequency_has_zero_delay() {
        let freqs = vec![40.0, 50.0, 60.0];
        let delays = scale_delays(&freqs, None);
        assert_eq!(delays[2], 0.0);
        assert!(delays[0] > delays[1] && delays[1] > 0.0);
    }

    #[test]
    fn delay_matches_cold_plasma_formula() {
        let delays = scale_delays(&[38.0], Some(74.0));
        let expected = 4.148808e3 * (1.0 / (38.0f64 * 38.0) - 1.0 / (74.0f64 * 74.0));
        assert!((delays[0] - expected).abs() < 1e-9);
    }
}
