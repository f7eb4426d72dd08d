//! Savitzky-Golay smoothing.
//!
//! A Savitzky-Golay filter fits a low-order polynomial to a sliding window by
//! least squares and evaluates it (or one of its derivatives) at the window
//! center. It smooths broadband noise while preserving the shape of spectral
//! features far better than a moving average, which is what the bandpass and
//! baseline fits need.

use crate::dsp::stats::solve_linear;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Most kernels are reused thousands of times per run (once per spectrogram
/// column), so computed kernels are cached per process, keyed by
/// `(window, order, deriv)`.
const KERNEL_CACHE_CAPACITY: usize = 16;

static KERNEL_CACHE: Lazy<Mutex<HashMap<(usize, usize, usize), Arc<Vec<f64>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Compute the convolution kernel for `(window, order, deriv)`.
///
/// The kernel is row `deriv` of the pseudo-inverse of the Vandermonde design
/// matrix `B[i][j] = (i - half)^j`. Because `B` has full column rank the
/// pseudo-inverse reduces to the normal equations `(B^T B) x = e_deriv`, after
/// which `m[i] = sum_j x[j] (i - half)^j`.
fn compute_kernel(window: usize, order: usize, deriv: usize) -> Vec<f64> {
    let half = (window - 1) / 2;
    let n = order + 1;

    // B^T B depends only on the moment sums of the window offsets.
    let mut moments = vec![0.0f64; 2 * order + 1];
    for i in 0..window {
        let t = i as f64 - half as f64;
        let mut p = 1.0;
        for m in moments.iter_mut() {
            *m += p;
            p *= t;
        }
    }
    let normal: Vec<Vec<f64>> = (0..n).map(|a| (0..n).map(|b| moments[a + b]).collect()).collect();
    let mut rhs = vec![0.0f64; n];
    rhs[deriv] = 1.0;
    let coeffs = solve_linear(normal, rhs);

    (0..window)
        .map(|i| {
            let t = i as f64 - half as f64;
            let mut p = 1.0;
            let mut acc = 0.0;
            for &c in &coeffs {
                acc += c * p;
                p *= t;
            }
            acc
        })
        .collect()
}

fn kernel(window: usize, order: usize, deriv: usize) -> Arc<Vec<f64>> {
    let key = (window, order, deriv);
    let mut cache = KERNEL_CACHE.lock().unwrap();
    if let Some(found) = cache.get(&key) {
        return Arc::clone(found);
    }
    let computed = Arc::new(compute_kernel(window, order, deriv));
    if cache.len() < KERNEL_CACHE_CAPACITY {
        cache.insert(key, Arc::clone(&computed));
    }
    Arc::clone(&computed)
}

/// Smooth (and optionally differentiate) a series with a Savitzky-Golay filter.
///
/// An even `window` is rounded up to the next odd value, and the window never
/// drops below `order + 2`. The signal is extended on both ends with its
/// point-reflection (`2*y[0] - y[k]`) so the valid-mode convolution returns a
/// series of the input length without edge droop.
pub fn savitzky_golay(y: &[f32], window: usize, order: usize, deriv: usize) -> Vec<f32> {
    let mut window = if window % 2 == 0 { window + 1 } else { window };
    if window < order + 2 {
        window = order + 2;
        if window % 2 == 0 {
            window += 1;
        }
    }
    let half = (window - 1) / 2;
    let n = y.len();
    if n <= half {
        return y.to_vec();
    }

    let m = kernel(window, order, deriv);

    let mut padded = Vec::with_capacity(n + 2 * half);
    for i in 0..half {
        padded.push(2.0 * y[0] as f64 - y[half - i] as f64);
    }
    padded.extend(y.iter().map(|&v| v as f64));
    for i in 0..half {
        padded.push(2.0 * y[n - 1] as f64 - y[n - 2 - i] as f64);
    }

    // Valid-mode convolution; the kernel is reversed relative to a direct
    // correlation, which matters for odd derivatives.
    let mut out = Vec::with_capacity(n);
    for t in 0..n {
        let mut acc = 0.0f64;
        for (k, &mk) in m.iter().enumerate() {
            acc += mk * padded[t + (window - 1) - k];
        }
        out.push(acc as f32);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_affine_signals() {
        // SG(c*x + d) = c*SG(x) + d for polynomial signals up to the fit order.
        let x: Vec<f32> = (0..200).map(|i| 0.25 * i as f32 - 3.0).collect();
        let smoothed = savitzky_golay(&x, 11, 2, 0);
        for (a, b) in x.iter().zip(smoothed.iter()) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn even_window_rounds_up() {
        let x: Vec<f32> = (0..100).map(|i| (i as f32 * 0.1).sin()).collect();
        let even = savitzky_golay(&x, 10, 2, 0);
        let odd = savitzky_golay(&x, 11, 2, 0);
        assert_eq!(even, odd);
    }

    #[test]
    fn kernel_weights_sum_to_one() {
        let m = compute_kernel(11, 2, 0);
        let total: f64 = m.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn smooths_impulse_noise() {
        let mut x = vec![1.0f32; 101];
        x[50] = 100.0;
        let smoothed = savitzky_golay(&x, 21, 2, 0);
        assert!(smoothed[50] < 40.0);
    }
}
