use std::f32::consts::PI;

/// Create Hann window, see e.g. https://en.wikipedia.org/wiki/Hann_function
pub fn create_hann_window(length: usize) -> Vec<f32> {
    (0..length)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / (length - 1) as f32).cos()))
        .collect()
}
