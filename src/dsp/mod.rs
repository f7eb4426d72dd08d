pub mod dispersion;
pub mod savgol;
pub mod sparse;
pub mod stats;
pub mod window;
