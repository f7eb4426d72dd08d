pub mod combine;
pub mod dedisperse;
pub mod inject;
pub mod rfibandpass;
pub mod waterfall;
