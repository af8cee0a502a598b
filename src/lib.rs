pub mod acoustic;
pub mod analyzer;
pub mod combine;
pub mod config;
pub mod geometry;
pub mod optimize;
pub mod tuning;
pub mod validate;

/// Application name for XDG paths
pub const APP_NAME: &str = "traverso";

/// Label given to the headjoint's first hole, which is also the acoustic source.
pub const EMBOUCHURE_LABEL: &str = "embouchure";

pub const MM_TO_M: f64 = 1e-3;
pub const M_TO_MM: f64 = 1e3;

/// Default embouchure chimney height (mm) when the data does not provide one.
pub const DEFAULT_EMBOUCHURE_CHIMNEY_MM: f64 = 5.0;
/// Default tone-hole chimney height (mm) when the data does not provide one.
pub const DEFAULT_CHIMNEY_MM: f64 = 3.0;
/// Outer diameter estimate from inner diameter when missing.
pub const DEFAULT_DIAMETER_OUT_FACTOR: f64 = 1.2;

/// File name of the fingering chart looked up next to flute directories.
pub const DEFAULT_FINGERING_CHART: &str = "traverso_fingerchart.txt";
