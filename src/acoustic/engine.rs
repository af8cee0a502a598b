//! The boundary to the acoustic solver.
//!
//! An [`AcousticEngine`] turns a geometry, a note and a frequency list into
//! an input impedance per frequency. Everything above this trait is
//! solver-agnostic.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::AcousticInputSet;
use crate::tuning;

/// Floor on |Z| before taking `20 log10 |1/Z|`.
const MIN_IMPEDANCE_MAGNITUDE: f64 = 1e-12;
/// Air density at 0 C, 1 atm (kg/m^3).
const AIR_DENSITY_0C: f64 = 1.2929;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("invalid engine request: {0}")]
    InvalidRequest(String),
    #[error("note '{0}' is not in the fingering chart")]
    UnknownNote(String),
    #[error("source hole '{0}' is not in the side-hole table")]
    MissingSource(String),
    #[error("solver failure at {frequency} Hz: {message}")]
    Solver { frequency: f64, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Radiation {
    Closed,
    Unflanged,
    InfiniteFlanged,
}

/// Boundary conditions at the cork end, the tone holes and the foot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadiationConditions {
    pub entrance: Radiation,
    pub holes: Radiation,
    pub bell: Radiation,
}

impl Default for RadiationConditions {
    fn default() -> Self {
        Self {
            entrance: Radiation::Closed,
            holes: Radiation::Unflanged,
            bell: Radiation::Unflanged,
        }
    }
}

/// Physical conditions of a computation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicsOptions {
    pub temperature_c: f64,
    pub losses: bool,
    /// Relative humidity, 0..1.
    pub humidity: f64,
    pub radiation: RadiationConditions,
}

impl PhysicsOptions {
    pub fn at(temperature_c: f64) -> Self {
        Self {
            temperature_c,
            ..Self::default()
        }
    }

    pub fn speed_of_sound(&self) -> f64 {
        tuning::speed_of_sound(self.temperature_c)
    }

    /// Air density (kg/m^3) at 1 atm.
    pub fn air_density(&self) -> f64 {
        AIR_DENSITY_0C * 273.15 / (273.15 + self.temperature_c)
    }

    /// Characteristic impedance `rho c / S` of a cross-section (m^2).
    pub fn characteristic_impedance(&self, section_m2: f64) -> f64 {
        self.air_density() * self.speed_of_sound() / section_m2
    }
}

impl Default for PhysicsOptions {
    fn default() -> Self {
        Self {
            temperature_c: 25.0,
            losses: true,
            humidity: 0.5,
            radiation: RadiationConditions::default(),
        }
    }
}

/// How the instrument is excited: a flute player at the embouchure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerConfig {
    pub source_label: String,
    pub radiation: Radiation,
    /// Cross-section of the source opening (m^2), used to normalize Z.
    pub section_m2: f64,
}

impl PlayerConfig {
    pub fn flute(source_label: impl Into<String>, radius_m: f64) -> Self {
        Self {
            source_label: source_label.into(),
            radiation: Radiation::InfiniteFlanged,
            section_m2: std::f64::consts::PI * radius_m * radius_m,
        }
    }

    /// A flute player blowing across the embouchure hole of `inputs`.
    pub fn at_embouchure(inputs: &AcousticInputSet) -> Result<Self, EngineError> {
        let hole = inputs
            .hole(crate::EMBOUCHURE_LABEL)
            .ok_or_else(|| EngineError::MissingSource(crate::EMBOUCHURE_LABEL.to_string()))?;
        Ok(Self::flute(crate::EMBOUCHURE_LABEL, hole.radius_m))
    }
}

/// Evenly spaced frequency grid, both ends included when they land on it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencySweep {
    pub start_hz: f64,
    pub stop_hz: f64,
    pub step_hz: f64,
}

impl Default for FrequencySweep {
    fn default() -> Self {
        Self {
            start_hz: 100.0,
            stop_hz: 5000.0,
            step_hz: 2.0,
        }
    }
}

impl FrequencySweep {
    pub fn frequencies(&self) -> Vec<f64> {
        if self.step_hz <= 0.0 || self.stop_hz < self.start_hz {
            return Vec::new();
        }
        let n = ((self.stop_hz - self.start_hz) / self.step_hz + 1e-9).floor() as usize + 1;
        (0..n)
            .map(|i| self.start_hz + i as f64 * self.step_hz)
            .collect()
    }
}

/// Everything an engine needs for one computation.
#[derive(Debug, Clone, Copy)]
pub struct EngineRequest<'a> {
    pub inputs: &'a AcousticInputSet,
    pub note: &'a str,
    pub frequencies: &'a [f64],
    pub player: &'a PlayerConfig,
    pub physics: &'a PhysicsOptions,
    /// Also compute pressure and flow along the bore on this grid step (m).
    pub mode_shape_grid_m: Option<f64>,
}

pub trait AcousticEngine: Send + Sync {
    fn compute(&self, request: &EngineRequest<'_>) -> Result<AcousticResponse, EngineError>;
}

/// Pressure and flow along the bore, one row per frequency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeShapes {
    pub x_m: Vec<f64>,
    pub frequencies: Vec<f64>,
    pub pressure: Vec<Vec<Complex64>>,
    pub flow: Vec<Vec<Complex64>>,
}

/// Admittance magnitude in dB over a sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmittanceCurve {
    pub frequencies: Vec<f64>,
    pub admittance_db: Vec<f64>,
}

/// Input impedance of one note over a frequency list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcousticResponse {
    pub note: String,
    frequencies: Vec<f64>,
    impedance: Vec<Complex64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode_shapes: Option<ModeShapes>,
}

impl AcousticResponse {
    pub fn new(note: impl Into<String>, frequencies: Vec<f64>, impedance: Vec<Complex64>) -> Self {
        debug_assert_eq!(frequencies.len(), impedance.len());
        Self {
            note: note.into(),
            frequencies,
            impedance,
            mode_shapes: None,
        }
    }

    pub fn with_mode_shapes(mut self, shapes: ModeShapes) -> Self {
        self.mode_shapes = Some(shapes);
        self
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn impedance(&self) -> &[Complex64] {
        &self.impedance
    }

    pub fn mode_shapes(&self) -> Option<&ModeShapes> {
        self.mode_shapes.as_ref()
    }

    pub fn admittance(&self) -> Vec<Complex64> {
        self.impedance.iter().map(|z| z.inv()).collect()
    }

    /// `20 log10 |1/Z|`, with |Z| floored to keep the curve finite.
    pub fn admittance_db(&self) -> Vec<f64> {
        self.impedance
            .iter()
            .map(|z| -20.0 * z.norm().max(MIN_IMPEDANCE_MAGNITUDE).log10())
            .collect()
    }

    pub fn admittance_curve(&self) -> AdmittanceCurve {
        AdmittanceCurve {
            frequencies: self.frequencies.clone(),
            admittance_db: self.admittance_db(),
        }
    }

    /// The first `k` antiresonances (impedance minima): frequencies where the
    /// reactance crosses zero going from negative to positive, linearly
    /// interpolated between grid points.
    pub fn antiresonance_frequencies(&self, k: usize) -> Vec<f64> {
        let mut found = Vec::with_capacity(k);
        for i in 1..self.impedance.len() {
            if found.len() == k {
                break;
            }
            let (x0, x1) = (self.impedance[i - 1].im, self.impedance[i].im);
            if x0 < 0.0 && x1 >= 0.0 {
                let (f0, f1) = (self.frequencies[i - 1], self.frequencies[i]);
                found.push(f0 + (f1 - f0) * (-x0) / (x1 - x0));
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_includes_stop() {
        let sweep = FrequencySweep {
            start_hz: 100.0,
            stop_hz: 110.0,
            step_hz: 2.0,
        };
        assert_eq!(sweep.frequencies(), vec![100.0, 102.0, 104.0, 106.0, 108.0, 110.0]);
        assert_eq!(FrequencySweep::default().frequencies().len(), 2451);
        let empty = FrequencySweep {
            start_hz: 10.0,
            stop_hz: 5.0,
            step_hz: 1.0,
        };
        assert!(empty.frequencies().is_empty());
    }

    #[test]
    fn antiresonances_interpolate_reactance_zero() {
        let response = AcousticResponse::new(
            "D",
            vec![100.0, 110.0, 120.0, 130.0, 140.0],
            vec![
                Complex64::new(1.0, -2.0),
                Complex64::new(1.0, 2.0),
                Complex64::new(1.0, -1.0),
                Complex64::new(1.0, -3.0),
                Complex64::new(1.0, 1.0),
            ],
        );
        let found = response.antiresonance_frequencies(5);
        assert_eq!(found.len(), 2);
        assert!((found[0] - 105.0).abs() < 1e-9);
        assert!((found[1] - 137.5).abs() < 1e-9);
        assert_eq!(response.antiresonance_frequencies(1).len(), 1);
    }

    #[test]
    fn admittance_db_is_clamped() {
        let response = AcousticResponse::new(
            "A",
            vec![1.0, 2.0],
            vec![Complex64::new(0.0, 0.0), Complex64::new(10.0, 0.0)],
        );
        let db = response.admittance_db();
        assert!((db[0] - 240.0).abs() < 1e-9);
        assert!((db[1] + 20.0).abs() < 1e-9);
    }
}
