pub mod metrics;

use std::collections::BTreeMap;

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;

use crate::acoustic::engine::{
    AcousticEngine, AcousticResponse, EngineError, EngineRequest, FrequencySweep, PhysicsOptions,
    PlayerConfig,
};
use crate::acoustic::fingering::FingeringChart;
use crate::acoustic::{self, AcousticInputSet};
use crate::geometry::{FluteRecord, GeometryError};

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("Geometry error: {0}")]
    Geometry(#[from] GeometryError),
    #[error("No acoustic source: {0}")]
    Source(EngineError),
    #[error("Acoustic engine error for note '{note}': {source}")]
    Engine {
        note: String,
        #[source]
        source: EngineError,
    },
}

#[derive(Debug)]
pub struct AnalyzeResult {
    pub analyzed: u64,
    pub frequencies: u64,
}

/// Last frequency (Hz) of the analysis sweep.
pub const ANALYSIS_STOP_HZ: f64 = 2998.0;

/// Sweep and physics of a baseline analysis.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisSettings {
    pub sweep: FrequencySweep,
    pub losses: bool,
    pub humidity: f64,
    /// Show a progress bar on stderr.
    pub progress: bool,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            // admittance plots stop below 3 kHz; the optimizer sweeps to 5 kHz
            sweep: FrequencySweep {
                start_hz: 100.0,
                stop_hz: ANALYSIS_STOP_HZ,
                step_hz: 2.0,
            },
            losses: true,
            humidity: 0.5,
            progress: false,
        }
    }
}

impl AnalysisSettings {
    pub fn physics(&self, temperature_c: f64) -> PhysicsOptions {
        PhysicsOptions {
            losses: self.losses,
            humidity: self.humidity,
            ..PhysicsOptions::at(temperature_c)
        }
    }
}

pub(crate) fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if let Ok(style) =
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Compute the input impedance of every note in the fingering chart.
///
/// Stops at the first engine failure: a flute that cannot be analysed for
/// one note is not analysed at all.
pub fn analyze(
    inputs: &AcousticInputSet,
    engine: &dyn AcousticEngine,
    settings: &AnalysisSettings,
    temperature_c: f64,
) -> Result<BTreeMap<String, AcousticResponse>, AnalyzeError> {
    let notes: Vec<&str> = inputs.notes().collect();
    if notes.is_empty() {
        log::warn!("Fingering chart has no notes, nothing to analyze");
        return Ok(BTreeMap::new());
    }

    let player = PlayerConfig::at_embouchure(inputs).map_err(AnalyzeError::Source)?;
    let physics = settings.physics(temperature_c);
    let frequencies = settings.sweep.frequencies();

    log::info!(
        "Analyzing {} notes over {} frequencies at {:.1} C",
        notes.len(),
        frequencies.len(),
        temperature_c
    );

    let pb = settings.progress.then(|| progress_bar(notes.len() as u64));

    let mut results = BTreeMap::new();
    for note in notes {
        let request = EngineRequest {
            inputs,
            note,
            frequencies: &frequencies,
            player: &player,
            physics: &physics,
            mode_shape_grid_m: None,
        };
        let response = engine.compute(&request).map_err(|source| {
            log::error!("Analysis failed for note {}: {}", note, source);
            AnalyzeError::Engine {
                note: note.to_string(),
                source,
            }
        })?;
        log::debug!(
            "{}: antiresonances {:?}",
            note,
            response.antiresonance_frequencies(2)
        );
        results.insert(note.to_string(), response);
        if let Some(pb) = &pb {
            pb.inc(1);
        }
    }

    if let Some(pb) = pb {
        pb.finish_with_message(format!("Done: {} notes", results.len()));
    }
    Ok(results)
}

/// Build inputs for a flute, analyse every note and store the results on
/// the record.
pub fn analyze_record(
    record: &mut FluteRecord,
    chart: FingeringChart,
    engine: &dyn AcousticEngine,
    settings: &AnalysisSettings,
) -> Result<AnalyzeResult, AnalyzeError> {
    let inputs = acoustic::build(record, chart)?;
    let results = analyze(&inputs, engine, settings, record.temperature_c)?;
    let result = AnalyzeResult {
        analyzed: results.len() as u64,
        frequencies: settings.sweep.frequencies().len() as u64,
    };
    record.set_analysis(results);
    Ok(result)
}

#[cfg(test)]
pub(crate) mod test_engines {
    use super::*;
    use crate::tuning::SemitoneTable;
    use num_complex::Complex64;

    /// Engine with a single antiresonance at `base_hz * 2^(n/12) / (1 + 20 h)`
    /// for a note `n` semitones from A and an embouchure chimney `h` (m).
    pub struct ToyEngine {
        pub base_hz: f64,
        pub fail_note: Option<String>,
    }

    impl ToyEngine {
        pub fn new(base_hz: f64) -> Self {
            Self {
                base_hz,
                fail_note: None,
            }
        }

        pub fn resonance(&self, note: &str, chimney_m: f64) -> f64 {
            let semitones = SemitoneTable::default().offset(note).unwrap_or(0);
            crate::tuning::equal_tempered(self.base_hz, f64::from(semitones)) / (1.0 + 20.0 * chimney_m)
        }
    }

    impl AcousticEngine for ToyEngine {
        fn compute(&self, request: &EngineRequest<'_>) -> Result<AcousticResponse, EngineError> {
            if self.fail_note.as_deref() == Some(request.note) {
                return Err(EngineError::Solver {
                    frequency: request.frequencies[0],
                    message: "toy failure".into(),
                });
            }
            let chimney = request
                .inputs
                .hole(crate::EMBOUCHURE_LABEL)
                .ok_or_else(|| EngineError::MissingSource(crate::EMBOUCHURE_LABEL.into()))?
                .chimney_m;
            let f0 = self.resonance(request.note, chimney);
            let impedance = request
                .frequencies
                .iter()
                .map(|f| Complex64::new(1.0, f - f0))
                .collect();
            Ok(AcousticResponse::new(
                request.note,
                request.frequencies.to_vec(),
                impedance,
            ))
        }
    }
}
