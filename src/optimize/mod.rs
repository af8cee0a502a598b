//! Per-note embouchure chimney optimization.
//!
//! Each note runs `Reset -> BaselineSolve -> TargetSolve -> Converged`, or
//! ends in `Failed` from whichever state raised. A failed note records a NaN
//! height and never stops the others.

pub mod inverse;
pub mod solver;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;

use crate::acoustic::engine::{
    AcousticEngine, AdmittanceCurve, EngineError, FrequencySweep, ModeShapes, PhysicsOptions,
    PlayerConfig,
};
use crate::acoustic::fingering::FingeringChart;
use crate::acoustic::{self};
use crate::analyzer::progress_bar;
use crate::geometry::{FluteRecord, GeometryError};
use crate::tuning::{self, SemitoneTable};
use crate::{M_TO_MM, MM_TO_M};

use inverse::{InverseProblem, Observable, OptimizableParameter};
use solver::{ScalarOptimizer, SolverError};

/// Squared ratio applied to the length-corrected height.
const SEED_SCALE: f64 = 0.64;

#[derive(Error, Debug)]
pub enum OptimizeError {
    #[error("Geometry error: {0}")]
    Geometry(#[from] GeometryError),
    #[error("Optimizable parameter '{0}' not found in the side-hole table")]
    MissingParameter(String),
    #[error("Acoustic engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Optimizer error: {0}")]
    Solver(#[from] SolverError),
    #[error(
        "Negative length correction: seed height {seed_mm:.3} mm for target {target_hz:.2} Hz (baseline {baseline_hz:.2} Hz)"
    )]
    NegativeLengthCorrection {
        seed_mm: f64,
        target_hz: f64,
        baseline_hz: f64,
    },
    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteState {
    Reset,
    BaselineSolve,
    TargetSolve,
    Converged,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct OptimizerSettings {
    pub initial_chimney_m: f64,
    pub bounds_m: (f64, f64),
    /// Sweep for the before and after admittance curves.
    pub sweep: FrequencySweep,
    pub observable: Observable,
    /// Start the optimizer from the low-frequency length-corrected height.
    pub low_freq_seed: bool,
    pub mode_shapes: bool,
    pub mode_shape_grid_m: f64,
    pub losses: bool,
    pub humidity: f64,
    pub progress: bool,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            initial_chimney_m: 3.0 * MM_TO_M,
            bounds_m: (1.0 * MM_TO_M, 10.0 * MM_TO_M),
            sweep: FrequencySweep::default(),
            observable: Observable::default(),
            low_freq_seed: true,
            mode_shapes: true,
            mode_shape_grid_m: 1e-3,
            losses: true,
            humidity: 0.5,
            progress: false,
        }
    }
}

impl OptimizerSettings {
    pub fn physics(&self, temperature_c: f64) -> PhysicsOptions {
        PhysicsOptions {
            losses: self.losses,
            humidity: self.humidity,
            ..PhysicsOptions::at(temperature_c)
        }
    }
}

/// What happened to one note.
#[derive(Debug, Clone, Serialize)]
pub struct NoteOutcome {
    pub note: String,
    pub target_hz: f64,
    pub state: NoteState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_in: Option<NoteState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Optimized chimney height, NaN when the note failed.
    pub height_mm: f64,
    pub seed_mm: Option<f64>,
    pub baseline_hz: Option<f64>,
    pub iterations: Option<usize>,
    pub before: Option<AdmittanceCurve>,
    pub after: Option<AdmittanceCurve>,
    /// First two antiresonances of the optimized geometry.
    pub antiresonances_hz: Vec<f64>,
    pub deviation_cents: Option<f64>,
    /// `f2 / f1` of the optimized geometry.
    pub harmonicity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode_shapes: Option<ModeShapes>,
}

impl NoteOutcome {
    fn new(note: &str, target_hz: f64) -> Self {
        Self {
            note: note.to_string(),
            target_hz,
            state: NoteState::Reset,
            failed_in: None,
            error: None,
            height_mm: f64::NAN,
            seed_mm: None,
            baseline_hz: None,
            iterations: None,
            before: None,
            after: None,
            antiresonances_hz: Vec::new(),
            deviation_cents: None,
            harmonicity: None,
            mode_shapes: None,
        }
    }

    pub fn is_converged(&self) -> bool {
        self.state == NoteState::Converged
    }
}

/// Height to start the optimizer from, correcting the current height by the
/// end-correction difference between the baseline resonance and the target.
pub fn low_frequency_seed(
    height_m: f64,
    target_hz: f64,
    baseline_hz: f64,
    speed_of_sound: f64,
) -> Result<f64, OptimizeError> {
    let delta = speed_of_sound / 2.0 * (1.0 / target_hz - 1.0 / baseline_hz);
    let seed = (height_m + delta) * SEED_SCALE;
    if seed > 0.0 {
        Ok(seed)
    } else {
        Err(OptimizeError::NegativeLengthCorrection {
            seed_mm: seed * M_TO_MM,
            target_hz,
            baseline_hz,
        })
    }
}

fn run_note(
    problem: &mut InverseProblem<'_>,
    optimizer: &dyn ScalarOptimizer,
    settings: &OptimizerSettings,
    outcome: &mut NoteOutcome,
) -> Result<(), OptimizeError> {
    let target = outcome.target_hz;
    let sweep = settings.sweep.frequencies();

    problem.set_note(&outcome.note);
    problem.set_parameter(settings.initial_chimney_m)?;
    log::debug!(
        "{}: chimney reset to {:.3} mm",
        outcome.note,
        settings.initial_chimney_m * M_TO_MM
    );

    outcome.state = NoteState::BaselineSolve;
    problem.update_frequencies(sweep.clone());
    let baseline = problem.solve()?;
    outcome.before = Some(baseline.admittance_curve());
    outcome.baseline_hz = baseline.antiresonance_frequencies(1).first().copied();

    outcome.state = NoteState::TargetSolve;
    let initial = problem.parameter_value()?;
    let seed = match (settings.low_freq_seed, outcome.baseline_hz) {
        (true, Some(baseline_hz)) => {
            low_frequency_seed(initial, target, baseline_hz, problem.speed_of_sound())?
        }
        (true, None) => {
            log::warn!(
                "{}: no baseline antiresonance in the sweep, starting from {:.3} mm",
                outcome.note,
                initial * M_TO_MM
            );
            initial
        }
        (false, _) => initial,
    };
    let (lo, hi) = problem.parameter().bounds_m;
    let seed = seed.clamp(lo, hi);
    outcome.seed_mm = Some(seed * M_TO_MM);

    problem.update_frequencies(vec![target]);
    problem.set_target(0.0);
    let solution = problem.optimize(optimizer, seed)?;
    outcome.iterations = Some(solution.iterations);
    let height = problem.parameter_value()?;

    problem.update_frequencies(sweep);
    let after = problem.solve()?;
    outcome.after = Some(after.admittance_curve());
    outcome.antiresonances_hz = after.antiresonance_frequencies(2);

    if let Some(&f1) = outcome.antiresonances_hz.first() {
        outcome.deviation_cents = Some(tuning::cents(f1, target));
        log::info!("{}: final deviation {:.2} Hz vs {:.2} Hz", outcome.note, f1, target);
    }
    if let &[f1, f2] = outcome.antiresonances_hz.as_slice() {
        outcome.harmonicity = (f1 != 0.0).then(|| f2 / f1);
    }

    if settings.mode_shapes {
        let harmonics = [target, 2.0 * target, 3.0 * target];
        match problem.mode_shapes(&harmonics, settings.mode_shape_grid_m) {
            Ok(shapes) => outcome.mode_shapes = Some(shapes),
            Err(e) => log::warn!("{}: pressure/flow not computed: {}", outcome.note, e),
        }
    }

    outcome.height_mm = height * M_TO_MM;
    outcome.state = NoteState::Converged;
    Ok(())
}

/// Optimize the chimney for one note. Never returns an error: a failure is
/// recorded in the outcome with a NaN height.
pub fn optimize_note(
    problem: &mut InverseProblem<'_>,
    optimizer: &dyn ScalarOptimizer,
    note: &str,
    target_hz: f64,
    settings: &OptimizerSettings,
) -> NoteOutcome {
    log::info!("Optimizing note {} for {:.2} Hz", note, target_hz);
    let mut outcome = NoteOutcome::new(note, target_hz);
    match run_note(problem, optimizer, settings, &mut outcome) {
        Ok(()) => {
            log::info!("{}: chimney height {:.3} mm", note, outcome.height_mm);
        }
        Err(e) => {
            log::error!(
                "Optimization failed for note {} (target {:.2} Hz) during {:?}: {}",
                note,
                target_hz,
                outcome.state,
                e
            );
            outcome.failed_in = Some(outcome.state);
            outcome.state = NoteState::Failed;
            outcome.error = Some(e.to_string());
            outcome.height_mm = f64::NAN;
        }
    }
    outcome
}

/// Optimize every note that has a target, in order.
///
/// With `jobs <= 1` one problem is reset and reused note after note. With
/// more jobs each note gets its own copy of the problem.
pub fn optimize_notes(
    problem: &InverseProblem<'_>,
    optimizer: &dyn ScalarOptimizer,
    targets: &[(String, Option<f64>)],
    settings: &OptimizerSettings,
    jobs: usize,
) -> Result<Vec<NoteOutcome>, OptimizeError> {
    let todo: Vec<(&str, f64)> = targets
        .iter()
        .filter_map(|(note, target)| match target {
            Some(t) => Some((note.as_str(), *t)),
            None => {
                log::warn!("Note {} has no target frequency, skipping", note);
                None
            }
        })
        .collect();

    let pb = settings.progress.then(|| progress_bar(todo.len() as u64));

    let outcomes = if jobs <= 1 {
        let mut shared = problem.clone();
        todo.iter()
            .map(|(note, target)| {
                let outcome = optimize_note(&mut shared, optimizer, note, *target, settings);
                if let Some(pb) = &pb {
                    pb.inc(1);
                }
                outcome
            })
            .collect()
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build()
            .map_err(|e| OptimizeError::ThreadPool(e.to_string()))?;
        pool.install(|| {
            todo.par_iter()
                .map(|(note, target)| {
                    let mut own = problem.clone();
                    let outcome = optimize_note(&mut own, optimizer, note, *target, settings);
                    if let Some(pb) = &pb {
                        pb.inc(1);
                    }
                    outcome
                })
                .collect::<Vec<_>>()
        })
    };

    if let Some(pb) = pb {
        pb.finish_with_message(format!("Done: {} notes", todo.len()));
    }
    Ok(outcomes)
}

/// Results of optimizing one flute.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationRun {
    pub model: String,
    pub diapason_hz: f64,
    pub temperature_c: f64,
    pub observable: Observable,
    pub generated_at: DateTime<Utc>,
    pub notes: Vec<NoteOutcome>,
}

impl OptimizationRun {
    /// Optimized heights by note, NaN for failed notes.
    pub fn heights_mm(&self) -> BTreeMap<String, f64> {
        self.notes
            .iter()
            .map(|o| (o.note.clone(), o.height_mm))
            .collect()
    }

    pub fn converged(&self) -> usize {
        self.notes.iter().filter(|o| o.is_converged()).count()
    }

    pub fn failed(&self) -> usize {
        self.notes.len() - self.converged()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Build the acoustic inputs of a flute and optimize the embouchure chimney
/// for every note of the chart that has a target frequency.
pub fn optimize_flute(
    record: &FluteRecord,
    chart: FingeringChart,
    engine: &dyn AcousticEngine,
    optimizer: &dyn ScalarOptimizer,
    semitones: &SemitoneTable,
    settings: &OptimizerSettings,
    jobs: usize,
) -> Result<OptimizationRun, OptimizeError> {
    let inputs = acoustic::build(record, chart)?;
    let player = PlayerConfig::at_embouchure(&inputs)?;
    let targets = semitones.targets(inputs.notes(), record.diapason_hz);

    log::info!(
        "Optimizing {} notes of {} at {:.1} Hz, {:.1} C",
        targets.len(),
        record.model,
        record.diapason_hz,
        record.temperature_c
    );

    let problem = InverseProblem::new(
        engine,
        inputs,
        player,
        settings.physics(record.temperature_c),
        OptimizableParameter::embouchure_chimney(settings.bounds_m),
        settings.observable,
    );
    let notes = optimize_notes(&problem, optimizer, &targets, settings, jobs)?;

    Ok(OptimizationRun {
        model: record.model.clone(),
        diapason_hz: record.diapason_hz,
        temperature_c: record.temperature_c,
        observable: settings.observable,
        generated_at: Utc::now(),
        notes,
    })
}
