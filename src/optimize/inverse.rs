//! One geometric parameter, one note, one target frequency.
//!
//! The problem owns its copy of the acoustic inputs and the parameter it
//! adjusts. Note, frequency list and target are switched per note; the
//! parameter is reset by the caller before each note.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use super::OptimizeError;
use super::solver::{ScalarOptimizer, SolverOutcome};
use crate::EMBOUCHURE_LABEL;
use crate::acoustic::AcousticInputSet;
use crate::acoustic::engine::{
    AcousticEngine, AcousticResponse, EngineError, EngineRequest, ModeShapes, PhysicsOptions,
    PlayerConfig,
};

/// Quantity driven to its target at the target frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Observable {
    /// Imaginary part of the reflection coefficient `(z - 1) / (z + 1)`.
    #[default]
    Reflection,
    /// Sine of the impedance phase.
    ImpedancePhase,
}

impl Observable {
    /// Value for an impedance normalized by the source's characteristic
    /// impedance. Both observables vanish where the reactance does.
    pub fn evaluate(&self, z: Complex64) -> f64 {
        match self {
            Self::Reflection => ((z - 1.0) / (z + 1.0)).im,
            Self::ImpedancePhase => z.im / z.norm(),
        }
    }
}

/// A side-hole chimney height the optimizer may change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizableParameter {
    pub name: String,
    pub hole_label: String,
    pub bounds_m: (f64, f64),
}

impl OptimizableParameter {
    pub fn embouchure_chimney(bounds_m: (f64, f64)) -> Self {
        Self {
            name: format!("{}_chimney", EMBOUCHURE_LABEL),
            hole_label: EMBOUCHURE_LABEL.to_string(),
            bounds_m,
        }
    }

    pub fn get(&self, inputs: &AcousticInputSet) -> Option<f64> {
        inputs.hole(&self.hole_label).map(|h| h.chimney_m)
    }

    pub fn set(&self, inputs: &mut AcousticInputSet, value_m: f64) -> Option<()> {
        inputs.hole_mut(&self.hole_label).map(|h| h.chimney_m = value_m)
    }
}

#[derive(Clone)]
pub struct InverseProblem<'e> {
    engine: &'e dyn AcousticEngine,
    inputs: AcousticInputSet,
    player: PlayerConfig,
    physics: PhysicsOptions,
    parameter: OptimizableParameter,
    observable: Observable,
    note: String,
    frequencies: Vec<f64>,
    target: f64,
    last: Option<AcousticResponse>,
}

impl<'e> InverseProblem<'e> {
    pub fn new(
        engine: &'e dyn AcousticEngine,
        inputs: AcousticInputSet,
        player: PlayerConfig,
        physics: PhysicsOptions,
        parameter: OptimizableParameter,
        observable: Observable,
    ) -> Self {
        Self {
            engine,
            inputs,
            player,
            physics,
            parameter,
            observable,
            note: String::new(),
            frequencies: Vec::new(),
            target: 0.0,
            last: None,
        }
    }

    pub fn inputs(&self) -> &AcousticInputSet {
        &self.inputs
    }

    pub fn parameter(&self) -> &OptimizableParameter {
        &self.parameter
    }

    pub fn note(&self) -> &str {
        &self.note
    }

    pub fn speed_of_sound(&self) -> f64 {
        self.physics.speed_of_sound()
    }

    pub fn set_note(&mut self, note: &str) {
        self.note = note.to_string();
        self.last = None;
    }

    pub fn update_frequencies(&mut self, frequencies: Vec<f64>) {
        self.frequencies = frequencies;
        self.last = None;
    }

    /// Target value of the observable.
    pub fn set_target(&mut self, value: f64) {
        self.target = value;
    }

    pub fn parameter_value(&self) -> Result<f64, OptimizeError> {
        self.parameter
            .get(&self.inputs)
            .ok_or_else(|| OptimizeError::MissingParameter(self.parameter.name.clone()))
    }

    pub fn set_parameter(&mut self, value_m: f64) -> Result<(), OptimizeError> {
        self.last = None;
        self.parameter
            .set(&mut self.inputs, value_m)
            .ok_or_else(|| OptimizeError::MissingParameter(self.parameter.name.clone()))
    }

    fn request<'a>(&'a self, frequencies: &'a [f64], grid: Option<f64>) -> EngineRequest<'a> {
        EngineRequest {
            inputs: &self.inputs,
            note: &self.note,
            frequencies,
            player: &self.player,
            physics: &self.physics,
            mode_shape_grid_m: grid,
        }
    }

    /// Impedance over the current frequency list.
    pub fn solve(&mut self) -> Result<&AcousticResponse, EngineError> {
        let response = self.engine.compute(&self.request(&self.frequencies, None))?;
        Ok(self.last.insert(response))
    }

    pub fn last_response(&self) -> Option<&AcousticResponse> {
        self.last.as_ref()
    }

    /// Pressure and flow along the bore at the given frequencies.
    pub fn mode_shapes(&self, frequencies: &[f64], grid_m: f64) -> Result<ModeShapes, EngineError> {
        let response = self.engine.compute(&self.request(frequencies, Some(grid_m)))?;
        response
            .mode_shapes()
            .cloned()
            .ok_or_else(|| EngineError::InvalidRequest("engine returned no mode shapes".into()))
    }

    /// Observable minus target at the first frequency, for a parameter value.
    pub fn residual(&mut self, value_m: f64) -> Result<f64, EngineError> {
        if self.parameter.set(&mut self.inputs, value_m).is_none() {
            return Err(EngineError::MissingSource(self.parameter.hole_label.clone()));
        }
        let zc = self.physics.characteristic_impedance(self.player.section_m2);
        let response = self.solve()?;
        let z = response
            .impedance()
            .first()
            .copied()
            .ok_or_else(|| EngineError::InvalidRequest("no target frequency set".into()))?;
        Ok(self.observable.evaluate(z / zc) - self.target)
    }

    /// Drive the residual to zero from `x0` within the parameter bounds and
    /// leave the parameter at the solution.
    pub fn optimize(
        &mut self,
        optimizer: &dyn ScalarOptimizer,
        x0: f64,
    ) -> Result<SolverOutcome, OptimizeError> {
        self.parameter_value()?;
        let bounds = self.parameter.bounds_m;
        let outcome = optimizer.solve(&mut |x| self.residual(x), x0, bounds)?;
        self.set_parameter(outcome.x)?;
        Ok(outcome)
    }
}
