//! Bounded one-dimensional root finding for the chimney height.
//!
//! With the `nlopt` feature (on by default) the default solver is NLopt's
//! COBYLA minimizing |residual|; without it, a bracketing secant method.

#[cfg(feature = "nlopt")]
use std::cell::RefCell;

#[cfg(feature = "nlopt")]
use nlopt::{Algorithm, Nlopt, SuccessState, Target};
use thiserror::Error;

use crate::acoustic::engine::EngineError;

#[cfg(feature = "nlopt")]
pub type DefaultSolver = NloptSolver;
#[cfg(not(feature = "nlopt"))]
pub type DefaultSolver = BoundedSecant;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("invalid bounds [{0}, {1}]")]
    InvalidBounds(f64, f64),
    #[error("objective is not finite at {0}")]
    NonFinite(f64),
    #[error("no root in bounds: residual {residual:.3e} at {x}")]
    Stuck { x: f64, residual: f64 },
    #[error("no convergence after {iterations} iterations (x = {x}, residual {residual:.3e})")]
    NoConvergence {
        iterations: usize,
        x: f64,
        residual: f64,
    },
    #[error("optimizer backend: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverOutcome {
    pub x: f64,
    pub residual: f64,
    pub iterations: usize,
}

/// Drives a scalar residual to zero within bounds.
pub trait ScalarOptimizer: Send + Sync {
    fn solve(
        &self,
        objective: &mut dyn FnMut(f64) -> Result<f64, EngineError>,
        x0: f64,
        bounds: (f64, f64),
    ) -> Result<SolverOutcome, SolverError>;
}

/// Secant steps, falling back to bisection once a sign change is bracketed.
#[derive(Debug, Clone, Copy)]
pub struct BoundedSecant {
    pub max_iterations: usize,
    /// Converged when |residual| falls below this.
    pub tolerance: f64,
    /// Converged when the bracket narrows below this.
    pub x_tolerance: f64,
}

impl Default for BoundedSecant {
    fn default() -> Self {
        Self {
            max_iterations: 60,
            tolerance: 1e-9,
            x_tolerance: 1e-10,
        }
    }
}

impl ScalarOptimizer for BoundedSecant {
    fn solve(
        &self,
        objective: &mut dyn FnMut(f64) -> Result<f64, EngineError>,
        x0: f64,
        (lo, hi): (f64, f64),
    ) -> Result<SolverOutcome, SolverError> {
        if !(lo < hi) {
            return Err(SolverError::InvalidBounds(lo, hi));
        }
        let mut eval = |x: f64| -> Result<f64, SolverError> {
            let y = objective(x)?;
            if y.is_finite() {
                Ok(y)
            } else {
                Err(SolverError::NonFinite(x))
            }
        };
        let done = |x: f64, residual: f64, iterations: usize| -> Result<SolverOutcome, SolverError> {
            Ok(SolverOutcome {
                x,
                residual,
                iterations,
            })
        };

        let mut xa = x0.clamp(lo, hi);
        let mut fa = eval(xa)?;
        if fa.abs() <= self.tolerance {
            return done(xa, fa, 1);
        }

        let h = 0.05 * (hi - lo);
        let mut xb = if xa + h <= hi { xa + h } else { xa - h };
        let mut fb = eval(xb)?;
        // two points of opposite residual sign, once found
        let mut bracket = (fa * fb < 0.0).then_some((xa, fa, xb, fb));

        for iterations in 2..self.max_iterations {
            if fb.abs() <= self.tolerance {
                return done(xb, fb, iterations);
            }
            if bracket.is_some_and(|(l, _, r, _)| (r - l).abs() <= self.x_tolerance) {
                return done(xb, fb, iterations);
            }

            let secant = if fb != fa {
                xb - fb * (xb - xa) / (fb - fa)
            } else {
                f64::NAN
            };
            let xn = match bracket {
                Some((l, _, r, _)) => {
                    let (min, max) = (l.min(r), l.max(r));
                    if secant > min && secant < max {
                        secant
                    } else {
                        0.5 * (l + r)
                    }
                }
                None if secant.is_finite() => secant.clamp(lo, hi),
                None => return Err(SolverError::Stuck { x: xb, residual: fb }),
            };
            if bracket.is_none() && xn == xb {
                return Err(SolverError::Stuck { x: xb, residual: fb });
            }

            let fn_ = eval(xn)?;
            bracket = match bracket {
                Some((l, fl, r, fr)) => {
                    if fl * fn_ < 0.0 {
                        Some((l, fl, xn, fn_))
                    } else {
                        Some((xn, fn_, r, fr))
                    }
                }
                None if fb * fn_ < 0.0 => Some((xb, fb, xn, fn_)),
                None => None,
            };
            (xa, fa, xb, fb) = (xb, fb, xn, fn_);
        }

        Err(SolverError::NoConvergence {
            iterations: self.max_iterations,
            x: xb,
            residual: fb,
        })
    }
}

/// Every residual evaluation, the best point seen and the first failure.
#[cfg(feature = "nlopt")]
struct Evaluations<'f> {
    objective: &'f mut dyn FnMut(f64) -> Result<f64, EngineError>,
    count: usize,
    best: Option<(f64, f64)>,
    error: Option<SolverError>,
}

#[cfg(feature = "nlopt")]
impl Evaluations<'_> {
    /// |residual| at `x`; infinite once any evaluation has failed.
    fn eval(&mut self, x: f64) -> f64 {
        if self.error.is_some() {
            return f64::INFINITY;
        }
        self.count += 1;
        match (self.objective)(x) {
            Ok(r) if r.is_finite() => {
                if self.best.is_none_or(|(_, b)| r.abs() < b.abs()) {
                    self.best = Some((x, r));
                }
                r.abs()
            }
            Ok(_) => {
                self.error = Some(SolverError::NonFinite(x));
                f64::INFINITY
            }
            Err(e) => {
                self.error = Some(e.into());
                f64::INFINITY
            }
        }
    }
}

/// NLopt COBYLA on |residual| over the bounded parameter.
#[cfg(feature = "nlopt")]
#[derive(Debug, Clone, Copy)]
pub struct NloptSolver {
    /// Maximum number of residual evaluations.
    pub max_iterations: usize,
    /// Converged when |residual| falls below this.
    pub tolerance: f64,
    /// Absolute step below which NLopt stops.
    pub x_tolerance: f64,
}

#[cfg(feature = "nlopt")]
impl Default for NloptSolver {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-9,
            x_tolerance: 1e-15,
        }
    }
}

#[cfg(feature = "nlopt")]
fn backend<E: std::fmt::Debug>(e: E) -> SolverError {
    SolverError::Backend(format!("{:?}", e))
}

#[cfg(feature = "nlopt")]
impl ScalarOptimizer for NloptSolver {
    fn solve(
        &self,
        objective: &mut dyn FnMut(f64) -> Result<f64, EngineError>,
        x0: f64,
        (lo, hi): (f64, f64),
    ) -> Result<SolverOutcome, SolverError> {
        if !(lo < hi) {
            return Err(SolverError::InvalidBounds(lo, hi));
        }
        let evals = RefCell::new(Evaluations {
            objective,
            count: 0,
            best: None,
            error: None,
        });

        let status = {
            let mut opt = Nlopt::new(
                Algorithm::Cobyla,
                1,
                |x: &[f64], _grad: Option<&mut [f64]>, _: &mut ()| evals.borrow_mut().eval(x[0]),
                Target::Minimize,
                (),
            );
            opt.set_lower_bounds(&[lo]).map_err(backend)?;
            opt.set_upper_bounds(&[hi]).map_err(backend)?;
            opt.set_stopval(self.tolerance).map_err(backend)?;
            opt.set_xtol_abs1(self.x_tolerance).map_err(backend)?;
            opt.set_maxeval(u32::try_from(self.max_iterations).unwrap_or(u32::MAX))
                .map_err(backend)?;
            opt.set_initial_step1(0.05 * (hi - lo)).map_err(backend)?;
            let mut x = [x0.clamp(lo, hi)];
            opt.optimize(&mut x)
        };

        let evals = evals.into_inner();
        if let Some(err) = evals.error {
            return Err(err);
        }
        let Some((x, residual)) = evals.best else {
            return Err(SolverError::Backend("no residual evaluated".into()));
        };
        if residual.abs() <= self.tolerance {
            return Ok(SolverOutcome {
                x,
                residual,
                iterations: evals.count,
            });
        }
        match status {
            Ok((SuccessState::MaxEvalReached, _)) => Err(SolverError::NoConvergence {
                iterations: evals.count,
                x,
                residual,
            }),
            Ok(_) => Err(SolverError::Stuck { x, residual }),
            Err((state, _)) => Err(backend(state)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solve(
        f: impl Fn(f64) -> f64,
        x0: f64,
        bounds: (f64, f64),
    ) -> Result<SolverOutcome, SolverError> {
        let mut objective = |x: f64| -> Result<f64, EngineError> { Ok(f(x)) };
        DefaultSolver::default().solve(&mut objective, x0, bounds)
    }

    #[test]
    fn finds_linear_root() {
        let out = solve(|x| 3.0 * (x - 0.0042), 0.003, (0.001, 0.01)).unwrap();
        assert!((out.x - 0.0042).abs() < 1e-9);
        assert!(out.residual.abs() <= 1e-9);
        assert!(out.iterations >= 1);
    }

    #[test]
    fn secant_brackets_and_bisects() {
        let mut objective = |x: f64| -> Result<f64, EngineError> { Ok((x * 300.0).tanh() - 0.5) };
        let out = BoundedSecant::default()
            .solve(&mut objective, 0.009, (0.001, 0.01))
            .unwrap();
        assert!((out.x - 0.5f64.atanh() / 300.0).abs() < 1e-8);
        assert!(out.iterations <= BoundedSecant::default().max_iterations);
    }

    #[test]
    fn finds_nonlinear_root() {
        let out = solve(|x| (x * 300.0).tanh() - 0.5, 0.009, (0.001, 0.01)).unwrap();
        let expected = 0.5f64.atanh() / 300.0;
        assert!((out.x - expected).abs() < 1e-8, "{} vs {}", out.x, expected);
    }

    #[test]
    fn root_outside_bounds_gets_stuck() {
        let err = solve(|x| x - 0.02, 0.003, (0.001, 0.01)).unwrap_err();
        assert!(matches!(
            err,
            SolverError::Stuck { .. } | SolverError::NoConvergence { .. }
        ));
    }

    #[test]
    fn engine_errors_propagate() {
        let mut objective = |_x: f64| -> Result<f64, EngineError> {
            Err(EngineError::InvalidRequest("nope".into()))
        };
        let err = DefaultSolver::default()
            .solve(&mut objective, 0.003, (0.001, 0.01))
            .unwrap_err();
        assert!(matches!(err, SolverError::Engine(_)));
        assert!(matches!(
            solve(|x| x, 0.5, (1.0, 0.0)),
            Err(SolverError::InvalidBounds(..))
        ));
        assert!(matches!(
            solve(|_| f64::NAN, 0.5, (0.0, 1.0)),
            Err(SolverError::NonFinite(_))
        ));
    }
}
