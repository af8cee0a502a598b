//! Plane-wave transfer-matrix model of a flute seen from the embouchure.
//!
//! The bore is cut into short cylindrical pieces (conical segments use the
//! radius at each piece's midpoint). Tone holes are shunt impedances: a
//! chimney either radiating (open) or ending rigid (closed). The source sees
//! the embouchure chimney loaded by the bore on both sides of it, in series
//! with the player's radiation at the mouth hole.
//!
//! Convention: `e^{jwt}`, upstream state `(p, u) = M * downstream state`.

use std::f64::consts::PI;

use num_complex::Complex64;

use super::AcousticInputSet;
use super::engine::{
    AcousticEngine, AcousticResponse, EngineError, EngineRequest, ModeShapes, PhysicsOptions,
    Radiation,
};

/// Boundary-layer attenuation: `alpha = LOSS_COEFF * sqrt(f) / r` (Np/m).
const LOSS_COEFF: f64 = 3.0e-5;
const UNFLANGED_END_CORRECTION: f64 = 0.6133;
const FLANGED_END_CORRECTION: f64 = 0.8216;
/// Positions closer than this (m) share one node.
const NODE_TOLERANCE_M: f64 = 1e-9;

type State = (Complex64, Complex64);
type Matrix = [Complex64; 4];

#[derive(Debug, Clone)]
pub struct TransferMatrixEngine {
    /// Longest cylindrical piece (m) a bore segment is cut into.
    pub max_piece_m: f64,
}

impl Default for TransferMatrixEngine {
    fn default() -> Self {
        Self { max_piece_m: 5e-3 }
    }
}

struct Air {
    c: f64,
    rho: f64,
    losses: bool,
}

impl Air {
    fn new(physics: &PhysicsOptions) -> Self {
        Self {
            c: physics.speed_of_sound(),
            rho: physics.air_density(),
            losses: physics.losses,
        }
    }

    fn characteristic_impedance(&self, radius: f64) -> f64 {
        self.rho * self.c / (PI * radius * radius)
    }

    fn wavenumber(&self, f: f64, radius: f64) -> Complex64 {
        let k = 2.0 * PI * f / self.c;
        if self.losses {
            let alpha = LOSS_COEFF * f.sqrt() / radius;
            Complex64::new(k + alpha, -alpha)
        } else {
            Complex64::new(k, 0.0)
        }
    }

    fn cylinder(&self, f: f64, length: f64, radius: f64) -> Matrix {
        let kl = self.wavenumber(f, radius) * length;
        let zc = self.characteristic_impedance(radius);
        let (cos, sin) = (kl.cos(), kl.sin());
        let j = Complex64::i();
        [cos, j * sin * zc, j * sin / zc, cos]
    }

    /// Radiation impedance of an open end; `None` for a rigid end.
    fn radiation(&self, kind: Radiation, f: f64, radius: f64) -> Option<Complex64> {
        let ka = 2.0 * PI * f / self.c * radius;
        let zc = self.characteristic_impedance(radius);
        match kind {
            Radiation::Closed => None,
            Radiation::Unflanged => Some(zc * Complex64::new(0.25 * ka * ka, UNFLANGED_END_CORRECTION * ka)),
            Radiation::InfiniteFlanged => {
                Some(zc * Complex64::new(0.5 * ka * ka, FLANGED_END_CORRECTION * ka))
            }
        }
    }

    fn termination(&self, kind: Radiation, f: f64, radius: f64) -> State {
        match self.radiation(kind, f, radius) {
            Some(z) => (z, Complex64::new(1.0, 0.0)),
            None => (Complex64::new(1.0, 0.0), Complex64::new(0.0, 0.0)),
        }
    }
}

fn apply(m: &Matrix, (p, u): State) -> State {
    (m[0] * p + m[1] * u, m[2] * p + m[3] * u)
}

/// Inverse of a unit-determinant transfer matrix.
fn apply_inverse(m: &Matrix, (p, u): State) -> State {
    (m[3] * p - m[1] * u, -m[2] * p + m[0] * u)
}

/// The bore cut into pieces, with the holes attached to their nodes.
struct Layout {
    nodes: Vec<f64>,
    radii: Vec<f64>,
    holes_at: Vec<Vec<usize>>,
    source_node: usize,
    source_hole: usize,
}

impl Layout {
    fn new(inputs: &AcousticInputSet, source: &str, max_piece: f64) -> Result<Self, EngineError> {
        let poly = inputs.bore_polyline();
        let (Some(first), Some(last)) = (poly.first(), poly.last()) else {
            return Err(EngineError::InvalidRequest("bore has no segments".into()));
        };
        let (start, end) = (first[0], last[0]);

        let source_hole = inputs
            .side_holes
            .iter()
            .position(|h| h.label == source)
            .ok_or_else(|| EngineError::MissingSource(source.to_string()))?;

        let mut breaks: Vec<f64> = poly.iter().map(|v| v[0]).collect();
        for hole in &inputs.side_holes {
            if hole.position_m < start - NODE_TOLERANCE_M || hole.position_m > end + NODE_TOLERANCE_M {
                return Err(EngineError::InvalidRequest(format!(
                    "hole '{}' at {:.4} m lies outside the bore",
                    hole.label, hole.position_m
                )));
            }
            if hole.radius_m <= 0.0 || hole.chimney_m < 0.0 {
                return Err(EngineError::InvalidRequest(format!(
                    "hole '{}' has non-physical dimensions",
                    hole.label
                )));
            }
            breaks.push(hole.position_m.clamp(start, end));
        }
        breaks.sort_by(f64::total_cmp);
        breaks.dedup_by(|a, b| (*a - *b).abs() < NODE_TOLERANCE_M);

        let mut nodes = Vec::new();
        for w in breaks.windows(2) {
            let n = ((w[1] - w[0]) / max_piece).ceil().max(1.0) as usize;
            nodes.extend((0..n).map(|i| w[0] + (w[1] - w[0]) * i as f64 / n as f64));
        }
        nodes.push(end);

        let mut radii = Vec::with_capacity(nodes.len() - 1);
        for w in nodes.windows(2) {
            let r = inputs.radius_at(0.5 * (w[0] + w[1])).unwrap_or(0.0);
            if r <= 0.0 {
                return Err(EngineError::InvalidRequest(format!(
                    "non-positive bore radius near {:.4} m",
                    w[0]
                )));
            }
            radii.push(r);
        }

        let node_of = |x: f64| nodes.partition_point(|n| *n < x.clamp(start, end) - NODE_TOLERANCE_M);
        let mut holes_at = vec![Vec::new(); nodes.len()];
        for (i, hole) in inputs.side_holes.iter().enumerate() {
            if i != source_hole {
                holes_at[node_of(hole.position_m)].push(i);
            }
        }
        let source_node = node_of(inputs.side_holes[source_hole].position_m);

        Ok(Self {
            nodes,
            radii,
            holes_at,
            source_node,
            source_hole,
        })
    }
}

struct Solution {
    impedance: Complex64,
    pressure: Vec<Complex64>,
    flow: Vec<Complex64>,
}

impl TransferMatrixEngine {
    fn solve(
        &self,
        layout: &Layout,
        request: &EngineRequest<'_>,
        air: &Air,
        f: f64,
        field: bool,
    ) -> Result<Solution, EngineError> {
        let inputs = request.inputs;
        let physics = request.physics;
        let zero = Complex64::new(0.0, 0.0);
        let one = Complex64::new(1.0, 0.0);

        // Shunt admittance of the tone holes gathered per node.
        let mut shunt = vec![zero; layout.nodes.len()];
        for (node, holes) in layout.holes_at.iter().enumerate() {
            for &i in holes {
                let hole = &inputs.side_holes[i];
                let open = inputs.fingering.is_open(&hole.label, request.note);
                let end = if open {
                    air.termination(physics.radiation.holes, f, hole.radius_m)
                } else {
                    (one, zero)
                };
                let (p, u) = apply(&air.cylinder(f, hole.chimney_m, hole.radius_m), end);
                shunt[node] += u / p;
            }
        }

        let n = layout.nodes.len();
        let last = n - 1;
        let src = layout.source_node;
        let mut down = if field { vec![(zero, zero); n] } else { Vec::new() };
        let mut up = if field { vec![(zero, zero); n] } else { Vec::new() };

        let mut d = air.termination(physics.radiation.bell, f, layout.radii[last - 1]);
        for j in (src + 1..=last).rev() {
            d.1 += d.0 * shunt[j];
            if field {
                down[j] = d;
            }
            d = apply(&air.cylinder(f, layout.nodes[j] - layout.nodes[j - 1], layout.radii[j - 1]), d);
        }

        let mut u = air.termination(physics.radiation.entrance, f, layout.radii[0]);
        for j in 0..src {
            u.1 += u.0 * shunt[j];
            if field {
                up[j] = u;
            }
            u = apply(&air.cylinder(f, layout.nodes[j + 1] - layout.nodes[j], layout.radii[j]), u);
        }

        let junction = d.1 / d.0 + u.1 / u.0 + shunt[src];
        let source = &inputs.side_holes[layout.source_hole];
        let chimney = air.cylinder(f, source.chimney_m, source.radius_m);
        let (p_in, u_in) = apply(&chimney, (one, junction));
        let z_in = p_in / u_in;

        let player_radius = (request.player.section_m2 / PI).sqrt();
        let z_mouth = air
            .radiation(request.player.radiation, f, player_radius)
            .unwrap_or(zero);
        let impedance = z_in + z_mouth;
        if !impedance.re.is_finite() || !impedance.im.is_finite() {
            return Err(EngineError::Solver {
                frequency: f,
                message: "singular junction".into(),
            });
        }

        let (mut pressure, mut flow) = (Vec::new(), Vec::new());
        if field {
            // unit volume flow injected at the mouth hole
            let (p_j, _) = apply_inverse(&chimney, (z_in, one));
            let scale_down = p_j / d.0;
            let scale_up = p_j / u.0;
            pressure.reserve(n);
            flow.reserve(n);
            for j in 0..n {
                let (p, q) = if j < src {
                    (up[j].0 * scale_up, -up[j].1 * scale_up)
                } else if j == src {
                    (p_j, d.1 * scale_down)
                } else {
                    (down[j].0 * scale_down, down[j].1 * scale_down)
                };
                pressure.push(p);
                flow.push(q);
            }
        }

        Ok(Solution {
            impedance,
            pressure,
            flow,
        })
    }
}

impl AcousticEngine for TransferMatrixEngine {
    fn compute(&self, request: &EngineRequest<'_>) -> Result<AcousticResponse, EngineError> {
        if request.frequencies.is_empty() {
            return Err(EngineError::InvalidRequest("no frequencies requested".into()));
        }
        if let Some(f) = request.frequencies.iter().find(|f| !(f.is_finite() && **f > 0.0)) {
            return Err(EngineError::InvalidRequest(format!("frequency {} Hz", f)));
        }
        if !request.inputs.fingering.has_note(request.note) {
            return Err(EngineError::UnknownNote(request.note.to_string()));
        }

        let max_piece = match request.mode_shape_grid_m {
            Some(grid) if grid > 0.0 => self.max_piece_m.min(grid),
            _ => self.max_piece_m,
        };
        let layout = Layout::new(request.inputs, &request.player.source_label, max_piece)?;
        let air = Air::new(request.physics);
        let field = request.mode_shape_grid_m.is_some();

        let mut impedance = Vec::with_capacity(request.frequencies.len());
        let mut pressure = Vec::new();
        let mut flow = Vec::new();
        for &f in request.frequencies {
            let solution = self.solve(&layout, request, &air, f, field)?;
            impedance.push(solution.impedance);
            if field {
                pressure.push(solution.pressure);
                flow.push(solution.flow);
            }
        }

        let response = AcousticResponse::new(request.note, request.frequencies.to_vec(), impedance);
        Ok(if field {
            response.with_mode_shapes(ModeShapes {
                x_m: layout.nodes,
                frequencies: request.frequencies.to_vec(),
                pressure,
                flow,
            })
        } else {
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acoustic::engine::{FrequencySweep, PlayerConfig};
    use crate::acoustic::fingering::FingeringChart;
    use crate::acoustic::test_support::sample_inputs;
    use crate::acoustic::{BoreSegment, ShapeKind, SideHole};
    use crate::tuning::speed_of_sound;

    fn first_antiresonance(inputs: &AcousticInputSet, note: &str) -> f64 {
        let player = PlayerConfig::at_embouchure(inputs).unwrap();
        let physics = PhysicsOptions::at(25.0);
        let freqs = FrequencySweep {
            start_hz: 100.0,
            stop_hz: 1500.0,
            step_hz: 2.0,
        }
        .frequencies();
        let request = EngineRequest {
            inputs,
            note,
            frequencies: &freqs,
            player: &player,
            physics: &physics,
            mode_shape_grid_m: None,
        };
        let response = TransferMatrixEngine::default().compute(&request).unwrap();
        response.antiresonance_frequencies(1)[0]
    }

    fn open_pipe(length: f64, radius: f64) -> AcousticInputSet {
        AcousticInputSet {
            bore_segments: vec![BoreSegment {
                x_start_m: 0.0,
                x_end_m: length,
                r_start_m: radius,
                r_end_m: radius,
                shape: ShapeKind::Linear,
            }],
            side_holes: vec![SideHole {
                label: crate::EMBOUCHURE_LABEL.into(),
                position_m: 0.0,
                chimney_m: 0.0,
                radius_m: 0.005,
                radius_out_m: 0.006,
            }],
            fingering: FingeringChart::parse("label D\n").unwrap(),
            warnings: vec![],
        }
    }

    #[test]
    fn lossless_pipe_matches_half_wave_resonance() {
        let (length, radius) = (0.3, 0.01);
        let inputs = open_pipe(length, radius);
        let player = PlayerConfig {
            source_label: crate::EMBOUCHURE_LABEL.into(),
            radiation: Radiation::Closed,
            section_m2: PI * 0.005 * 0.005,
        };
        let physics = PhysicsOptions {
            temperature_c: 20.0,
            losses: false,
            ..PhysicsOptions::default()
        };
        let freqs: Vec<f64> = (100..1500).map(f64::from).collect();
        let request = EngineRequest {
            inputs: &inputs,
            note: "D",
            frequencies: &freqs,
            player: &player,
            physics: &physics,
            mode_shape_grid_m: None,
        };
        let response = TransferMatrixEngine::default().compute(&request).unwrap();
        let found = response.antiresonance_frequencies(2);
        let expected = speed_of_sound(20.0) / (2.0 * (length + UNFLANGED_END_CORRECTION * radius));
        assert!((found[0] / expected - 1.0).abs() < 0.01, "{} vs {}", found[0], expected);
        assert!((found[1] / (2.0 * expected) - 1.0).abs() < 0.02);
    }

    #[test]
    fn sample_flute_plays_in_range_and_rises_with_open_holes() {
        let inputs = sample_inputs();
        let d = first_antiresonance(&inputs, "D");
        let a = first_antiresonance(&inputs, "A");
        assert!(d > 150.0 && d < 450.0, "D at {d}");
        assert!(a > d * 1.2, "A at {a}, D at {d}");
    }

    #[test]
    fn taller_embouchure_chimney_flattens() {
        let mut inputs = sample_inputs();
        inputs.hole_mut(crate::EMBOUCHURE_LABEL).unwrap().chimney_m = 0.003;
        let low = first_antiresonance(&inputs, "D");
        inputs.hole_mut(crate::EMBOUCHURE_LABEL).unwrap().chimney_m = 0.008;
        let high = first_antiresonance(&inputs, "D");
        assert!(high < low, "{high} !< {low}");
    }

    #[test]
    fn mode_shapes_cover_the_bore() {
        let inputs = sample_inputs();
        let f = first_antiresonance(&inputs, "D");
        let player = PlayerConfig::at_embouchure(&inputs).unwrap();
        let physics = PhysicsOptions::at(25.0);
        let freqs = [f, 2.0 * f];
        let request = EngineRequest {
            inputs: &inputs,
            note: "D",
            frequencies: &freqs,
            player: &player,
            physics: &physics,
            mode_shape_grid_m: Some(1e-3),
        };
        let response = TransferMatrixEngine::default().compute(&request).unwrap();
        let shapes = response.mode_shapes().unwrap();
        assert_eq!(shapes.pressure.len(), 2);
        assert_eq!(shapes.pressure[0].len(), shapes.x_m.len());
        assert_eq!(shapes.flow[1].len(), shapes.x_m.len());
        assert!(shapes.x_m.windows(2).all(|w| w[1] > w[0] && w[1] - w[0] <= 1e-3 + 1e-12));
        assert!((shapes.x_m.last().unwrap() - 0.645).abs() < 1e-9);
        // rigid cork: no flow at x = 0
        assert!(shapes.flow[0][0].norm() < 1e-12);
        let peak = shapes.pressure[0].iter().map(|p| p.norm()).fold(0.0, f64::max);
        assert!(shapes.pressure[0].last().unwrap().norm() < 0.3 * peak);
    }

    #[test]
    fn bad_requests_are_rejected() {
        let inputs = sample_inputs();
        let player = PlayerConfig::at_embouchure(&inputs).unwrap();
        let physics = PhysicsOptions::default();
        let engine = TransferMatrixEngine::default();
        let mut request = EngineRequest {
            inputs: &inputs,
            note: "Gs",
            frequencies: &[440.0],
            player: &player,
            physics: &physics,
            mode_shape_grid_m: None,
        };
        assert_eq!(engine.compute(&request), Err(EngineError::UnknownNote("Gs".into())));

        request.note = "D";
        request.frequencies = &[];
        assert!(matches!(engine.compute(&request), Err(EngineError::InvalidRequest(_))));

        let other = PlayerConfig::flute("lip", 0.004);
        request.frequencies = &[440.0];
        request.player = &other;
        assert_eq!(engine.compute(&request), Err(EngineError::MissingSource("lip".into())));
    }
}
