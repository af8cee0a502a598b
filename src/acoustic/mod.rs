pub mod engine;
pub mod fingering;
pub mod tmm;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::combine::{self, diameter_at};
use crate::geometry::{
    CombinedMeasurement, FluteRecord, GeometryError, SegmentFault, SegmentFaultKind, hole_labels,
};
use crate::validate::{Issue, IssueKind};
use crate::{EMBOUCHURE_LABEL, MM_TO_M};
use fingering::{FingeringChart, FingeringError};

/// Segments shorter than this (m) are treated as zero-length.
pub const SEGMENT_TOLERANCE_M: f64 = 1e-9;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("geometry error: {0}")]
    Geometry(#[from] GeometryError),
    #[error("fingering chart error: {0}")]
    Fingering(#[from] FingeringError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    /// Radius varies linearly along the segment.
    Linear,
}

/// One piece of the main bore, in metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoreSegment {
    pub x_start_m: f64,
    pub x_end_m: f64,
    pub r_start_m: f64,
    pub r_end_m: f64,
    pub shape: ShapeKind,
}

impl BoreSegment {
    pub fn length(&self) -> f64 {
        self.x_end_m - self.x_start_m
    }

    pub fn radius_at(&self, x_m: f64) -> f64 {
        let t = ((x_m - self.x_start_m) / self.length()).clamp(0.0, 1.0);
        self.r_start_m + t * (self.r_end_m - self.r_start_m)
    }
}

/// A side hole in solver units (m).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SideHole {
    pub label: String,
    pub position_m: f64,
    pub chimney_m: f64,
    pub radius_m: f64,
    pub radius_out_m: f64,
}

/// Solver-ready description of a flute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcousticInputSet {
    pub bore_segments: Vec<BoreSegment>,
    pub side_holes: Vec<SideHole>,
    pub fingering: FingeringChart,
    #[serde(skip)]
    pub warnings: Vec<Issue>,
}

impl AcousticInputSet {
    /// Bore as `[x, r]` vertices: the first segment start then every end.
    pub fn bore_polyline(&self) -> Vec<[f64; 2]> {
        let mut poly = Vec::with_capacity(self.bore_segments.len() + 1);
        if let Some(first) = self.bore_segments.first() {
            poly.push([first.x_start_m, first.r_start_m]);
        }
        for seg in &self.bore_segments {
            poly.push([seg.x_end_m, seg.r_end_m]);
        }
        poly
    }

    pub fn bore_length(&self) -> f64 {
        self.bore_segments.last().map_or(0.0, |s| s.x_end_m)
    }

    /// Main bore radius at an axial position, held constant past the ends.
    pub fn radius_at(&self, x_m: f64) -> Option<f64> {
        let first = self.bore_segments.first()?;
        if x_m <= first.x_start_m {
            return Some(first.r_start_m);
        }
        self.bore_segments
            .iter()
            .find(|s| x_m <= s.x_end_m)
            .or(self.bore_segments.last())
            .map(|s| s.radius_at(x_m))
    }

    pub fn hole(&self, label: &str) -> Option<&SideHole> {
        self.side_holes.iter().find(|h| h.label == label)
    }

    pub fn hole_mut(&mut self, label: &str) -> Option<&mut SideHole> {
        self.side_holes.iter_mut().find(|h| h.label == label)
    }

    /// Notes of the fingering chart, skipping blank labels.
    pub fn notes(&self) -> impl Iterator<Item = &str> {
        self.fingering
            .notes()
            .iter()
            .map(String::as_str)
            .filter(|n| !n.trim().is_empty())
    }
}

/// Turn the combined bore (mm diameters) into solver segments (m radii).
///
/// Consecutive points form one segment each. All zero-length, backwards and
/// overlapping segments are reported together.
pub fn bore_segments(points: &[CombinedMeasurement]) -> Result<Vec<BoreSegment>, GeometryError> {
    if points.len() < 2 {
        return Err(GeometryError::EmptyBore);
    }

    let mut segments = Vec::with_capacity(points.len() - 1);
    let mut faults = Vec::new();
    let mut prev_end: Option<f64> = None;

    for (index, pair) in points.windows(2).enumerate() {
        let x_start_m = pair[0].absolute_position * MM_TO_M;
        let x_end_m = pair[1].absolute_position * MM_TO_M;

        let kind = if x_end_m < x_start_m - SEGMENT_TOLERANCE_M {
            Some(SegmentFaultKind::Backwards)
        } else if x_end_m <= x_start_m + SEGMENT_TOLERANCE_M {
            Some(SegmentFaultKind::ZeroLength)
        } else if prev_end.is_some_and(|end| x_start_m < end - SEGMENT_TOLERANCE_M) {
            Some(SegmentFaultKind::Overlap)
        } else {
            None
        };
        if let Some(kind) = kind {
            faults.push(SegmentFault {
                index,
                kind,
                x_start_m,
                x_end_m,
            });
        }

        segments.push(BoreSegment {
            x_start_m,
            x_end_m,
            r_start_m: pair[0].diameter / 2.0 * MM_TO_M,
            r_end_m: pair[1].diameter / 2.0 * MM_TO_M,
            shape: ShapeKind::Linear,
        });
        prev_end = Some(prev_end.map_or(x_end_m, |end| end.max(x_end_m)));
    }

    if faults.is_empty() {
        Ok(segments)
    } else {
        for fault in &faults {
            log::error!(
                "bore segment {} is {:?}: {:.6} m -> {:.6} m",
                fault.index,
                fault.kind,
                fault.x_start_m,
                fault.x_end_m
            );
        }
        Err(GeometryError::InconsistentBore(faults))
    }
}

/// Side holes of every part in absolute coordinates, labelled in part order.
/// Holes wider than the bore they sit on produce advisory warnings.
pub fn side_holes(record: &FluteRecord) -> Result<(Vec<SideHole>, Vec<Issue>), GeometryError> {
    let parts = record.parts();
    let starts = combine::part_starts(parts)?;
    let counts: BTreeMap<_, _> = parts.iter().map(|(name, p)| (*name, p.holes.len())).collect();

    let mut holes = Vec::new();
    let mut warnings = Vec::new();
    for (part, index, label) in hole_labels(&counts) {
        let hole = &parts[&part].holes[index];
        let absolute_mm = starts[&part] + hole.position;

        let bore = diameter_at(record.combined_measurements(), absolute_mm);
        if let Some(bore) = bore.filter(|d| hole.diameter > *d) {
            warnings.push(Issue::warning(
                Some(part),
                IssueKind::HoleWiderThanBore,
                format!(
                    "{} diameter {:.2} mm exceeds bore diameter {:.2} mm at {:.1} mm",
                    label, hole.diameter, bore, absolute_mm
                ),
            ));
        }

        holes.push(SideHole {
            label,
            position_m: absolute_mm * MM_TO_M,
            chimney_m: hole.chimney * MM_TO_M,
            radius_m: hole.diameter / 2.0 * MM_TO_M,
            radius_out_m: hole.diameter_out / 2.0 * MM_TO_M,
        });
    }
    Ok((holes, warnings))
}

/// Build the solver inputs for a valid flute and a fingering chart.
///
/// Holes missing from the chart, the embouchure included, are added as
/// always-open rows.
pub fn build(record: &FluteRecord, mut fingering: FingeringChart) -> Result<AcousticInputSet, GeometryError> {
    record.ensure_valid()?;
    let bore_segments = bore_segments(record.combined_measurements())?;
    let (side_holes, warnings) = side_holes(record)?;

    if !side_holes.iter().any(|h| h.label == EMBOUCHURE_LABEL) {
        return Err(GeometryError::MissingEmbouchure);
    }

    let added = fingering.ensure_labels(side_holes.iter().map(|h| h.label.as_str()));
    for label in &added {
        if label != EMBOUCHURE_LABEL {
            log::warn!("{}: '{}' not in fingering chart, treated as always open", record.model, label);
        }
    }
    for warning in &warnings {
        log::warn!("{}: {}", record.model, warning);
    }

    log::debug!(
        "{}: {} bore segments, {} side holes, {} notes",
        record.model,
        bore_segments.len(),
        side_holes.len(),
        fingering.notes().len()
    );

    Ok(AcousticInputSet {
        bore_segments,
        side_holes,
        fingering,
        warnings,
    })
}

/// [`build`] with the fingering chart read from disk.
pub fn build_from_path(
    record: &FluteRecord,
    chart: &std::path::Path,
) -> Result<AcousticInputSet, BuildError> {
    let fingering = FingeringChart::from_path(chart)?;
    Ok(build(record, fingering)?)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::geometry::fixtures;

    pub fn sample_inputs() -> AcousticInputSet {
        let record = fixtures::sample_record();
        let chart = FingeringChart::parse(fixtures::SAMPLE_CHART).unwrap();
        build(&record, chart).unwrap()
    }
}
