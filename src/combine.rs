//! Assemble the four parts into one bore profile in absolute coordinates.
//!
//! Each part starts where the previous one's body ends:
//! `start_i = sum over j < i of (total_j - mortise_j)`. Measurements that lie
//! inside a tenon or socket overlap are dropped so each axial position is
//! described by exactly one part.

use std::collections::BTreeMap;

use crate::geometry::{CombinedMeasurement, GeometryError, PartGeometry, PartName};
use crate::validate::{Issue, IssueKind};

/// Combined bore plus the advisory warnings raised while building it.
#[derive(Debug, Clone, Default)]
pub struct Combined {
    pub points: Vec<CombinedMeasurement>,
    pub warnings: Vec<Issue>,
}

/// Absolute start offset (mm) of every part.
pub fn part_starts(
    parts: &BTreeMap<PartName, PartGeometry>,
) -> Result<BTreeMap<PartName, f64>, GeometryError> {
    let mut starts = BTreeMap::new();
    let mut offset = 0.0;
    for name in PartName::ALL {
        let part = parts.get(&name).ok_or(GeometryError::MissingPart(name))?;
        if part.body_length() < 0.0 {
            return Err(GeometryError::NegativeBodyLength {
                part: name,
                total: part.total_length,
                mortise: part.mortise_length,
            });
        }
        starts.insert(name, offset);
        offset += part.body_length();
    }
    Ok(starts)
}

/// Whether a measurement at `position` (relative to its part) survives.
fn keep(name: PartName, part: &PartGeometry, position: f64) -> bool {
    let mortise = part.mortise_length;
    match name {
        // The headjoint tenon slides into the left joint.
        PartName::Headjoint => {
            mortise <= 0.0 || mortise >= part.total_length || position < part.total_length - mortise
        }
        // The left socket receives the headjoint tenon.
        PartName::Left => position >= mortise,
        PartName::Right | PartName::Foot => mortise == 0.0 || position > mortise,
    }
}

/// Combine validated parts into a strictly increasing bore profile.
///
/// Fewer than two surviving points yields an empty profile with an advisory
/// warning rather than an error.
pub fn combine(parts: &BTreeMap<PartName, PartGeometry>) -> Result<Combined, GeometryError> {
    let starts = part_starts(parts)?;
    let mut combined = Combined::default();

    for name in PartName::ALL {
        let part = &parts[&name];
        let start = starts[&name];

        if name == PartName::Headjoint
            && part.mortise_length > 0.0
            && part.mortise_length >= part.total_length
        {
            combined.warnings.push(Issue::warning(
                Some(name),
                IssueKind::DegenerateMortise,
                format!(
                    "mortise {} mm spans the whole part; keeping every measurement",
                    part.mortise_length
                ),
            ));
        }

        let before = combined.points.len();
        for m in part.measurements.iter().filter(|m| keep(name, part, m.position)) {
            let absolute = start + m.position;
            if let Some(prev) = combined.points.last().filter(|p| absolute <= p.absolute_position) {
                return Err(GeometryError::NonMonotonic {
                    part: name,
                    position: m.position,
                    absolute,
                    previous: prev.absolute_position,
                });
            }
            combined.points.push(CombinedMeasurement {
                absolute_position: absolute,
                diameter: m.diameter,
                source_part: name,
                source_relative_position: m.position,
            });
        }
        log::debug!(
            "{}: start {:.1} mm, kept {}/{} measurements",
            name,
            start,
            combined.points.len() - before,
            part.measurements.len()
        );
    }

    if combined.points.len() < 2 {
        combined.warnings.push(Issue::warning(
            None,
            IssueKind::EmptyBore,
            format!(
                "only {} bore point(s) after combination; bore is empty",
                combined.points.len()
            ),
        ));
        combined.points.clear();
    }

    Ok(combined)
}

/// Bore diameter (mm) at an absolute position, linearly interpolated and
/// held constant beyond the ends. `None` for an empty profile.
pub fn diameter_at(points: &[CombinedMeasurement], position: f64) -> Option<f64> {
    let first = points.first()?;
    let last = points.last()?;
    if position <= first.absolute_position {
        return Some(first.diameter);
    }
    if position >= last.absolute_position {
        return Some(last.diameter);
    }
    let i = points.partition_point(|p| p.absolute_position <= position);
    let (a, b) = (&points[i - 1], &points[i]);
    let t = (position - a.absolute_position) / (b.absolute_position - a.absolute_position);
    Some(a.diameter + t * (b.diameter - a.diameter))
}
