//! Structural and physical validation of raw part data.
//!
//! Validation normalizes what it can in place (negative positions, unsorted
//! measurements, elliptical hole diameters, missing chimney and outer
//! diameter columns) and records each such change as a correction warning.
//! Everything it cannot repair becomes an error.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::{Value, json};

use crate::geometry::{PartName, RawFlute, RawPart, hole_labels};
use crate::{
    DEFAULT_CHIMNEY_MM, DEFAULT_DIAMETER_OUT_FACTOR, DEFAULT_EMBOUCHURE_CHIMNEY_MM, EMBOUCHURE_LABEL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    // errors
    MissingPart,
    MalformedPart,
    MissingTotalLength,
    InvalidTotalLength,
    MissingMortiseLength,
    InvalidMortiseLength,
    MortiseExceedsTotal,
    MalformedMeasurements,
    InvalidMeasurement,
    DuplicateMeasurement,
    MalformedHoles,
    HoleCountMismatch,
    HolePositionOutOfRange,
    InvalidHoleDiameter,
    Geometry,
    // corrections
    NegativePositionCorrected,
    MeasurementsSorted,
    EllipticalDiameter,
    ChimneyDefaulted,
    DiameterOutDefaulted,
    HoleColumnResized,
    // advisories
    PositionBeyondLength,
    DegenerateMortise,
    EmptyBore,
    HoleWiderThanBore,
}

impl IssueKind {
    /// Corrections are warnings that record an in-place change to the data.
    pub fn is_correction(&self) -> bool {
        matches!(
            self,
            Self::NegativePositionCorrected
                | Self::MeasurementsSorted
                | Self::EllipticalDiameter
                | Self::ChimneyDefaulted
                | Self::DiameterOutDefaulted
                | Self::HoleColumnResized
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub part: Option<PartName>,
    pub kind: IssueKind,
    pub message: String,
}

impl Issue {
    pub fn error(part: Option<PartName>, kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            part,
            kind,
            message: message.into(),
        }
    }

    pub fn warning(part: Option<PartName>, kind: IssueKind, message: impl Into<String>) -> Self {
        Self::error(part, kind, message)
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.part {
            Some(part) => write!(f, "[{}] {}", part, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Errors block combination; warnings never do.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<Issue>,
    pub warnings: Vec<Issue>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn corrections(&self) -> impl Iterator<Item = &Issue> {
        self.warnings.iter().filter(|w| w.kind.is_correction())
    }

    pub fn advisories(&self) -> impl Iterator<Item = &Issue> {
        self.warnings.iter().filter(|w| !w.kind.is_correction())
    }

    fn error(&mut self, part: PartName, kind: IssueKind, message: String) {
        self.errors.push(Issue::error(Some(part), kind, message));
    }

    fn warn(&mut self, part: PartName, kind: IssueKind, message: String) {
        self.warnings.push(Issue::warning(Some(part), kind, message));
    }
}

/// Validate and normalize every part of a flute.
pub fn validate(raw: &mut RawFlute) -> ValidationReport {
    let mut report = ValidationReport::default();
    for part in PartName::ALL {
        match raw.parts.get_mut(&part) {
            Some(data) => validate_part(part, data, &mut report),
            None => report.error(part, IssueKind::MissingPart, "part data is missing".to_string()),
        }
    }
    for issue in &report.errors {
        log::debug!("validation error: {}", issue);
    }
    for issue in &report.warnings {
        log::debug!("validation warning: {}", issue);
    }
    report
}

/// Validate and normalize one part, appending findings to `report`.
pub fn validate_part(part: PartName, raw: &mut RawPart, report: &mut ValidationReport) {
    let total = validate_lengths(part, raw, report);
    validate_measurements(part, raw, total, report);
    validate_holes(part, raw, total, report);
}

fn finite_number(value: &Value) -> Option<f64> {
    value.as_f64().filter(|v| v.is_finite())
}

fn validate_lengths(part: PartName, raw: &RawPart, report: &mut ValidationReport) -> Option<f64> {
    let total = match &raw.total_length {
        None => {
            report.error(part, IssueKind::MissingTotalLength, "total length is missing".into());
            None
        }
        Some(v) => match finite_number(v) {
            Some(t) if t > 0.0 => Some(t),
            _ => {
                report.error(
                    part,
                    IssueKind::InvalidTotalLength,
                    format!("total length must be a positive number, got {}", v),
                );
                None
            }
        },
    };

    match &raw.mortise_length {
        None => report.error(part, IssueKind::MissingMortiseLength, "mortise length is missing".into()),
        Some(v) => match finite_number(v) {
            Some(m) if m >= 0.0 => match total {
                Some(t) if m > t => report.error(
                    part,
                    IssueKind::MortiseExceedsTotal,
                    format!("mortise length {} mm exceeds total length {} mm", m, t),
                ),
                _ => {}
            },
            _ => report.error(
                part,
                IssueKind::InvalidMortiseLength,
                format!("mortise length must be a non-negative number, got {}", v),
            ),
        },
    }

    total
}

fn validate_measurements(
    part: PartName,
    raw: &mut RawPart,
    total: Option<f64>,
    report: &mut ValidationReport,
) {
    let items = match raw.measurements.as_mut() {
        None => {
            report.error(part, IssueKind::MalformedMeasurements, "measurements are missing".into());
            return;
        }
        Some(Value::Array(items)) => items,
        Some(other) => {
            report.error(
                part,
                IssueKind::MalformedMeasurements,
                format!("measurements must be a list, got {}", other),
            );
            return;
        }
    };

    let mut readable = true;
    for (i, item) in items.iter_mut().enumerate() {
        let Some(obj) = item.as_object_mut() else {
            report.error(
                part,
                IssueKind::InvalidMeasurement,
                format!("measurement {} is not an object: {}", i, item),
            );
            readable = false;
            continue;
        };

        let position = obj.get("position").and_then(finite_number);
        let diameter = obj.get("diameter").and_then(finite_number);
        let (Some(position), Some(diameter)) = (position, diameter) else {
            report.error(
                part,
                IssueKind::InvalidMeasurement,
                format!("measurement {} needs numeric position and diameter", i),
            );
            readable = false;
            continue;
        };

        if diameter <= 0.0 {
            report.error(
                part,
                IssueKind::InvalidMeasurement,
                format!("measurement {} has non-positive diameter {}", i, diameter),
            );
        }

        let position = if position < 0.0 {
            obj.insert("position".into(), json!(position.abs()));
            report.warn(
                part,
                IssueKind::NegativePositionCorrected,
                format!("measurement {} position {} made positive", i, position),
            );
            position.abs()
        } else {
            position
        };

        if let Some(t) = total.filter(|t| position > *t) {
            report.warn(
                part,
                IssueKind::PositionBeyondLength,
                format!("measurement {} at {} mm lies beyond total length {} mm", i, position, t),
            );
        }
    }

    if !readable {
        return;
    }

    let position_of = |v: &Value| v.get("position").and_then(Value::as_f64).unwrap_or(0.0);
    let sorted = items
        .windows(2)
        .all(|w| position_of(&w[0]) <= position_of(&w[1]));
    if !sorted {
        items.sort_by(|a, b| position_of(a).total_cmp(&position_of(b)));
        report.warn(part, IssueKind::MeasurementsSorted, "measurements sorted by position".into());
    }

    for w in items.windows(2) {
        if position_of(&w[0]) == position_of(&w[1]) {
            report.error(
                part,
                IssueKind::DuplicateMeasurement,
                format!("two measurements at position {} mm", position_of(&w[0])),
            );
        }
    }
}

/// Reduce an elliptical `[a, b]` diameter to the equal-area circle.
fn equal_area_diameter(value: &Value) -> Option<f64> {
    let pair = value.as_array()?;
    if pair.len() != 2 {
        return None;
    }
    let a = finite_number(&pair[0])?;
    let b = finite_number(&pair[1])?;
    (a > 0.0 && b > 0.0).then(|| (a * b).sqrt())
}

fn validate_holes(part: PartName, raw: &mut RawPart, total: Option<f64>, report: &mut ValidationReport) {
    let (positions, diameters) = match (raw.holes_position.as_mut(), raw.holes_diameter.as_mut()) {
        (None, None) => return,
        (Some(Value::Array(p)), Some(Value::Array(d))) => (p, d),
        _ => {
            report.error(
                part,
                IssueKind::MalformedHoles,
                "hole positions and diameters must both be lists".into(),
            );
            return;
        }
    };

    if positions.len() != diameters.len() {
        report.error(
            part,
            IssueKind::HoleCountMismatch,
            format!(
                "{} hole positions but {} hole diameters",
                positions.len(),
                diameters.len()
            ),
        );
        return;
    }

    let errors_before = report.errors.len();
    for (i, position) in positions.iter().enumerate() {
        match finite_number(position) {
            Some(p) if p >= 0.0 && total.is_none_or(|t| p <= t) => {}
            Some(p) => report.error(
                part,
                IssueKind::HolePositionOutOfRange,
                format!("hole {} position {} mm is outside the part", i, p),
            ),
            None => report.error(
                part,
                IssueKind::MalformedHoles,
                format!("hole {} position is not a number: {}", i, position),
            ),
        }
    }

    for (i, diameter) in diameters.iter_mut().enumerate() {
        if let Some(d) = equal_area_diameter(diameter) {
            report.warn(
                part,
                IssueKind::EllipticalDiameter,
                format!("hole {} elliptical diameter {} reduced to {:.3} mm", i, diameter, d),
            );
            *diameter = json!(d);
            continue;
        }
        match finite_number(diameter) {
            Some(d) if d > 0.0 => {}
            _ => report.error(
                part,
                IssueKind::InvalidHoleDiameter,
                format!("hole {} diameter must be positive, got {}", i, diameter),
            ),
        }
    }

    if report.errors.len() > errors_before {
        return;
    }

    let inner: Vec<f64> = diameters.iter().filter_map(finite_number).collect();
    let n = inner.len();

    let labels = hole_labels(&BTreeMap::from([(part, n)]));
    let mut chimneys = fill_column(part, raw.holes_chimney.take(), n, "chimney", report);
    for i in 0..n {
        let ok = finite_number(&chimneys[i]).is_some_and(|c| c > 0.0);
        if !ok {
            let embouchure = labels.get(i).is_some_and(|(_, _, label)| label == EMBOUCHURE_LABEL);
            let default = if embouchure {
                DEFAULT_EMBOUCHURE_CHIMNEY_MM
            } else {
                DEFAULT_CHIMNEY_MM
            };
            report.warn(
                part,
                IssueKind::ChimneyDefaulted,
                format!("hole {} chimney {} replaced by default {} mm", i, chimneys[i], default),
            );
            chimneys[i] = json!(default);
        }
    }
    raw.holes_chimney = Some(Value::Array(chimneys));

    let mut outer = fill_column(part, raw.holes_diameter_out.take(), n, "diameter_out", report);
    for i in 0..n {
        if let Some(d) = equal_area_diameter(&outer[i]) {
            report.warn(
                part,
                IssueKind::EllipticalDiameter,
                format!("hole {} elliptical outer diameter reduced to {:.3} mm", i, d),
            );
            outer[i] = json!(d);
        }
        let ok = finite_number(&outer[i]).is_some_and(|d| d > inner[i]);
        if !ok {
            let default = inner[i] * DEFAULT_DIAMETER_OUT_FACTOR;
            report.warn(
                part,
                IssueKind::DiameterOutDefaulted,
                format!("hole {} outer diameter {} replaced by {:.3} mm", i, outer[i], default),
            );
            outer[i] = json!(default);
        }
    }
    raw.holes_diameter_out = Some(Value::Array(outer));
}

/// Make an optional per-hole column a list of exactly `n` entries, padding
/// with nulls that the caller then replaces with defaults.
fn fill_column(
    part: PartName,
    column: Option<Value>,
    n: usize,
    name: &str,
    report: &mut ValidationReport,
) -> Vec<Value> {
    let mut items = match column {
        Some(Value::Array(items)) => items,
        None => Vec::new(),
        Some(_) => {
            report.warn(
                part,
                IssueKind::HoleColumnResized,
                format!("hole {} column is not a list, rebuilt", name),
            );
            Vec::new()
        }
    };
    if items.len() > n {
        report.warn(
            part,
            IssueKind::HoleColumnResized,
            format!("hole {} column has {} entries for {} holes, truncated", name, items.len(), n),
        );
        items.truncate(n);
    }
    items.resize(n, Value::Null);
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::fixtures;

    fn raw_part(value: Value) -> RawPart {
        serde_json::from_value(value).unwrap()
    }

    fn check(part: PartName, raw: &mut RawPart) -> ValidationReport {
        let mut report = ValidationReport::default();
        validate_part(part, raw, &mut report);
        report
    }

    #[test]
    fn elliptical_hole_becomes_equal_area_circle() {
        let mut raw = raw_part(json!({
            "Total length": 220, "Mortise length": 20,
            "measurements": [{"position": 0, "diameter": 18}],
            "Holes position": [60], "Holes diameter": [[6, 4]],
            "Holes chimney": [3.5], "Holes diameter_out": [8]
        }));
        let report = check(PartName::Left, &mut raw);
        assert!(report.is_ok(), "{:?}", report.errors);
        let d = raw.holes_diameter.as_ref().unwrap()[0].as_f64().unwrap();
        assert!((d - 4.899).abs() < 1e-3);
        assert_eq!(report.corrections().count(), 1);
    }

    #[test]
    fn mortise_longer_than_part_is_an_error() {
        let mut raw = raw_part(json!({
            "Total length": 100, "Mortise length": 120,
            "measurements": [{"position": 0, "diameter": 18}]
        }));
        let report = check(PartName::Right, &mut raw);
        assert!(report.errors.iter().any(|e| e.kind == IssueKind::MortiseExceedsTotal));
    }

    #[test]
    fn missing_or_bad_lengths_are_errors() {
        let mut raw = raw_part(json!({ "Total length": "long", "measurements": [] }));
        let kinds: Vec<IssueKind> = check(PartName::Foot, &mut raw)
            .errors
            .iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&IssueKind::InvalidTotalLength));
        assert!(kinds.contains(&IssueKind::MissingMortiseLength));
    }

    #[test]
    fn negative_and_unsorted_positions_are_corrected() {
        let mut raw = raw_part(json!({
            "Total length": 200, "Mortise length": 0,
            "measurements": [
                {"position": 50, "diameter": 19},
                {"position": -10, "diameter": 19.5},
                {"position": 210, "diameter": 18}
            ]
        }));
        let report = check(PartName::Headjoint, &mut raw);
        assert!(report.is_ok());
        let positions: Vec<f64> = raw.measurements.as_ref().unwrap().as_array().unwrap()
            .iter()
            .map(|m| m["position"].as_f64().unwrap())
            .collect();
        assert_eq!(positions, vec![10.0, 50.0, 210.0]);
        let kinds: Vec<IssueKind> = report.warnings.iter().map(|w| w.kind).collect();
        assert!(kinds.contains(&IssueKind::NegativePositionCorrected));
        assert!(kinds.contains(&IssueKind::MeasurementsSorted));
        assert!(kinds.contains(&IssueKind::PositionBeyondLength));
    }

    #[test]
    fn bad_measurements_and_holes_are_errors() {
        let mut raw = raw_part(json!({
            "Total length": 200, "Mortise length": 10,
            "measurements": [{"position": 0, "diameter": 0}, {"position": 5}],
            "Holes position": [20, 250], "Holes diameter": [9]
        }));
        let report = check(PartName::Headjoint, &mut raw);
        let kinds: Vec<IssueKind> = report.errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds.iter().filter(|k| **k == IssueKind::InvalidMeasurement).count(),
            2
        );
        assert!(kinds.contains(&IssueKind::HoleCountMismatch));

        let mut raw = raw_part(json!({
            "Total length": 200, "Mortise length": 10,
            "measurements": [],
            "Holes position": [20, 250], "Holes diameter": [9, -1]
        }));
        let kinds: Vec<IssueKind> = check(PartName::Left, &mut raw)
            .errors
            .iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&IssueKind::HolePositionOutOfRange));
        assert!(kinds.contains(&IssueKind::InvalidHoleDiameter));
    }

    #[test]
    fn missing_hole_columns_get_defaults() {
        let mut raw = raw_part(json!({
            "Total length": 200, "Mortise length": 20,
            "measurements": [{"position": 0, "diameter": 19}],
            "Holes position": [20, 80], "Holes diameter": [9, 6],
            "Holes chimney": [0]
        }));
        let report = check(PartName::Headjoint, &mut raw);
        assert!(report.is_ok());
        let chimneys = raw.holes_chimney.as_ref().unwrap();
        assert_eq!(chimneys, &json!([DEFAULT_EMBOUCHURE_CHIMNEY_MM, DEFAULT_CHIMNEY_MM]));
        let outer: Vec<f64> = raw.holes_diameter_out.as_ref().unwrap().as_array().unwrap()
            .iter()
            .map(|v| v.as_f64().unwrap())
            .collect();
        assert!((outer[0] - 10.8).abs() < 1e-9);
        assert!((outer[1] - 7.2).abs() < 1e-9);
        assert_eq!(
            report.warnings.iter().filter(|w| w.kind == IssueKind::ChimneyDefaulted).count(),
            2
        );
    }

    #[test]
    fn only_the_embouchure_gets_the_embouchure_default() {
        let mut raw = raw_part(json!({
            "Total length": 220, "Mortise length": 20,
            "measurements": [{"position": 0, "diameter": 18}],
            "Holes position": [60, 95], "Holes diameter": [6.5, 6.8]
        }));
        let report = check(PartName::Left, &mut raw);
        assert!(report.is_ok());
        assert_eq!(raw.holes_chimney, Some(json!([DEFAULT_CHIMNEY_MM, DEFAULT_CHIMNEY_MM])));
    }

    #[test]
    fn outer_diameter_not_wider_than_inner_is_replaced() {
        let mut raw = raw_part(json!({
            "Total length": 200, "Mortise length": 20,
            "measurements": [],
            "Holes position": [50], "Holes diameter": [6],
            "Holes chimney": [3], "Holes diameter_out": [5, 9]
        }));
        let report = check(PartName::Right, &mut raw);
        assert!(report.warnings.iter().any(|w| w.kind == IssueKind::HoleColumnResized));
        let outer = raw.holes_diameter_out.as_ref().unwrap()[0].as_f64().unwrap();
        assert!((outer - 7.2).abs() < 1e-9);
        assert_eq!(raw.holes_chimney, Some(json!([3])));
    }

    #[test]
    fn second_pass_repeats_only_advisories() {
        let mut raw = RawFlute {
            parts: fixtures::sample_parts()
                .iter()
                .map(|(name, geom)| (*name, RawPart::from_geometry(geom)))
                .collect(),
        };
        if let Some(left) = raw.parts.get_mut(&PartName::Left) {
            left.holes_diameter = Some(json!([[7, 6], 6.8, 5.8]));
            left.holes_chimney = None;
            left.holes_diameter_out = Some(json!([1]));
            left.measurements = Some(json!([
                {"position": 120, "diameter": 17},
                {"position": -20, "diameter": 18.2},
                {"position": 215, "diameter": 16},
                {"position": 225, "diameter": 15.8}
            ]));
        }

        let first = validate(&mut raw);
        assert!(first.is_ok(), "{:?}", first.errors);
        assert!(first.corrections().count() > 0);

        let snapshot = raw.clone();
        let second = validate(&mut raw);
        assert!(second.is_ok());
        assert_eq!(second.corrections().count(), 0);
        assert_eq!(raw, snapshot);

        // only the point beyond the left joint's length is reported again
        let advisories = |r: &ValidationReport| -> Vec<(Option<PartName>, IssueKind)> {
            r.advisories().map(|w| (w.part, w.kind)).collect()
        };
        let expected = vec![(Some(PartName::Left), IssueKind::PositionBeyondLength)];
        assert_eq!(advisories(&first), expected);
        assert_eq!(advisories(&second), expected);
        assert_eq!(second.warnings.len(), 1, "{:?}", second.warnings);

        let third = validate(&mut raw);
        assert_eq!(third, second);
    }

    #[test]
    fn missing_part_is_reported() {
        let mut raw = RawFlute::default();
        let report = validate(&mut raw);
        assert_eq!(report.errors.len(), 4);
        assert!(report.errors.iter().all(|e| e.kind == IssueKind::MissingPart));
    }
}
