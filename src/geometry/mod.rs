//! Typed flute geometry: parts, measurements, holes and the flute record that
//! owns them together with its validation state and per-note analysis.

pub mod io;
pub mod raw;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::acoustic::engine::AcousticResponse;
use crate::combine;
use crate::validate::{self, Issue, IssueKind, ValidationReport};
pub use raw::{RawFlute, RawPart};

/// The four joints of a traverso, in assembly order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartName {
    Headjoint,
    Left,
    Right,
    Foot,
}

impl PartName {
    pub const ALL: [PartName; 4] = [
        PartName::Headjoint,
        PartName::Left,
        PartName::Right,
        PartName::Foot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Headjoint => "headjoint",
            Self::Left => "left",
            Self::Right => "right",
            Self::Foot => "foot",
        }
    }

    /// Position in the assembly order (headjoint = 0).
    pub fn index(&self) -> usize {
        match self {
            Self::Headjoint => 0,
            Self::Left => 1,
            Self::Right => 2,
            Self::Foot => 3,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.as_str())
    }
}

impl fmt::Display for PartName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bore diameter measured at a position along one part (both mm).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub position: f64,
    pub diameter: f64,
}

/// A side hole on one part. Position is relative to the part start; all mm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hole {
    pub position: f64,
    pub diameter: f64,
    pub chimney: f64,
    pub diameter_out: f64,
}

/// Validated geometry of one flute part (mm).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartGeometry {
    pub total_length: f64,
    pub mortise_length: f64,
    pub measurements: Vec<Measurement>,
    pub holes: Vec<Hole>,
}

impl PartGeometry {
    /// Length this part adds to the assembled flute.
    pub fn body_length(&self) -> f64 {
        self.total_length - self.mortise_length
    }
}

/// One point of the assembled bore profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CombinedMeasurement {
    pub absolute_position: f64,
    pub diameter: f64,
    pub source_part: PartName,
    pub source_relative_position: f64,
}

/// Which hole slot carries the embouchure: the headjoint's first hole.
pub fn is_embouchure_slot(part: PartName, index: usize) -> bool {
    part == PartName::Headjoint && index == 0
}

/// Assign acoustic labels to every hole, in part order.
///
/// The embouchure slot is labelled `embouchure`; every other hole is numbered
/// `hole1`, `hole2`, ... across parts. Returns `(part, index, label)`.
pub fn hole_labels(counts: &BTreeMap<PartName, usize>) -> Vec<(PartName, usize, String)> {
    let mut labels = Vec::new();
    let mut next = 1;
    for part in PartName::ALL {
        let n = counts.get(&part).copied().unwrap_or(0);
        for index in 0..n {
            if is_embouchure_slot(part, index) {
                labels.push((part, index, crate::EMBOUCHURE_LABEL.to_string()));
            } else {
                labels.push((part, index, format!("hole{}", next)));
                next += 1;
            }
        }
    }
    labels
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("flute has {} validation error(s), first: {}", .0.len(), first_message(.0))]
    Invalid(Vec<Issue>),
    #[error("part '{0}' is missing")]
    MissingPart(PartName),
    #[error("{part}: mortise length {mortise} mm exceeds total length {total} mm")]
    NegativeBodyLength {
        part: PartName,
        total: f64,
        mortise: f64,
    },
    #[error(
        "bore regresses in {part} at local {position} mm: absolute {absolute} mm does not follow {previous} mm"
    )]
    NonMonotonic {
        part: PartName,
        position: f64,
        absolute: f64,
        previous: f64,
    },
    #[error("combined bore is empty; cannot build acoustic geometry")]
    EmptyBore,
    #[error("bore has {} inconsistent segment(s)", .0.len())]
    InconsistentBore(Vec<SegmentFault>),
    #[error("headjoint declares no embouchure hole")]
    MissingEmbouchure,
}

fn first_message(issues: &[Issue]) -> String {
    issues
        .first()
        .map(|i| i.to_string())
        .unwrap_or_default()
}

/// Why a pair of consecutive bore points cannot form a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentFaultKind {
    ZeroLength,
    Backwards,
    Overlap,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SegmentFault {
    pub index: usize,
    pub kind: SegmentFaultKind,
    pub x_start_m: f64,
    pub x_end_m: f64,
}

/// A flute: its raw part data, the validated view of it, and derived results.
///
/// Validation state is recomputed from the raw data on construction and after
/// every [`FluteRecord::apply_edit`]; nothing else mutates the geometry.
#[derive(Debug, Clone)]
pub struct FluteRecord {
    pub model: String,
    pub diapason_hz: f64,
    pub temperature_c: f64,
    raw: RawFlute,
    parts: BTreeMap<PartName, PartGeometry>,
    combined: Vec<CombinedMeasurement>,
    report: ValidationReport,
    analysis: BTreeMap<String, AcousticResponse>,
}

impl FluteRecord {
    pub fn from_raw(model: impl Into<String>, raw: RawFlute, diapason_hz: f64, temperature_c: f64) -> Self {
        let mut record = Self {
            model: model.into(),
            diapason_hz,
            temperature_c,
            raw,
            parts: BTreeMap::new(),
            combined: Vec::new(),
            report: ValidationReport::default(),
            analysis: BTreeMap::new(),
        };
        record.refresh();
        record
    }

    /// Build a record from an in-memory mapping of typed parts.
    pub fn from_parts(
        model: impl Into<String>,
        parts: &BTreeMap<PartName, PartGeometry>,
        diapason_hz: f64,
        temperature_c: f64,
    ) -> Self {
        let raw = RawFlute {
            parts: parts
                .iter()
                .map(|(name, geom)| (*name, RawPart::from_geometry(geom)))
                .collect(),
        };
        Self::from_raw(model, raw, diapason_hz, temperature_c)
    }

    /// Mutate the raw data and re-run validation and combination.
    ///
    /// Previous analysis results are discarded since they describe the old
    /// geometry.
    pub fn apply_edit<F: FnOnce(&mut RawFlute)>(&mut self, edit: F) -> &ValidationReport {
        edit(&mut self.raw);
        self.analysis.clear();
        self.refresh();
        &self.report
    }

    fn refresh(&mut self) {
        self.report = validate::validate(&mut self.raw);
        self.parts.clear();
        self.combined.clear();

        if !self.report.errors.is_empty() {
            log::warn!(
                "{}: {} validation error(s), skipping combination",
                self.model,
                self.report.errors.len()
            );
            return;
        }

        for part in PartName::ALL {
            match self.raw.parts.get(&part).and_then(RawPart::to_geometry) {
                Some(geom) => {
                    self.parts.insert(part, geom);
                }
                None => self.report.errors.push(Issue::error(
                    Some(part),
                    IssueKind::MalformedPart,
                    "part data could not be read after validation",
                )),
            }
        }
        if !self.report.errors.is_empty() {
            self.parts.clear();
            return;
        }

        match combine::combine(&self.parts) {
            Ok(combined) => {
                self.combined = combined.points;
                self.report.warnings.extend(combined.warnings);
            }
            Err(e) => {
                log::warn!("{}: {}", self.model, e);
                self.report
                    .errors
                    .push(Issue::error(None, IssueKind::Geometry, e.to_string()));
            }
        }
    }

    pub fn raw(&self) -> &RawFlute {
        &self.raw
    }

    pub fn report(&self) -> &ValidationReport {
        &self.report
    }

    pub fn errors(&self) -> &[Issue] {
        &self.report.errors
    }

    pub fn warnings(&self) -> &[Issue] {
        &self.report.warnings
    }

    pub fn is_valid(&self) -> bool {
        self.report.errors.is_empty()
    }

    /// Fail with the recorded errors if any stage found the flute invalid.
    pub fn ensure_valid(&self) -> Result<(), GeometryError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(GeometryError::Invalid(self.report.errors.clone()))
        }
    }

    pub fn parts(&self) -> &BTreeMap<PartName, PartGeometry> {
        &self.parts
    }

    pub fn part(&self, name: PartName) -> Option<&PartGeometry> {
        self.parts.get(&name)
    }

    pub fn combined_measurements(&self) -> &[CombinedMeasurement] {
        &self.combined
    }

    /// Total hole count across all parts.
    pub fn hole_count(&self) -> usize {
        self.parts.values().map(|p| p.holes.len()).sum()
    }

    pub fn analysis(&self) -> &BTreeMap<String, AcousticResponse> {
        &self.analysis
    }

    pub fn set_analysis(&mut self, analysis: BTreeMap<String, AcousticResponse>) {
        self.analysis = analysis;
    }
}
