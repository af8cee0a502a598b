//! Intonation metrics derived from the first two antiresonances of a note.
//!
//! With `f0`, `f1` the first two antiresonances and `fp` the playing
//! (target) frequency of the first register:
//! - inharmonicity: `1200 log2(f1 / 2f0)` cents
//! - MOC: `(1/f1 - 1/2fp) / (1/f0 - 1/fp)`
//! - B_I: `1200 log2(fp / f0)` cents
//! - ESPE: octave stretch from the effective length change between registers

use std::collections::BTreeMap;

use serde::Serialize;

use crate::acoustic::engine::AcousticResponse;
use crate::tuning::{self, SemitoneTable};

/// Temperature the length-based metrics are referred to.
pub const REFERENCE_TEMPERATURE_C: f64 = 20.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteMetrics {
    pub note: String,
    pub target_hz: Option<f64>,
    pub first_hz: Option<f64>,
    pub second_hz: Option<f64>,
    pub deviation_cents: Option<f64>,
    pub inharmonicity_cents: Option<f64>,
    pub moc: Option<f64>,
    pub b_i_cents: Option<f64>,
    pub espe_cents: Option<f64>,
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

pub fn inharmonicity_cents(f0: f64, f1: f64) -> Option<f64> {
    (f0 > 0.0 && f1 > 0.0).then(|| 1200.0 * (f1 / (2.0 * f0)).log2())
}

pub fn moc(f0: f64, f1: f64, fp: f64) -> Option<f64> {
    if f0 <= 0.0 || f1 <= 0.0 || fp <= 0.0 {
        return None;
    }
    let den = 1.0 / f0 - 1.0 / fp;
    if den.abs() <= 1e-9 {
        return None;
    }
    finite((1.0 / f1 - 1.0 / (2.0 * fp)) / den)
}

pub fn b_i_cents(f0: f64, fp: f64) -> Option<f64> {
    (f0 > 0.0 && fp > 0.0).then(|| 1200.0 * (fp / f0).log2())
}

pub fn espe_cents(f0: f64, f1: f64, fp: f64, c: f64) -> Option<f64> {
    if f0 <= 0.0 || f1 <= 0.0 || fp <= 0.0 {
        return None;
    }
    let dl_first = c / 2.0 * (1.0 / fp - 1.0 / f0);
    let dl_second = c * (1.0 / (2.0 * fp) - 1.0 / f1);
    let stretch = dl_second - dl_first;
    let length = c / (2.0 * fp);
    if length + stretch <= 1e-9 {
        return None;
    }
    finite(1200.0 * (length / (length + stretch)).log2())
}

/// Metrics for one analysed note.
pub fn note_metrics(response: &AcousticResponse, target_hz: Option<f64>) -> NoteMetrics {
    let found = response.antiresonance_frequencies(2);
    let first = found.first().copied();
    let second = found.get(1).copied();
    let c = tuning::speed_of_sound(REFERENCE_TEMPERATURE_C);

    let pair = first.zip(second);
    let with_target = |f: &dyn Fn(f64, f64, f64) -> Option<f64>| {
        pair.zip(target_hz).and_then(|((f0, f1), fp)| f(f0, f1, fp))
    };

    NoteMetrics {
        note: response.note.clone(),
        target_hz,
        first_hz: first,
        second_hz: second,
        deviation_cents: first.zip(target_hz).map(|(f0, fp)| tuning::cents(f0, fp)),
        inharmonicity_cents: pair.and_then(|(f0, f1)| inharmonicity_cents(f0, f1)),
        moc: with_target(&|f0, f1, fp| moc(f0, f1, fp)),
        b_i_cents: first.zip(target_hz).and_then(|(f0, fp)| b_i_cents(f0, fp)),
        espe_cents: with_target(&|f0, f1, fp| espe_cents(f0, f1, fp, c)),
    }
}

/// Metrics for the analysed notes in `notes` order (fingering-chart order);
/// notes without a response are left out.
pub fn metrics_table<'a>(
    analysis: &BTreeMap<String, AcousticResponse>,
    notes: impl IntoIterator<Item = &'a str>,
    semitones: &SemitoneTable,
    diapason_hz: f64,
) -> Vec<NoteMetrics> {
    notes
        .into_iter()
        .filter_map(|note| analysis.get(note))
        .map(|response| note_metrics(response, semitones.target(&response.note, diapason_hz)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex64;

    #[test]
    fn harmonic_resonances_give_neutral_metrics() {
        assert!(inharmonicity_cents(300.0, 600.0).unwrap().abs() < 1e-12);
        assert!((inharmonicity_cents(300.0, 606.0).unwrap() - 17.226).abs() < 1e-2);
        assert_eq!(moc(300.0, 600.0, 300.0), None);
        assert!((moc(310.0, 620.0, 300.0).unwrap() - 0.5).abs() < 1e-12);
        assert!(b_i_cents(300.0, 300.0).unwrap().abs() < 1e-12);
        assert!(espe_cents(300.0, 600.0, 300.0, 343.0).unwrap().abs() < 1e-9);
        assert_eq!(b_i_cents(0.0, 300.0), None);
    }

    #[test]
    fn flat_second_register_gives_positive_espe() {
        let espe = espe_cents(300.0, 590.0, 300.0, 343.0).unwrap();
        assert!(espe > 0.0);
    }

    #[test]
    fn metrics_from_response() {
        let response = AcousticResponse::new(
            "D",
            vec![200.0, 300.0, 500.0, 600.0],
            vec![
                Complex64::new(1.0, -1.0),
                Complex64::new(1.0, 1.0),
                Complex64::new(1.0, -1.0),
                Complex64::new(1.0, 1.0),
            ],
        );
        let metrics = note_metrics(&response, Some(250.0));
        assert_eq!(metrics.first_hz, Some(250.0));
        assert_eq!(metrics.second_hz, Some(550.0));
        assert!(metrics.deviation_cents.unwrap().abs() < 1e-12);
        assert!(metrics.inharmonicity_cents.unwrap() > 0.0);
        assert!(metrics.moc.is_none());
        assert!(metrics.espe_cents.is_some());

        let untargeted = note_metrics(&response, None);
        assert!(untargeted.b_i_cents.is_none());
        assert!(untargeted.inharmonicity_cents.is_some());
    }

    #[test]
    fn table_follows_chart_order() {
        let response = |note: &str| {
            AcousticResponse::new(
                note,
                vec![200.0, 300.0],
                vec![Complex64::new(1.0, -1.0), Complex64::new(1.0, 1.0)],
            )
        };
        let analysis: BTreeMap<String, AcousticResponse> = ["A", "Cs", "D"]
            .into_iter()
            .map(|n| (n.to_string(), response(n)))
            .collect();
        let rows = metrics_table(&analysis, ["D", "E", "A", "Cs"], &SemitoneTable::default(), 415.0);
        let notes: Vec<&str> = rows.iter().map(|r| r.note.as_str()).collect();
        assert_eq!(notes, ["D", "A", "Cs"]);
        assert_eq!(rows[1].target_hz, Some(415.0));
        assert_eq!(rows[0].first_hz, Some(250.0));
    }
}
