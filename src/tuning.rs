//! Target playing frequencies and small acoustic helpers.
//!
//! Targets follow equal temperament relative to the diapason A:
//! `f = diapason * 2^(n/12)` where `n` is the note's semitone offset from A.

use std::collections::BTreeMap;

/// Default semitone offsets from A for the traverso's first-octave notes.
pub const DEFAULT_SEMITONES: [(&str, i32); 7] = [
    ("D", -7),
    ("E", -5),
    ("Fs", -3),
    ("G", -2),
    ("A", 0),
    ("B", 2),
    ("Cs", 4),
];

/// Baroque pitch.
pub const DEFAULT_DIAPASON_HZ: f64 = 415.0;

/// Semitone offsets from A, keyed by fingering-chart note label.
#[derive(Debug, Clone, PartialEq)]
pub struct SemitoneTable(BTreeMap<String, i32>);

impl Default for SemitoneTable {
    fn default() -> Self {
        Self(
            DEFAULT_SEMITONES
                .iter()
                .map(|(note, n)| (note.to_string(), *n))
                .collect(),
        )
    }
}

impl SemitoneTable {
    /// Defaults with user entries added or replacing built-in ones.
    pub fn with_overrides(overrides: &BTreeMap<String, i32>) -> Self {
        let mut table = Self::default();
        for (note, n) in overrides {
            table.0.insert(note.clone(), *n);
        }
        table
    }

    pub fn offset(&self, note: &str) -> Option<i32> {
        self.0.get(note).copied()
    }

    /// Target frequency for a note, or `None` if the note has no offset.
    pub fn target(&self, note: &str, diapason_hz: f64) -> Option<f64> {
        self.offset(note)
            .map(|n| equal_tempered(diapason_hz, f64::from(n)))
    }

    /// Targets for notes in the given order; unknown notes map to `None`.
    pub fn targets<'a>(
        &self,
        notes: impl IntoIterator<Item = &'a str>,
        diapason_hz: f64,
    ) -> Vec<(String, Option<f64>)> {
        notes
            .into_iter()
            .map(|note| (note.to_string(), self.target(note, diapason_hz)))
            .collect()
    }
}

/// `diapason * 2^(semitones/12)`
pub fn equal_tempered(diapason_hz: f64, semitones: f64) -> f64 {
    diapason_hz * 2f64.powf(semitones / 12.0)
}

/// Deviation of `freq` from `target` in cents.
pub fn cents(freq: f64, target: f64) -> f64 {
    1200.0 * (freq / target).log2()
}

/// Speed of sound in air (m/s) at a temperature in Celsius.
pub fn speed_of_sound(temperature_c: f64) -> f64 {
    331.3 * (1.0 + temperature_c / 273.15).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn b_at_baroque_pitch() {
        let table = SemitoneTable::default();
        let b = table.target("B", 415.0).unwrap();
        assert!((b - 465.8).abs() < 0.1, "got {b}");
        assert_eq!(table.target("A", 415.0), Some(415.0));
        let d = table.target("D", 415.0).unwrap();
        assert!((d - 277.0).abs() < 0.1, "got {d}");
    }

    #[test]
    fn unknown_note_has_no_target() {
        let table = SemitoneTable::default();
        let targets = table.targets(["D", "Gs"], 415.0);
        assert!(targets[0].1.is_some());
        assert_eq!(targets[1], ("Gs".to_string(), None));
    }

    #[test]
    fn overrides_add_and_replace() {
        let overrides = BTreeMap::from([("Gs".to_string(), -1), ("A".to_string(), 12)]);
        let table = SemitoneTable::with_overrides(&overrides);
        assert_eq!(table.offset("Gs"), Some(-1));
        assert_eq!(table.target("A", 415.0), Some(830.0));
        assert_eq!(table.offset("D"), Some(-7));
    }

    #[test]
    fn cents_and_sound_speed() {
        assert!((cents(880.0, 440.0) - 1200.0).abs() < 1e-9);
        assert!(cents(440.0, 440.0).abs() < 1e-12);
        assert!((speed_of_sound(0.0) - 331.3).abs() < 1e-12);
        let c25 = speed_of_sound(25.0);
        assert!(c25 > 346.0 && c25 < 347.0, "got {c25}");
    }
}
