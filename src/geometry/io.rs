//! Flute directories on disk: one JSON file per part.

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use walkdir::WalkDir;

use super::raw::{RawFlute, RawPart};
use super::{FluteRecord, PartName};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> LoadError + '_ {
    move |source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read the four part files of a flute directory.
pub fn load_flute_dir(dir: &Path) -> Result<RawFlute, LoadError> {
    if !dir.is_dir() {
        return Err(LoadError::NotADirectory(dir.to_path_buf()));
    }
    let mut raw = RawFlute::default();
    for part in PartName::ALL {
        let path = dir.join(part.file_name());
        let contents = std::fs::read_to_string(&path).map_err(io_error(&path))?;
        let parsed: RawPart =
            serde_json::from_str(&contents).map_err(|source| LoadError::Json {
                path: path.clone(),
                source,
            })?;
        log::debug!("Loaded {}", path.display());
        raw.parts.insert(part, parsed);
    }
    Ok(raw)
}

/// Reorder the hole columns of a part by hole position. Columns that are not
/// all numeric lists of the same length are left alone.
fn co_sort_holes(part: &RawPart) -> RawPart {
    let mut sorted = part.clone();
    let columns = [
        &part.holes_position,
        &part.holes_diameter,
        &part.holes_chimney,
        &part.holes_diameter_out,
    ];
    let arrays: Option<Vec<&Vec<Value>>> = columns
        .iter()
        .map(|c| c.as_ref().and_then(Value::as_array))
        .collect();
    let Some(arrays) = arrays else {
        return sorted;
    };
    let n = arrays[0].len();
    if arrays.iter().any(|a| a.len() != n) {
        return sorted;
    }
    let positions: Option<Vec<f64>> = arrays[0].iter().map(Value::as_f64).collect();
    let Some(positions) = positions else {
        return sorted;
    };

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| positions[a].total_cmp(&positions[b]));
    let permute = |a: &Vec<Value>| Some(Value::Array(order.iter().map(|&i| a[i].clone()).collect()));
    sorted.holes_position = permute(arrays[0]);
    sorted.holes_diameter = permute(arrays[1]);
    sorted.holes_chimney = permute(arrays[2]);
    sorted.holes_diameter_out = permute(arrays[3]);
    sorted
}

/// Write the record's part data back as pretty-printed JSON, one file per
/// part, with hole columns ordered by position.
pub fn save_flute_dir(record: &FluteRecord, dir: &Path) -> Result<(), LoadError> {
    std::fs::create_dir_all(dir).map_err(io_error(dir))?;
    for (part, raw) in &record.raw().parts {
        let path = dir.join(part.file_name());
        let json = serde_json::to_string_pretty(&co_sort_holes(raw)).map_err(|source| {
            LoadError::Json {
                path: path.clone(),
                source,
            }
        })?;
        std::fs::write(&path, json).map_err(io_error(&path))?;
    }
    log::info!("Saved {} to {}", record.model, dir.display());
    Ok(())
}

/// Sub-directories of `data_dir` that hold all four part files, by name.
pub fn list_flutes(data_dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
    if !data_dir.is_dir() {
        return Err(LoadError::NotADirectory(data_dir.to_path_buf()));
    }
    let mut flutes: Vec<PathBuf> = WalkDir::new(data_dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .filter(|dir| PartName::ALL.iter().all(|p| dir.join(p.file_name()).is_file()))
        .collect();
    flutes.sort();
    Ok(flutes)
}

impl FluteRecord {
    /// Load a flute directory; the model name is the directory name.
    pub fn load(dir: &Path, diapason_hz: f64, temperature_c: f64) -> Result<Self, LoadError> {
        let raw = load_flute_dir(dir)?;
        let model = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| dir.display().to_string());
        let record = Self::from_raw(model, raw, diapason_hz, temperature_c);
        for issue in record.warnings() {
            log::warn!("{}: {}", record.model, issue);
        }
        for issue in record.errors() {
            log::error!("{}: {}", record.model, issue);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::fixtures;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn save_then_load_keeps_geometry() {
        let dir = TempDir::new().unwrap();
        let flute_dir = dir.path().join("quantz");
        let record = fixtures::sample_record();
        save_flute_dir(&record, &flute_dir).unwrap();

        let loaded = FluteRecord::load(&flute_dir, 415.0, 25.0).unwrap();
        assert_eq!(loaded.model, "quantz");
        assert!(loaded.is_valid());
        assert_eq!(loaded.hole_count(), record.hole_count());
        for (name, part) in record.parts() {
            let other = loaded.part(*name).unwrap();
            assert!((other.total_length - part.total_length).abs() < 1e-9);
            assert_eq!(other.measurements.len(), part.measurements.len());
        }
        assert_eq!(loaded.combined_measurements().len(), record.combined_measurements().len());

        let text = std::fs::read_to_string(flute_dir.join("left.json")).unwrap();
        assert!(text.contains("\"Total length\""));
        assert!(text.contains("\"Holes diameter_out\""));
    }

    #[test]
    fn missing_part_file_names_the_file() {
        let dir = TempDir::new().unwrap();
        save_flute_dir(&fixtures::sample_record(), dir.path()).unwrap();
        std::fs::remove_file(dir.path().join("foot.json")).unwrap();
        match load_flute_dir(dir.path()) {
            Err(LoadError::Io { path, .. }) => assert!(path.ends_with("foot.json")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_reported() {
        let dir = TempDir::new().unwrap();
        save_flute_dir(&fixtures::sample_record(), dir.path()).unwrap();
        std::fs::write(dir.path().join("right.json"), "{ \"Total length\": ").unwrap();
        let err = load_flute_dir(dir.path()).unwrap_err();
        assert!(matches!(err, LoadError::Json { .. }));
        assert!(err.to_string().contains("right.json"));
    }

    #[test]
    fn hole_columns_are_sorted_together() {
        let part = RawPart {
            holes_position: Some(json!([95.0, 60.0, 130.0])),
            holes_diameter: Some(json!([6.8, 6.5, 5.8])),
            holes_chimney: Some(json!([3.5, 3.4, 3.3])),
            holes_diameter_out: Some(json!([8.0, 7.8, 7.0])),
            ..RawPart::default()
        };
        let sorted = co_sort_holes(&part);
        assert_eq!(sorted.holes_position, Some(json!([60.0, 95.0, 130.0])));
        assert_eq!(sorted.holes_diameter, Some(json!([6.5, 6.8, 5.8])));
        assert_eq!(sorted.holes_chimney, Some(json!([3.4, 3.5, 3.3])));
        assert_eq!(sorted.holes_diameter_out, Some(json!([7.8, 8.0, 7.0])));

        let ragged = RawPart {
            holes_position: Some(json!([95.0, 60.0])),
            holes_diameter: Some(json!([6.8])),
            ..part
        };
        assert_eq!(co_sort_holes(&ragged), ragged);
    }

    #[test]
    fn lists_only_complete_flute_dirs() {
        let dir = TempDir::new().unwrap();
        let record = fixtures::sample_record();
        save_flute_dir(&record, &dir.path().join("b_flute")).unwrap();
        save_flute_dir(&record, &dir.path().join("a_flute")).unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let flutes = list_flutes(dir.path()).unwrap();
        let names: Vec<_> = flutes
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, ["a_flute", "b_flute"]);
        assert!(matches!(
            list_flutes(&dir.path().join("nope")),
            Err(LoadError::NotADirectory(_))
        ));
    }
}
