//! Untyped per-part JSON as it is stored on disk.
//!
//! Fields stay as `serde_json::Value` so the validator can report on
//! malformed data and normalize it in place instead of failing to parse.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{Hole, Measurement, PartGeometry, PartName};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPart {
    #[serde(rename = "Total length", default, skip_serializing_if = "Option::is_none")]
    pub total_length: Option<Value>,
    #[serde(rename = "Mortise length", default, skip_serializing_if = "Option::is_none")]
    pub mortise_length: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurements: Option<Value>,
    #[serde(rename = "Holes position", default, skip_serializing_if = "Option::is_none")]
    pub holes_position: Option<Value>,
    #[serde(rename = "Holes diameter", default, skip_serializing_if = "Option::is_none")]
    pub holes_diameter: Option<Value>,
    #[serde(rename = "Holes chimney", default, skip_serializing_if = "Option::is_none")]
    pub holes_chimney: Option<Value>,
    #[serde(rename = "Holes diameter_out", default, skip_serializing_if = "Option::is_none")]
    pub holes_diameter_out: Option<Value>,
    /// Keys we do not interpret are kept so saving does not lose them.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Raw data for a whole flute, keyed by part.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFlute {
    pub parts: BTreeMap<PartName, RawPart>,
}

impl RawPart {
    pub fn from_geometry(geom: &PartGeometry) -> Self {
        let measurements: Vec<Value> = geom
            .measurements
            .iter()
            .map(|m| json!({ "position": m.position, "diameter": m.diameter }))
            .collect();
        let column = |f: fn(&Hole) -> f64| -> Option<Value> {
            if geom.holes.is_empty() {
                None
            } else {
                Some(Value::Array(geom.holes.iter().map(|h| json!(f(h))).collect()))
            }
        };
        Self {
            total_length: Some(json!(geom.total_length)),
            mortise_length: Some(json!(geom.mortise_length)),
            measurements: Some(Value::Array(measurements)),
            holes_position: column(|h| h.position),
            holes_diameter: column(|h| h.diameter),
            holes_chimney: column(|h| h.chimney),
            holes_diameter_out: column(|h| h.diameter_out),
            extra: Map::new(),
        }
    }

    /// Typed view of the part. Returns `None` if any field has an unexpected
    /// shape; after a clean validation pass that cannot happen.
    pub fn to_geometry(&self) -> Option<PartGeometry> {
        let total_length = self.total_length.as_ref()?.as_f64()?;
        let mortise_length = self.mortise_length.as_ref()?.as_f64()?;

        let mut measurements = Vec::new();
        for item in self.measurements.as_ref()?.as_array()? {
            measurements.push(Measurement {
                position: item.get("position")?.as_f64()?,
                diameter: item.get("diameter")?.as_f64()?,
            });
        }

        let positions = number_list(self.holes_position.as_ref())?;
        let diameters = number_list(self.holes_diameter.as_ref())?;
        let chimneys = number_list(self.holes_chimney.as_ref())?;
        let diameters_out = number_list(self.holes_diameter_out.as_ref())?;
        let n = positions.len();
        if diameters.len() != n || chimneys.len() != n || diameters_out.len() != n {
            return None;
        }
        let holes = (0..n)
            .map(|i| Hole {
                position: positions[i],
                diameter: diameters[i],
                chimney: chimneys[i],
                diameter_out: diameters_out[i],
            })
            .collect();

        Some(PartGeometry {
            total_length,
            mortise_length,
            measurements,
            holes,
        })
    }
}

/// Absent column reads as empty; any non-numeric entry fails.
fn number_list(value: Option<&Value>) -> Option<Vec<f64>> {
    match value {
        None => Some(Vec::new()),
        Some(v) => v.as_array()?.iter().map(Value::as_f64).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_on_disk_keys_and_keeps_unknown_ones() {
        let text = r#"{
            "Total length": 200,
            "Mortise length": 20.5,
            "measurements": [{"position": 0, "diameter": 19.5}],
            "Holes position": [20],
            "Holes diameter": [[9.5, 8.5]],
            "maker": "anonymous"
        }"#;
        let part: RawPart = serde_json::from_str(text).unwrap();
        assert_eq!(part.total_length, Some(json!(200)));
        assert_eq!(part.mortise_length.as_ref().and_then(Value::as_f64), Some(20.5));
        assert!(part.holes_chimney.is_none());
        assert_eq!(part.extra.get("maker"), Some(&json!("anonymous")));

        let back = serde_json::to_value(&part).unwrap();
        assert_eq!(back["maker"], json!("anonymous"));
        assert!(back.get("Holes chimney").is_none());
    }

    #[test]
    fn geometry_conversion_preserves_values() {
        let geom = PartGeometry {
            total_length: 120.0,
            mortise_length: 15.0,
            measurements: vec![Measurement { position: 16.0, diameter: 13.4 }],
            holes: vec![Hole {
                position: 40.0,
                diameter: 5.0,
                chimney: 3.0,
                diameter_out: 6.0,
            }],
        };
        let raw = RawPart::from_geometry(&geom);
        assert_eq!(raw.to_geometry(), Some(geom));
    }

    #[test]
    fn unreadable_hole_column_yields_none() {
        let mut raw = RawPart::from_geometry(&PartGeometry {
            total_length: 100.0,
            mortise_length: 0.0,
            measurements: vec![],
            holes: vec![],
        });
        raw.holes_position = Some(json!([10.0]));
        raw.holes_diameter = Some(json!([[4.0, 5.0]]));
        assert!(raw.to_geometry().is_none());
    }
}
