//! Vehicle trajectories as served on the `trajectory` channel.
//!
//! Wire content is a GeoJSON feature; the realtime fields live in its
//! properties:
//!
//! ```json
//! {
//!   "type": "Feature",
//!   "geometry": {"type": "LineString", "coordinates": [[x, y], ...]},
//!   "properties": {
//!     "train_id": "sbb_140494499865208",
//!     "type": "rail",
//!     "tenant": "sbb",
//!     "line": {"name": "IC 1", "color": "#eb0000", "text_color": "#ffffff"},
//!     "delay": 120000,
//!     "time_intervals": [[1700000000000, 0.0, 1.57], [1700000010000, 1.0, null]]
//!   }
//! }
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::EngineError;

/// Map coordinate in the configured projection.
pub type Coordinate = [f64; 2];

/// Geometry of a trajectory.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    /// Stationary vehicle.
    Point(Coordinate),
    /// Path the vehicle travels along.
    LineString(Vec<Coordinate>),
    /// Any other GeoJSON type. Stored but never interpolated.
    Unsupported(String),
}

#[derive(Debug, Deserialize)]
struct RawGeometry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    coordinates: Value,
}

impl<'de> Deserialize<'de> for Geometry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let raw = RawGeometry::deserialize(deserializer)?;
        match raw.kind.as_str() {
            "Point" => serde_json::from_value(raw.coordinates)
                .map(Geometry::Point)
                .map_err(D::Error::custom),
            "LineString" => serde_json::from_value(raw.coordinates)
                .map(Geometry::LineString)
                .map_err(D::Error::custom),
            other => Ok(Geometry::Unsupported(other.to_string())),
        }
    }
}

/// One sample of a vehicle's timetable along its geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeInterval {
    /// Epoch milliseconds.
    pub timestamp: f64,
    /// Fraction of the geometry length reached at `timestamp`.
    pub fraction: f64,
    /// Heading in radians, if known.
    pub rotation: Option<f64>,
}

impl<'de> Deserialize<'de> for TimeInterval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Two-element samples carry no rotation.
        let values = Vec::<Option<f64>>::deserialize(deserializer)?;
        match values.as_slice() {
            [Some(timestamp), Some(fraction), rest @ ..] => Ok(Self {
                timestamp: *timestamp,
                fraction: *fraction,
                rotation: rest.first().copied().flatten(),
            }),
            _ => Err(serde::de::Error::custom(
                "expected [timestamp, fraction, rotation?]",
            )),
        }
    }
}

/// Line a vehicle serves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Line {
    /// Public name (e.g. `S3`, `IC 1`).
    #[serde(default)]
    pub name: String,
    /// Background colour, `#rrggbb`.
    #[serde(default)]
    pub color: Option<String>,
    /// Text colour, `#rrggbb`.
    #[serde(default)]
    pub text_color: Option<String>,
}

/// Descriptive fields of a trajectory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrajectoryProperties {
    /// Mode of transport (`bus`, `tram`, `rail`, ...).
    pub mot: Option<String>,
    /// Operator tenant.
    pub tenant: Option<String>,
    /// Route identifier.
    pub route_identifier: Option<String>,
    /// Served line.
    pub line: Option<Line>,
    /// Delay in milliseconds. `None` means no realtime data.
    pub delay: Option<f64>,
    /// Journey is cancelled.
    pub cancelled: bool,
    /// Remaining properties.
    pub extra: serde_json::Map<String, Value>,
}

/// A vehicle as stored by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    /// Vehicle id (`train_id`).
    pub id: String,
    /// Geometry to move along.
    pub geometry: Geometry,
    /// Descriptive fields.
    pub properties: TrajectoryProperties,
    /// Samples, ordered by timestamp.
    pub time_intervals: Vec<TimeInterval>,
    /// Milliseconds subtracted from the render time before interpolating.
    pub time_offset: f64,
}

#[derive(Deserialize)]
struct WireFeature {
    geometry: Geometry,
    #[serde(default)]
    properties: serde_json::Map<String, Value>,
}

impl Trajectory {
    /// Parse the content of a `trajectory` message.
    pub fn from_content(content: &Value) -> Result<Self, EngineError> {
        let feature: WireFeature = serde_json::from_value(content.clone())
            .map_err(|e| EngineError::InvalidTrajectory(e.to_string()))?;
        let mut props = feature.properties;

        let id = match props.remove("train_id") {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(EngineError::InvalidTrajectory(
                    "missing train_id".to_string(),
                ))
            }
        };

        let mut time_intervals: Vec<TimeInterval> = match props.remove("time_intervals") {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| EngineError::InvalidTrajectory(format!("time_intervals: {e}")))?,
            None => Vec::new(),
        };
        time_intervals.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

        let time_offset = props
            .remove("time_offset")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);

        let properties = TrajectoryProperties {
            mot: take_string(&mut props, "type"),
            tenant: take_string(&mut props, "tenant"),
            route_identifier: take_string(&mut props, "route_identifier"),
            line: props
                .remove("line")
                .and_then(|v| serde_json::from_value(v).ok()),
            delay: props.remove("delay").and_then(|v| v.as_f64()),
            cancelled: props
                .remove("cancelled")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            extra: props,
        };

        Ok(Self {
            id,
            geometry: feature.geometry,
            properties,
            time_intervals,
            time_offset,
        })
    }

    /// Name of the served line, if any.
    #[must_use]
    pub fn line_name(&self) -> Option<&str> {
        self.properties.line.as_ref().map(|l| l.name.as_str())
    }
}

fn take_string(props: &mut serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match props.remove(key)? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Vehicle id carried by a `deleted_vehicles` message.
#[must_use]
pub fn deleted_vehicle_id(content: &Value) -> Option<String> {
    match content {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use serde_json::json;

    /// Feature moving from `from` to `to` between `start` and `end` ms.
    pub fn moving(
        id: &str,
        mot: &str,
        from: Coordinate,
        to: Coordinate,
        start: f64,
        end: f64,
    ) -> Value {
        json!({
            "type": "Feature",
            "geometry": {"type": "LineString", "coordinates": [from, to]},
            "properties": {
                "train_id": id,
                "type": mot,
                "line": {"name": format!("{mot} 1"), "color": "#3366cc"},
                "time_intervals": [[start, 0.0, 0.5], [end, 1.0, 0.5]]
            }
        })
    }

    pub fn trajectory(id: &str, mot: &str) -> Trajectory {
        Trajectory::from_content(&moving(id, mot, [0.0, 0.0], [100.0, 0.0], 1000.0, 2000.0))
            .expect("fixture parses")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_line_string_feature() {
        let content = json!({
            "type": "Feature",
            "geometry": {"type": "LineString", "coordinates": [[0.0, 0.0], [10.0, 0.0]]},
            "properties": {
                "train_id": "sbb_1",
                "type": "rail",
                "tenant": "sbb",
                "line": {"name": "IC 1", "color": "#eb0000"},
                "delay": 120000,
                "time_intervals": [[2000, 1.0, null], [1000, 0.0, 1.5]],
                "time_offset": 250,
                "state": "DRIVING"
            }
        });

        let t = Trajectory::from_content(&content).unwrap();
        assert_eq!(t.id, "sbb_1");
        assert_eq!(t.geometry, Geometry::LineString(vec![[0.0, 0.0], [10.0, 0.0]]));
        assert_eq!(t.properties.mot.as_deref(), Some("rail"));
        assert_eq!(t.line_name(), Some("IC 1"));
        assert_eq!(t.properties.delay, Some(120_000.0));
        assert_eq!(t.time_offset, 250.0);
        assert_eq!(t.time_intervals[0].timestamp, 1000.0);
        assert_eq!(t.time_intervals[0].rotation, Some(1.5));
        assert_eq!(t.time_intervals[1].rotation, None);
        assert_eq!(t.properties.extra["state"], "DRIVING");
    }

    #[test]
    fn test_parse_point_and_unsupported() {
        let point = json!({
            "geometry": {"type": "Point", "coordinates": [1.0, 2.0]},
            "properties": {"train_id": 42}
        });
        let t = Trajectory::from_content(&point).unwrap();
        assert_eq!(t.id, "42");
        assert_eq!(t.geometry, Geometry::Point([1.0, 2.0]));

        let polygon = json!({
            "geometry": {"type": "Polygon", "coordinates": [[[0.0, 0.0]]]},
            "properties": {"train_id": "x"}
        });
        let t = Trajectory::from_content(&polygon).unwrap();
        assert_eq!(t.geometry, Geometry::Unsupported("Polygon".into()));
    }

    #[test]
    fn test_missing_id_is_rejected() {
        let content = json!({
            "geometry": {"type": "Point", "coordinates": [1.0, 2.0]},
            "properties": {}
        });
        assert!(matches!(
            Trajectory::from_content(&content),
            Err(EngineError::InvalidTrajectory(_))
        ));
    }

    #[test]
    fn test_deleted_vehicle_id() {
        assert_eq!(deleted_vehicle_id(&json!("sbb_1")).as_deref(), Some("sbb_1"));
        assert_eq!(deleted_vehicle_id(&json!(7)).as_deref(), Some("7"));
        assert_eq!(deleted_vehicle_id(&json!(null)), None);
    }
}
