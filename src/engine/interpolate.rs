//! Vehicle position at a point in time.
//!
//! A trajectory's time intervals map timestamps to fractions of its line
//! length. For a render time `t` the position is found at
//! `now = t - time_offset`:
//!
//! - before the first sample: first coordinate, time fraction 0
//! - after the last sample: last coordinate, time fraction 1
//! - otherwise: inside the enclosing interval, the geometry fraction is
//!   interpolated linearly and located along the line

use super::trajectory::{Coordinate, Geometry, TimeInterval, Trajectory};
use super::EngineError;

/// Interpolated vehicle position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interpolated {
    /// Map coordinate.
    pub coordinate: Coordinate,
    /// Heading in radians.
    pub rotation: Option<f64>,
    /// Progress through the enclosing interval, `0..=1`.
    pub time_fraction: f64,
}

/// Position of `trajectory` at `render_time` (epoch ms).
pub fn interpolate(trajectory: &Trajectory, render_time: f64) -> Result<Interpolated, EngineError> {
    match &trajectory.geometry {
        Geometry::Point(coordinate) => Ok(Interpolated {
            coordinate: *coordinate,
            rotation: None,
            time_fraction: 0.0,
        }),
        Geometry::LineString(coords) => {
            if coords.is_empty() {
                return Err(EngineError::EmptyGeometry);
            }
            let now = render_time - trajectory.time_offset;
            Ok(along_line(coords, &trajectory.time_intervals, now))
        }
        Geometry::Unsupported(kind) => Err(EngineError::UnsupportedGeometry(kind.clone())),
    }
}

fn along_line(coords: &[Coordinate], intervals: &[TimeInterval], now: f64) -> Interpolated {
    let (Some(first), Some(last)) = (intervals.first(), intervals.last()) else {
        return Interpolated {
            coordinate: coords[0],
            rotation: None,
            time_fraction: 0.0,
        };
    };

    if now < first.timestamp {
        return Interpolated {
            coordinate: coords[0],
            rotation: first.rotation,
            time_fraction: 0.0,
        };
    }
    if now > last.timestamp {
        return Interpolated {
            coordinate: coords[coords.len() - 1],
            rotation: last.rotation,
            time_fraction: 1.0,
        };
    }

    let Some(pair) = intervals
        .windows(2)
        .find(|w| w[0].timestamp <= now && now <= w[1].timestamp)
    else {
        // A single sample with now == its timestamp.
        return Interpolated {
            coordinate: point_at_fraction(coords, first.fraction),
            rotation: first.rotation,
            time_fraction: 0.0,
        };
    };
    let (start, end) = (pair[0], pair[1]);

    let span = end.timestamp - start.timestamp;
    let time_fraction = if span > 0.0 {
        ((now - start.timestamp) / span).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let geom_fraction = start.fraction + time_fraction * (end.fraction - start.fraction);

    Interpolated {
        coordinate: point_at_fraction(coords, geom_fraction),
        rotation: start.rotation,
        time_fraction,
    }
}

/// Point at `fraction` of the total length of `coords`.
#[must_use]
pub fn point_at_fraction(coords: &[Coordinate], fraction: f64) -> Coordinate {
    let (Some(&first), Some(&last)) = (coords.first(), coords.last()) else {
        return [0.0, 0.0];
    };
    let fraction = fraction.clamp(0.0, 1.0);

    let total: f64 = coords.windows(2).map(|w| distance(w[0], w[1])).sum();
    if total <= 0.0 {
        return first;
    }

    let mut remaining = fraction * total;
    for w in coords.windows(2) {
        let length = distance(w[0], w[1]);
        if remaining <= length {
            if length <= 0.0 {
                return w[0];
            }
            let t = remaining / length;
            return [
                w[0][0] + (w[1][0] - w[0][0]) * t,
                w[0][1] + (w[1][1] - w[0][1]) * t,
            ];
        }
        remaining -= length;
    }
    last
}

fn distance(a: Coordinate, b: Coordinate) -> f64 {
    (b[0] - a[0]).hypot(b[1] - a[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::trajectory::TrajectoryProperties;

    fn line(intervals: &[(f64, f64)]) -> Trajectory {
        Trajectory {
            id: "t".into(),
            geometry: Geometry::LineString(vec![[0.0, 0.0], [100.0, 0.0]]),
            properties: TrajectoryProperties::default(),
            time_intervals: intervals
                .iter()
                .map(|&(timestamp, fraction)| TimeInterval {
                    timestamp,
                    fraction,
                    rotation: Some(0.25),
                })
                .collect(),
            time_offset: 0.0,
        }
    }

    #[test]
    fn test_interval_boundaries() {
        let t = line(&[(1000.0, 0.0), (2000.0, 1.0)]);

        let at = |time| interpolate(&t, time).unwrap();
        assert_eq!(at(1000.0).time_fraction, 0.0);
        assert_eq!(at(1000.0).coordinate, [0.0, 0.0]);
        assert_eq!(at(1500.0).time_fraction, 0.5);
        assert_eq!(at(1500.0).coordinate, [50.0, 0.0]);
        assert_eq!(at(500.0).time_fraction, 0.0);
        assert_eq!(at(500.0).coordinate, [0.0, 0.0]);
        assert_eq!(at(2500.0).time_fraction, 1.0);
        assert_eq!(at(2500.0).coordinate, [100.0, 0.0]);
        assert_eq!(at(1500.0).rotation, Some(0.25));
    }

    #[test]
    fn test_time_offset_shifts_render_time() {
        let mut t = line(&[(1000.0, 0.0), (2000.0, 1.0)]);
        t.time_offset = 500.0;
        let p = interpolate(&t, 2000.0).unwrap();
        assert_eq!(p.time_fraction, 0.5);
    }

    #[test]
    fn test_partial_fractions() {
        let t = line(&[(0.0, 0.2), (1000.0, 0.6)]);
        let p = interpolate(&t, 500.0).unwrap();
        assert!((p.coordinate[0] - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_point_geometry() {
        let mut t = line(&[]);
        t.geometry = Geometry::Point([3.0, 4.0]);
        let p = interpolate(&t, 0.0).unwrap();
        assert_eq!(p.coordinate, [3.0, 4.0]);
        assert_eq!(p.rotation, None);
    }

    #[test]
    fn test_unsupported_and_empty_geometry() {
        let mut t = line(&[]);
        t.geometry = Geometry::Unsupported("Polygon".into());
        assert_eq!(
            interpolate(&t, 0.0),
            Err(EngineError::UnsupportedGeometry("Polygon".into()))
        );
        t.geometry = Geometry::LineString(Vec::new());
        assert_eq!(interpolate(&t, 0.0), Err(EngineError::EmptyGeometry));
    }

    #[test]
    fn test_point_at_fraction_multi_segment() {
        let coords = [[0.0, 0.0], [10.0, 0.0], [10.0, 10.0]];
        assert_eq!(point_at_fraction(&coords, 0.0), [0.0, 0.0]);
        assert_eq!(point_at_fraction(&coords, 0.75), [10.0, 5.0]);
        assert_eq!(point_at_fraction(&coords, 1.0), [10.0, 10.0]);
        assert_eq!(point_at_fraction(&[[1.0, 1.0], [1.0, 1.0]], 0.5), [1.0, 1.0]);
    }
}
