//! Zero-level contours of each component of a planar vector field.

use crate::error::{PlaneError, Result};
use crate::system::{AxisRange, SystemModel};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const MAX_RESOLUTION: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NullclineSettings {
    /// Grid samples per axis.
    pub resolution: usize,
    /// Time at which a non-autonomous field is frozen.
    pub time: f64,
}

impl Default for NullclineSettings {
    fn default() -> Self {
        Self {
            resolution: 200,
            time: 0.0,
        }
    }
}

pub type Point = [f64; 2];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nullcline {
    /// The state variable whose derivative vanishes along this curve.
    pub variable: String,
    pub segments: Vec<[Point; 2]>,
    pub polylines: Vec<Vec<Point>>,
}

impl Nullcline {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Computes one nullcline per state variable of a 2D system over `axes`.
pub fn compute_nullclines(
    model: &SystemModel,
    axes: &[AxisRange],
    settings: &NullclineSettings,
) -> Result<BTreeMap<String, Nullcline>> {
    let dim = model.dimension();
    if dim != 2 {
        return Err(PlaneError::UnsupportedDimension(dim));
    }
    if axes.len() != 2 {
        return Err(PlaneError::DimensionMismatch {
            expected: 2,
            found: axes.len(),
        });
    }
    for range in axes {
        range.validate()?;
    }
    if !settings.time.is_finite() {
        return Err(PlaneError::InvalidSettings(
            "nullcline time must be finite".to_string(),
        ));
    }
    let resolution = settings.resolution.clamp(2, MAX_RESOLUTION);
    if resolution != settings.resolution {
        warn!(
            "nullcline resolution {} out of range, using {}",
            settings.resolution, resolution
        );
    }

    let grid = Grid::new(axes[0], axes[1], resolution);
    let states = grid.states();
    let mut nullclines = BTreeMap::new();
    for (index, variable) in model.state_vars().iter().enumerate() {
        let values: Vec<f64> = model
            .evaluate_component_batch(index, settings.time, &states)?
            .into_iter()
            .map(|value| value.unwrap_or(f64::NAN))
            .collect();
        let segments = grid.contour(&values);
        let polylines = chain_segments(&segments);
        debug!(
            "nullcline d{}/dt = 0: {} segments, {} polylines",
            variable,
            segments.len(),
            polylines.len()
        );
        nullclines.insert(
            variable.clone(),
            Nullcline {
                variable: variable.clone(),
                segments: segments.iter().map(|s| [s.points[0], s.points[1]]).collect(),
                polylines,
            },
        );
    }
    Ok(nullclines)
}

/// A grid edge, named by its lower-left vertex: `H` runs along x, `V` along y.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum EdgeKey {
    H(usize, usize),
    V(usize, usize),
}

struct Segment {
    keys: [EdgeKey; 2],
    points: [Point; 2],
}

struct Grid {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl Grid {
    fn new(x_range: AxisRange, y_range: AxisRange, resolution: usize) -> Self {
        Self {
            x: x_range.linspace(resolution),
            y: y_range.linspace(resolution),
        }
    }

    fn index(&self, ix: usize, iy: usize) -> usize {
        ix + iy * self.x.len()
    }

    /// Flattened `(x, y)` states, x varying fastest.
    fn states(&self) -> Vec<f64> {
        let mut states = Vec::with_capacity(2 * self.x.len() * self.y.len());
        for &y in &self.y {
            for &x in &self.x {
                states.push(x);
                states.push(y);
            }
        }
        states
    }

    /// Marching squares on the zero level of `values`.
    fn contour(&self, values: &[f64]) -> Vec<Segment> {
        let nx = self.x.len();
        let ny = self.y.len();
        let mut crossings: HashMap<EdgeKey, Point> = HashMap::new();
        let mut segments = Vec::new();

        for iy in 0..ny.saturating_sub(1) {
            for ix in 0..nx.saturating_sub(1) {
                let corners = [
                    values[self.index(ix, iy)],
                    values[self.index(ix + 1, iy)],
                    values[self.index(ix + 1, iy + 1)],
                    values[self.index(ix, iy + 1)],
                ];
                if corners.iter().any(|v| !v.is_finite()) {
                    continue;
                }

                let case_index = corners
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| **v >= 0.0)
                    .fold(0u8, |case, (bit, _)| case | (1 << bit));

                for &(edge_a, edge_b) in marching_squares_edge_pairs(case_index) {
                    let keys = [
                        cell_edge_key(ix, iy, edge_a),
                        cell_edge_key(ix, iy, edge_b),
                    ];
                    let points = [
                        *crossings
                            .entry(keys[0])
                            .or_insert_with(|| self.crossing(keys[0], values)),
                        *crossings
                            .entry(keys[1])
                            .or_insert_with(|| self.crossing(keys[1], values)),
                    ];
                    segments.push(Segment { keys, points });
                }
            }
        }
        segments
    }

    /// Where the zero level crosses an edge, interpolated linearly from its end values.
    fn crossing(&self, key: EdgeKey, values: &[f64]) -> Point {
        match key {
            EdgeKey::H(ix, iy) => {
                let t = interpolate_factor(values[self.index(ix, iy)], values[self.index(ix + 1, iy)]);
                [self.x[ix] + (self.x[ix + 1] - self.x[ix]) * t, self.y[iy]]
            }
            EdgeKey::V(ix, iy) => {
                let t = interpolate_factor(values[self.index(ix, iy)], values[self.index(ix, iy + 1)]);
                [self.x[ix], self.y[iy] + (self.y[iy + 1] - self.y[iy]) * t]
            }
        }
    }
}

/// Edges of cell `(ix, iy)`: 0 bottom, 1 right, 2 top, 3 left.
fn cell_edge_key(ix: usize, iy: usize, edge: u8) -> EdgeKey {
    match edge {
        0 => EdgeKey::H(ix, iy),
        1 => EdgeKey::V(ix + 1, iy),
        2 => EdgeKey::H(ix, iy + 1),
        _ => EdgeKey::V(ix, iy),
    }
}

fn marching_squares_edge_pairs(case_index: u8) -> &'static [(u8, u8)] {
    match case_index {
        0 | 15 => &[],
        1 => &[(3, 0)],
        2 => &[(0, 1)],
        3 => &[(3, 1)],
        4 => &[(1, 2)],
        5 => &[(3, 2), (0, 1)],
        6 => &[(0, 2)],
        7 => &[(3, 2)],
        8 => &[(2, 3)],
        9 => &[(0, 2)],
        10 => &[(0, 3), (1, 2)],
        11 => &[(1, 2)],
        12 => &[(1, 3)],
        13 => &[(0, 1)],
        14 => &[(3, 0)],
        _ => &[],
    }
}

fn interpolate_factor(v0: f64, v1: f64) -> f64 {
    let denominator = v0 - v1;
    if denominator.abs() <= 1e-12 {
        0.5
    } else {
        (v0 / denominator).clamp(0.0, 1.0)
    }
}

/// Joins segments sharing an edge crossing into polylines. Open curves are
/// walked from one end; closed loops repeat their first point at the end.
fn chain_segments(segments: &[Segment]) -> Vec<Vec<Point>> {
    let mut incident: BTreeMap<EdgeKey, Vec<usize>> = BTreeMap::new();
    for (index, segment) in segments.iter().enumerate() {
        for key in segment.keys {
            incident.entry(key).or_default().push(index);
        }
    }

    let mut used = vec![false; segments.len()];
    let mut polylines = Vec::new();

    let ends: Vec<EdgeKey> = incident
        .iter()
        .filter(|(_, touching)| touching.len() == 1)
        .map(|(key, _)| *key)
        .collect();
    let starts = ends.into_iter().chain(
        segments
            .iter()
            .map(|segment| segment.keys[0])
            .collect::<Vec<_>>(),
    );

    for start in starts {
        let Some(first) = incident[&start].iter().copied().find(|&i| !used[i]) else {
            continue;
        };
        let mut key = start;
        let mut next = Some(first);
        let mut line = vec![point_at(&segments[first], start)];
        while let Some(index) = next {
            used[index] = true;
            let segment = &segments[index];
            key = if segment.keys[0] == key {
                segment.keys[1]
            } else {
                segment.keys[0]
            };
            line.push(point_at(segment, key));
            next = incident[&key].iter().copied().find(|&i| !used[i]);
        }
        polylines.push(line);
    }
    polylines
}

fn point_at(segment: &Segment, key: EdgeKey) -> Point {
    if segment.keys[0] == key {
        segment.points[0]
    } else {
        segment.points[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{ParameterSet, SystemSpec};

    fn model(expressions: &[&str]) -> SystemModel {
        let spec = SystemSpec::new(
            2,
            expressions.iter().map(|e| e.to_string()).collect(),
            ParameterSet::new(),
        )
        .expect("2D is supported");
        SystemModel::new(spec).expect("system should compile")
    }

    fn square() -> Vec<AxisRange> {
        vec![AxisRange::new(-2.0, 2.0); 2]
    }

    #[test]
    fn straight_nullclines_follow_the_zero_level() {
        let model = model(&["y - x", "x + 0.33"]);
        let settings = NullclineSettings {
            resolution: 41,
            ..NullclineSettings::default()
        };
        let nullclines = compute_nullclines(&model, &square(), &settings).expect("2D system");

        let diagonal = &nullclines["x"];
        assert!(!diagonal.is_empty());
        for [a, b] in &diagonal.segments {
            assert!((a[0] - a[1]).abs() < 1e-9);
            assert!((b[0] - b[1]).abs() < 1e-9);
        }
        assert_eq!(diagonal.polylines.len(), 1);

        let vertical = &nullclines["y"];
        assert_eq!(vertical.polylines.len(), 1);
        assert!(vertical.polylines[0]
            .iter()
            .all(|p| (p[0] + 0.33).abs() < 1e-9));
        // One crossing per grid row.
        assert_eq!(vertical.polylines[0].len(), 41);
    }

    #[test]
    fn circle_is_a_single_closed_polyline() {
        let model = model(&["x^2 + y^2 - 1", "1"]);
        let nullclines =
            compute_nullclines(&model, &square(), &NullclineSettings::default()).expect("2D system");
        let circle = &nullclines["x"];
        assert_eq!(circle.polylines.len(), 1);
        let line = &circle.polylines[0];
        assert_eq!(line.first(), line.last());
        for p in line {
            let radius = (p[0] * p[0] + p[1] * p[1]).sqrt();
            assert!((radius - 1.0).abs() < 1e-3, "radius {radius}");
        }
        assert!(nullclines["y"].is_empty());
    }

    #[test]
    fn cells_touching_poles_are_skipped() {
        let model = model(&["1/x - 1", "y"]);
        let settings = NullclineSettings {
            resolution: 5,
            ..NullclineSettings::default()
        };
        let nullclines = compute_nullclines(&model, &square(), &settings).expect("2D system");
        for [a, b] in &nullclines["x"].segments {
            assert!(a[0].is_finite() && b[0].is_finite());
            assert!(a[0] > 0.0 && b[0] > 0.0);
        }
    }

    #[test]
    fn partial_settings_fill_in_defaults() {
        let settings: NullclineSettings =
            serde_json::from_str(r#"{"resolution": 50}"#).expect("partial settings");
        assert_eq!(settings.resolution, 50);
        assert_eq!(settings.time, 0.0);
    }

    #[test]
    fn one_dimensional_systems_are_rejected() {
        let spec = SystemSpec::new(1, vec!["x".to_string()], ParameterSet::new())
            .expect("1D is supported");
        let model = SystemModel::new(spec).expect("should compile");
        assert_eq!(
            compute_nullclines(&model, &square(), &NullclineSettings::default()),
            Err(PlaneError::UnsupportedDimension(1))
        );
    }
}
