//! Direction field samples for drawing arrows behind the phase portrait.

use crate::error::{PlaneError, Result};
use crate::system::{AxisRange, SystemModel};
use log::warn;
use serde::{Deserialize, Serialize};

pub const MAX_POINTS_PER_AXIS: usize = 500;

/// Grid points and the field vector at each of them.
///
/// In 2D a point is `(x, y)` and its vector `(dx/dt, dy/dt)`. In 1D the plot
/// is the `(t, x)` plane and the vector is `(1, dx/dt)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSample {
    pub points: Vec<[f64; 2]>,
    /// `None` where the field could not be evaluated.
    pub vectors: Vec<Option<[f64; 2]>>,
}

impl FieldSample {
    /// The same sample with every vector scaled to unit length.
    pub fn normalized(&self) -> Self {
        let vectors = self
            .vectors
            .iter()
            .map(|vector| {
                vector.map(|[u, v]| {
                    let norm = u.hypot(v);
                    if norm > 0.0 {
                        [u / norm, v / norm]
                    } else {
                        [0.0, 0.0]
                    }
                })
            })
            .collect();
        Self {
            points: self.points.clone(),
            vectors,
        }
    }
}

/// Samples the field on a `points_per_axis` square grid spanning `axes`,
/// widened by `|max - min| * expansion_factor / 2` on each side.
///
/// For 1D systems `axes` is `[t_range, x_range]`.
pub fn sample_field(
    model: &SystemModel,
    axes: &[AxisRange],
    points_per_axis: usize,
    expansion_factor: f64,
) -> Result<FieldSample> {
    if axes.len() != 2 {
        return Err(PlaneError::DimensionMismatch {
            expected: 2,
            found: axes.len(),
        });
    }
    for range in axes {
        range.validate()?;
    }
    if !(expansion_factor >= 0.0 && expansion_factor.is_finite()) {
        return Err(PlaneError::InvalidSettings(
            "expansion_factor must be non-negative".to_string(),
        ));
    }
    let n = points_per_axis.clamp(1, MAX_POINTS_PER_AXIS);
    if n != points_per_axis {
        warn!("points_per_axis {points_per_axis} out of range, using {n}");
    }

    let horizontal = axes[0].expand(expansion_factor).linspace(n);
    let vertical = axes[1].expand(expansion_factor).linspace(n);
    let mut points = Vec::with_capacity(n * n);
    for &b in &vertical {
        for &a in &horizontal {
            points.push([a, b]);
        }
    }

    let vectors = match model.dimension() {
        1 => {
            let states: Vec<f64> = points.iter().map(|p| p[1]).collect();
            let times: Vec<f64> = points.iter().map(|p| p[0]).collect();
            let component = model
                .component(0)
                .ok_or(PlaneError::UnsupportedDimension(0))?;
            component
                .evaluate_batch_at(&times, &states, model.parameter_values())
                .into_iter()
                .map(|value| value.ok().map(|dx| [1.0, dx]))
                .collect()
        }
        2 => {
            let states: Vec<f64> = points.iter().flat_map(|p| *p).collect();
            let dx = model.evaluate_component_batch(0, 0.0, &states)?;
            let dy = model.evaluate_component_batch(1, 0.0, &states)?;
            dx.into_iter()
                .zip(dy)
                .map(|(u, v)| Some([u.ok()?, v.ok()?]))
                .collect()
        }
        other => return Err(PlaneError::UnsupportedDimension(other)),
    };

    Ok(FieldSample { points, vectors })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{ParameterSet, SystemSpec};

    fn model(dimension: usize, expressions: &[&str]) -> SystemModel {
        let spec = SystemSpec::new(
            dimension,
            expressions.iter().map(|e| e.to_string()).collect(),
            ParameterSet::new(),
        )
        .expect("supported dimension");
        SystemModel::new(spec).expect("system should compile")
    }

    #[test]
    fn samples_planar_field_on_expanded_grid() {
        let model = model(2, &["y", "-x"]);
        let axes = [AxisRange::new(-1.0, 1.0), AxisRange::new(-1.0, 1.0)];
        let sample = sample_field(&model, &axes, 3, 1.0).expect("valid input");
        assert_eq!(sample.points.len(), 9);
        assert_eq!(sample.points[0], [-2.0, -2.0]);
        assert_eq!(sample.points[8], [2.0, 2.0]);
        assert_eq!(sample.vectors[0], Some([-2.0, 2.0]));
        assert_eq!(sample.vectors[4], Some([0.0, 0.0]));
    }

    #[test]
    fn one_dimensional_field_uses_time_axis() {
        let model = model(1, &["t - x"]);
        let axes = [AxisRange::new(0.0, 2.0), AxisRange::new(-1.0, 1.0)];
        let sample = sample_field(&model, &axes, 3, 0.0).expect("valid input");
        // point (t = 2, x = -1)
        assert_eq!(sample.points[2], [2.0, -1.0]);
        assert_eq!(sample.vectors[2], Some([1.0, 3.0]));
        let unit = sample.normalized();
        let [u, v] = unit.vectors[2].expect("evaluated");
        assert!((u.hypot(v) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn failed_points_are_none() {
        let model = model(2, &["1/x", "y"]);
        let axes = [AxisRange::new(-1.0, 1.0), AxisRange::new(-1.0, 1.0)];
        let sample = sample_field(&model, &axes, 3, 0.0).expect("valid input");
        let missing = sample.vectors.iter().filter(|v| v.is_none()).count();
        assert_eq!(missing, 3);
    }
}
