use crate::autodiff::{self, Dual};
use crate::error::{EvaluationError, PlaneError, Result};
use crate::system::{AxisRange, SystemModel};
use crate::traits::DynamicalSystem;
use log::{trace, warn};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on seeds per axis; a 2D search evaluates at most this squared.
pub const MAX_SEEDS_PER_AXIS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonSettings {
    pub max_steps: usize,
    pub damping: f64,
    /// Residual norm below which an iterate counts as a zero.
    pub tolerance: f64,
    /// Once the residual passes, iteration continues until the step is
    /// below `step_tolerance * (1 + |x|)`, the residual stops shrinking or
    /// `max_steps` runs out. Double roots converge only linearly and need this.
    pub step_tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 50,
            damping: 1.0,
            tolerance: 1e-10,
            step_tolerance: 1e-12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedPointSettings {
    pub newton: NewtonSettings,
    pub seeds_per_axis: usize,
    /// Distance below which two solutions count as the same point.
    /// `None` uses `1e-6 + 1e-6 * diagonal` of the search bounds, but never
    /// less than `sqrt(newton.tolerance)`, the accuracy reachable at a double root.
    pub merge_tolerance: Option<f64>,
    /// Converged points may lie this fraction of the axis width outside the bounds.
    pub bounds_slack: f64,
}

impl Default for FixedPointSettings {
    fn default() -> Self {
        Self {
            newton: NewtonSettings::default(),
            seeds_per_axis: 10,
            merge_tolerance: None,
            bounds_slack: 1e-6,
        }
    }
}

/// Linear stability of a fixed point, read off the Jacobian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stability {
    Saddle,
    StableNode,
    UnstableNode,
    StableFocus,
    UnstableFocus,
    Center,
    /// A zero eigenvalue; linearization does not decide stability.
    Degenerate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedPoint {
    pub state: Vec<f64>,
    pub residual_norm: f64,
    pub iterations: usize,
    /// Row-major.
    pub jacobian: Vec<f64>,
    pub eigenvalues: Vec<Complex64>,
    pub stability: Stability,
}

/// Why Newton's method gave up on a seed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConvergenceFailure {
    #[error("Jacobian is singular")]
    Singular,
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    #[error("no convergence in {steps} steps (residual {residual})")]
    NotConverged { steps: usize, residual: f64 },
    #[error("iterate became non-finite")]
    Diverged,
}

/// Finds the zeros of the vector field inside `bounds` by running Newton's
/// method from a grid of seeds and merging the results.
///
/// Seeds that fail to converge are dropped silently. The output is sorted
/// lexicographically, so the same model and settings always give the same list.
pub fn find_fixed_points(
    model: &SystemModel,
    bounds: &[AxisRange],
    settings: &FixedPointSettings,
) -> Result<Vec<FixedPoint>> {
    let dim = model.dimension();
    if bounds.len() != dim {
        return Err(PlaneError::DimensionMismatch {
            expected: dim,
            found: bounds.len(),
        });
    }
    for range in bounds {
        range.validate()?;
    }
    validate_newton(&settings.newton)?;

    let seeds_per_axis = settings.seeds_per_axis.clamp(1, MAX_SEEDS_PER_AXIS);
    if seeds_per_axis != settings.seeds_per_axis {
        warn!(
            "seeds_per_axis {} out of range, using {}",
            settings.seeds_per_axis, seeds_per_axis
        );
    }
    let diagonal = bounds.iter().map(|r| r.width().powi(2)).sum::<f64>().sqrt();
    let merge_tolerance = settings
        .merge_tolerance
        .unwrap_or_else(|| (1e-6 + 1e-6 * diagonal).max(settings.newton.tolerance.sqrt()));

    let mut accepted: Vec<FixedPoint> = Vec::new();
    for seed in seed_grid(bounds, seeds_per_axis) {
        let point = match solve_from_seed(model, &seed, &settings.newton) {
            Ok(point) => point,
            Err(failure) => {
                trace!("discarding seed {:?}: {}", seed, failure);
                continue;
            }
        };
        let inside = point.state.iter().zip(bounds).all(|(&value, range)| {
            let slack = settings.bounds_slack * range.width();
            value >= range.min - slack && value <= range.max + slack
        });
        if !inside {
            trace!("discarding {:?}: outside search bounds", point.state);
            continue;
        }

        match accepted
            .iter_mut()
            .find(|other| distance(&other.state, &point.state) <= merge_tolerance)
        {
            Some(other) if point.residual_norm < other.residual_norm => *other = point,
            Some(_) => {}
            None => accepted.push(point),
        }
    }

    accepted.sort_by(|a, b| {
        a.state
            .iter()
            .zip(&b.state)
            .map(|(x, y)| x.total_cmp(y))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(accepted)
}

/// Runs Newton's method on `f(x) = 0` from `seed`, with `t = 0`.
pub fn solve_from_seed(
    model: &SystemModel,
    seed: &[f64],
    settings: &NewtonSettings,
) -> std::result::Result<FixedPoint, ConvergenceFailure> {
    let dim = model.dimension();
    let mut state = seed.to_vec();
    let mut residual = vec![0.0; dim];
    DynamicalSystem::<f64>::apply(model, 0.0, &state, &mut residual)?;
    let mut residual_norm = l2_norm(&residual);
    let mut iterations = 0usize;

    while residual_norm > settings.tolerance {
        if iterations >= settings.max_steps {
            return Err(ConvergenceFailure::NotConverged {
                steps: iterations,
                residual: residual_norm,
            });
        }

        let delta = newton_step(model, &state, &residual)?;
        for (x, dx) in state.iter_mut().zip(&delta) {
            *x -= settings.damping * dx;
        }
        if state.iter().any(|x| !x.is_finite()) {
            return Err(ConvergenceFailure::Diverged);
        }

        iterations += 1;
        DynamicalSystem::<f64>::apply(model, 0.0, &state, &mut residual)?;
        residual_norm = l2_norm(&residual);
    }

    // Polishing: steps are only kept while they lower the residual.
    while residual_norm > 0.0 && iterations < settings.max_steps {
        let Ok(delta) = newton_step(model, &state, &residual) else {
            break;
        };
        let step_norm = settings.damping * l2_norm(&delta);
        let candidate: Vec<f64> = state
            .iter()
            .zip(&delta)
            .map(|(x, dx)| x - settings.damping * dx)
            .collect();
        let mut candidate_residual = vec![0.0; dim];
        let accepted = candidate.iter().all(|x| x.is_finite())
            && DynamicalSystem::<f64>::apply(model, 0.0, &candidate, &mut candidate_residual)
                .is_ok()
            && l2_norm(&candidate_residual) <= residual_norm;
        if !accepted {
            break;
        }
        state = candidate;
        residual = candidate_residual;
        residual_norm = l2_norm(&residual);
        iterations += 1;
        if step_norm <= settings.step_tolerance * (1.0 + l2_norm(&state)) {
            break;
        }
    }

    let jacobian = field_jacobian(model, &state)?;
    let eigenvalues = compute_eigenvalues(dim, &jacobian);
    let stability = classify(dim, &jacobian);

    Ok(FixedPoint {
        state,
        residual_norm,
        iterations,
        jacobian,
        eigenvalues,
        stability,
    })
}

/// The Newton correction `J^-1 f` at `state`.
fn newton_step(
    model: &SystemModel,
    state: &[f64],
    residual: &[f64],
) -> std::result::Result<Vec<f64>, ConvergenceFailure> {
    let jacobian = field_jacobian(model, state)?;
    solve_linear_system(state.len(), &jacobian, residual)
}

fn validate_newton(settings: &NewtonSettings) -> Result<()> {
    if settings.max_steps == 0 {
        return Err(PlaneError::InvalidSettings(
            "max_steps must be greater than zero".to_string(),
        ));
    }
    if !(settings.damping > 0.0 && settings.damping <= 1.0) {
        return Err(PlaneError::InvalidSettings(
            "damping must be in (0, 1]".to_string(),
        ));
    }
    if !(settings.tolerance > 0.0) {
        return Err(PlaneError::InvalidSettings(
            "tolerance must be positive".to_string(),
        ));
    }
    if !(settings.step_tolerance >= 0.0) {
        return Err(PlaneError::InvalidSettings(
            "step_tolerance must be non-negative".to_string(),
        ));
    }
    Ok(())
}

/// Cell centres of a uniform grid, first axis outermost.
fn seed_grid(bounds: &[AxisRange], per_axis: usize) -> Vec<Vec<f64>> {
    let axes: Vec<Vec<f64>> = bounds
        .iter()
        .map(|range| {
            let cell = range.width() / per_axis as f64;
            (0..per_axis)
                .map(|i| range.min + cell * (i as f64 + 0.5))
                .collect()
        })
        .collect();

    axes.iter().fold(vec![Vec::new()], |seeds, axis| {
        seeds
            .iter()
            .flat_map(|prefix| {
                axis.iter().map(move |&value| {
                    let mut seed = prefix.clone();
                    seed.push(value);
                    seed
                })
            })
            .collect()
    })
}

fn field_jacobian(
    model: &SystemModel,
    state: &[f64],
) -> std::result::Result<Vec<f64>, EvaluationError> {
    autodiff::jacobian(0.0, state, |t: Dual, x: &[Dual], out: &mut [Dual]| {
        DynamicalSystem::<Dual>::apply(model, t, x, out)
    })
}

fn solve_linear_system(
    dim: usize,
    jacobian: &[f64],
    residual: &[f64],
) -> std::result::Result<Vec<f64>, ConvergenceFailure> {
    let j_matrix = DMatrix::from_row_slice(dim, dim, jacobian);
    let rhs = DVector::from_column_slice(residual);
    j_matrix
        .lu()
        .solve(&rhs)
        .map(|v| v.iter().copied().collect())
        .ok_or(ConvergenceFailure::Singular)
}

/// Eigenvalues of the Jacobian, sorted by real then imaginary part.
fn compute_eigenvalues(dim: usize, jacobian: &[f64]) -> Vec<Complex64> {
    let matrix = DMatrix::from_row_slice(dim, dim, jacobian);
    let mut eigenvalues: Vec<Complex64> = matrix.complex_eigenvalues().iter().copied().collect();
    eigenvalues.sort_by(|a, b| a.re.total_cmp(&b.re).then(a.im.total_cmp(&b.im)));
    eigenvalues
}

/// Classifies by trace and determinant (2D) or the sign of `f'(x)` (1D).
pub fn classify(dim: usize, jacobian: &[f64]) -> Stability {
    let scale = jacobian.iter().fold(1.0f64, |m, v| m.max(v.abs()));
    let tol = 1e-9 * scale;
    match dim {
        1 => {
            let slope = jacobian[0];
            if slope < -tol {
                Stability::StableNode
            } else if slope > tol {
                Stability::UnstableNode
            } else {
                Stability::Degenerate
            }
        }
        _ => {
            let trace = jacobian[0] + jacobian[3];
            let det = jacobian[0] * jacobian[3] - jacobian[1] * jacobian[2];
            let discriminant = trace * trace - 4.0 * det;
            if det < -tol * scale {
                Stability::Saddle
            } else if det <= tol * scale {
                Stability::Degenerate
            } else if trace.abs() <= tol {
                Stability::Center
            } else if discriminant < 0.0 {
                if trace < 0.0 {
                    Stability::StableFocus
                } else {
                    Stability::UnstableFocus
                }
            } else if trace < 0.0 {
                Stability::StableNode
            } else {
                Stability::UnstableNode
            }
        }
    }
}

fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{ParameterSet, SystemSpec};
    use approx::assert_relative_eq;

    fn model(dimension: usize, expressions: &[&str], params: ParameterSet) -> SystemModel {
        let spec = SystemSpec::new(
            dimension,
            expressions.iter().map(|e| e.to_string()).collect(),
            params,
        )
        .expect("supported dimension");
        SystemModel::new(spec).expect("system should compile")
    }

    fn square(half_width: f64) -> Vec<AxisRange> {
        vec![AxisRange::new(-half_width, half_width); 2]
    }

    #[test]
    fn finds_single_equilibrium_of_linear_system() {
        let model = model(
            2,
            &["ax + by", "cx + dy"],
            ParameterSet::from([("a", -1.0), ("b", 5.0), ("c", -4.0), ("d", -2.0)]),
        );
        let points = find_fixed_points(&model, &square(5.0), &FixedPointSettings::default())
            .expect("valid search");
        assert_eq!(points.len(), 1);
        assert_relative_eq!(points[0].state[0], 0.0, epsilon = 1e-9);
        assert_relative_eq!(points[0].state[1], 0.0, epsilon = 1e-9);
        // trace -3, det 22: complex pair with negative real part
        assert_eq!(points[0].stability, Stability::StableFocus);
        assert_relative_eq!(points[0].eigenvalues[0].re, -1.5, epsilon = 1e-9);
    }

    #[test]
    fn sine_has_alternating_stability() {
        let model = model(1, &["sin(x)"], ParameterSet::new());
        let bounds = [AxisRange::new(-5.0, 5.0)];
        let points = find_fixed_points(&model, &bounds, &FixedPointSettings::default())
            .expect("valid search");
        let states: Vec<f64> = points.iter().map(|p| p.state[0]).collect();
        assert_eq!(states.len(), 3);
        let pi = std::f64::consts::PI;
        for (found, expected) in states.iter().zip([-pi, 0.0, pi]) {
            assert_relative_eq!(*found, expected, epsilon = 1e-9);
        }
        assert_eq!(points[0].stability, Stability::StableNode);
        assert_eq!(points[1].stability, Stability::UnstableNode);
        assert_eq!(points[2].stability, Stability::StableNode);
    }

    #[test]
    fn classifies_saddle_and_center() {
        assert_eq!(classify(2, &[1.0, 0.0, 0.0, -1.0]), Stability::Saddle);
        assert_eq!(classify(2, &[0.0, 1.0, -1.0, 0.0]), Stability::Center);
        assert_eq!(classify(2, &[-1.0, 0.0, 0.0, -2.0]), Stability::StableNode);
        assert_eq!(classify(2, &[1.0, -2.0, 2.0, 1.0]), Stability::UnstableFocus);
        assert_eq!(classify(2, &[1.0, 0.0, 0.0, 0.0]), Stability::Degenerate);
    }

    #[test]
    fn newton_reports_singular_jacobian() {
        let model = model(2, &["x + y", "x + y"], ParameterSet::new());
        assert_eq!(
            solve_from_seed(&model, &[1.0, 0.5], &NewtonSettings::default()),
            Err(ConvergenceFailure::Singular)
        );
    }

    #[test]
    fn failing_seeds_are_dropped() {
        // Seeds left of the pole at x = 0.5 diverge.
        let model = model(1, &["1/(x - 0.5) - 1"], ParameterSet::new());
        let bounds = [AxisRange::new(0.0, 5.0)];
        let points = find_fixed_points(&model, &bounds, &FixedPointSettings::default())
            .expect("valid search");
        assert_eq!(points.len(), 1);
        assert_relative_eq!(points[0].state[0], 1.5, epsilon = 1e-9);

        // A single seed placed on the pole.
        let settings = FixedPointSettings {
            seeds_per_axis: 1,
            ..FixedPointSettings::default()
        };
        let points = find_fixed_points(&model, &[AxisRange::new(0.0, 1.0)], &settings)
            .expect("valid search");
        assert!(points.is_empty());
    }

    #[test]
    fn rejects_invalid_search_input() {
        let model = model(1, &["x"], ParameterSet::new());
        assert!(matches!(
            find_fixed_points(&model, &square(1.0), &FixedPointSettings::default()),
            Err(PlaneError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            find_fixed_points(
                &model,
                &[AxisRange::new(1.0, -1.0)],
                &FixedPointSettings::default()
            ),
            Err(PlaneError::InvalidLimits { .. })
        ));
        let settings = FixedPointSettings {
            newton: NewtonSettings {
                damping: 0.0,
                ..NewtonSettings::default()
            },
            ..FixedPointSettings::default()
        };
        assert!(matches!(
            find_fixed_points(&model, &[AxisRange::new(-1.0, 1.0)], &settings),
            Err(PlaneError::InvalidSettings(_))
        ));
    }

    #[test]
    fn double_root_is_reported_once() {
        let model_1d = model(1, &["x^2"], ParameterSet::new());
        let points = find_fixed_points(
            &model_1d,
            &[AxisRange::new(-5.0, 5.0)],
            &FixedPointSettings::default(),
        )
        .expect("valid search");
        assert_eq!(points.len(), 1);
        assert!(points[0].state[0].abs() < 1e-9);
        assert_eq!(points[0].stability, Stability::Degenerate);

        let model_2d = model(2, &["x^2", "-y"], ParameterSet::new());
        let points = find_fixed_points(&model_2d, &square(5.0), &FixedPointSettings::default())
            .expect("valid search");
        assert_eq!(points.len(), 1);
        assert!(points[0].state.iter().all(|x| x.abs() < 1e-9));
    }

    #[test]
    fn few_newton_steps_still_merge_double_roots() {
        let model = model(1, &["x^2"], ParameterSet::new());
        let settings = FixedPointSettings {
            newton: NewtonSettings {
                max_steps: 25,
                ..NewtonSettings::default()
            },
            ..FixedPointSettings::default()
        };
        let points = find_fixed_points(&model, &[AxisRange::new(-5.0, 5.0)], &settings)
            .expect("valid search");
        assert_eq!(points.len(), 1);
    }

    #[test]
    fn saddle_node_of_harvested_population() {
        let model = model(
            1,
            &["x(1 - x) - h"],
            ParameterSet::from([("h", 0.25)]),
        );
        let points = find_fixed_points(
            &model,
            &[AxisRange::new(-1.0, 2.0)],
            &FixedPointSettings::default(),
        )
        .expect("valid search");
        assert_eq!(points.len(), 1);
        assert_relative_eq!(points[0].state[0], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn partial_settings_fill_in_defaults() {
        let settings: FixedPointSettings =
            serde_json::from_str(r#"{"seeds_per_axis": 4, "newton": {"max_steps": 8}}"#)
                .expect("partial settings");
        assert_eq!(settings.seeds_per_axis, 4);
        assert_eq!(settings.newton.max_steps, 8);
        assert_eq!(settings.newton.tolerance, NewtonSettings::default().tolerance);
        assert_eq!(settings.merge_tolerance, None);
    }

    #[test]
    fn seed_grid_uses_cell_centres() {
        let seeds = seed_grid(&[AxisRange::new(0.0, 2.0), AxisRange::new(0.0, 4.0)], 2);
        assert_eq!(
            seeds,
            vec![
                vec![0.5, 1.0],
                vec![0.5, 3.0],
                vec![1.5, 1.0],
                vec![1.5, 3.0]
            ]
        );
    }
}
