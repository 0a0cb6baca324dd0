//! Numerical integration of trajectories from an initial condition.
//!
//! Integration never fails once its inputs are valid: a stage that cannot be
//! evaluated, a step size that underflows or leaving the escape bounds ends
//! the trajectory early and records why in [`Termination`].

use crate::error::{EvaluationError, PlaneError, Result};
use crate::solvers::{Dopri5, RK4};
use crate::system::{AxisRange, SystemModel};
use crate::traits::{DynamicalSystem, EmbeddedStep, Steppable};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;
pub const MAX_STEPS_LIMIT: usize = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Backward => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IntegrationMethod {
    #[default]
    Dopri5,
    Rk4,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationSettings {
    pub method: IntegrationMethod,
    pub rtol: f64,
    pub atol: f64,
    /// Largest adaptive step; `None` uses a hundredth of the horizon.
    pub h_max: Option<f64>,
    /// First adaptive step; `None` estimates it from the field.
    pub initial_step: Option<f64>,
    /// Step size for [`IntegrationMethod::Rk4`].
    pub fixed_step: f64,
    pub max_steps: usize,
    /// Stop once the state leaves these ranges, one per state variable.
    pub escape_bounds: Option<Vec<AxisRange>>,
}

impl Default for IntegrationSettings {
    fn default() -> Self {
        Self {
            method: IntegrationMethod::Dopri5,
            rtol: 1e-8,
            atol: 1e-10,
            h_max: None,
            initial_step: None,
            fixed_step: 0.01,
            max_steps: 100_000,
            escape_bounds: None,
        }
    }
}

impl IntegrationSettings {
    fn validate(&self, dim: usize) -> Result<()> {
        let invalid = |message: &str| Err(PlaneError::InvalidSettings(message.to_string()));
        if !(self.rtol > 0.0 && self.rtol.is_finite()) {
            return invalid("rtol must be positive");
        }
        if !(self.atol >= 0.0 && self.atol.is_finite()) {
            return invalid("atol must be non-negative");
        }
        if self.h_max.is_some_and(|h| !(h > 0.0)) {
            return invalid("h_max must be positive");
        }
        if self.initial_step.is_some_and(|h| !(h > 0.0 && h.is_finite())) {
            return invalid("initial_step must be positive");
        }
        if !(self.fixed_step > 0.0 && self.fixed_step.is_finite()) {
            return invalid("fixed_step must be positive");
        }
        if self.max_steps == 0 {
            return invalid("max_steps must be greater than zero");
        }
        if let Some(bounds) = &self.escape_bounds {
            if bounds.len() != dim {
                return Err(PlaneError::DimensionMismatch {
                    expected: dim,
                    found: bounds.len(),
                });
            }
            for range in bounds {
                range.validate()?;
            }
        }
        Ok(())
    }
}

/// Why a trajectory stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Termination {
    Completed,
    EvaluationFailed { t: f64, reason: String },
    StepSizeUnderflow { t: f64 },
    StepLimit,
    EscapedBounds { t: f64 },
}

/// Samples of one solution curve, in integration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub direction: Direction,
    pub dim: usize,
    pub times: Vec<f64>,
    /// Flattened, `dim` values per sample.
    pub states: Vec<f64>,
    pub termination: Termination,
}

impl Trajectory {
    fn start(direction: Direction, t: f64, state: &[f64]) -> Self {
        Self {
            direction,
            dim: state.len(),
            times: vec![t],
            states: state.to_vec(),
            termination: Termination::Completed,
        }
    }

    fn push(&mut self, t: f64, state: &[f64]) {
        self.times.push(t);
        self.states.extend_from_slice(state);
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn state(&self, index: usize) -> Option<&[f64]> {
        self.states.get(index * self.dim..(index + 1) * self.dim)
    }

    pub fn last_time(&self) -> f64 {
        self.times.last().copied().unwrap_or(f64::NAN)
    }

    pub fn last_state(&self) -> &[f64] {
        &self.states[self.states.len().saturating_sub(self.dim)..]
    }

    pub fn is_complete(&self) -> bool {
        self.termination == Termination::Completed
    }
}

/// Integrates from `(t_start, initial)` for `|horizon|` time units in `direction`.
pub fn integrate<S: DynamicalSystem<f64>>(
    system: &S,
    initial: &[f64],
    t_start: f64,
    horizon: f64,
    direction: Direction,
    settings: &IntegrationSettings,
) -> Result<Trajectory> {
    let dim = system.dimension();
    if initial.len() != dim {
        return Err(PlaneError::DimensionMismatch {
            expected: dim,
            found: initial.len(),
        });
    }
    if initial.iter().any(|x| !x.is_finite()) {
        return Err(PlaneError::InvalidSettings(
            "initial condition must be finite".to_string(),
        ));
    }
    if !t_start.is_finite() || !horizon.is_finite() {
        return Err(PlaneError::InvalidSettings(
            "start time and horizon must be finite".to_string(),
        ));
    }
    settings.validate(dim)?;

    let mut settings = settings.clone();
    if settings.max_steps > MAX_STEPS_LIMIT {
        warn!(
            "max_steps {} out of range, using {}",
            settings.max_steps, MAX_STEPS_LIMIT
        );
        settings.max_steps = MAX_STEPS_LIMIT;
    }

    let t_end = t_start + direction.sign() * horizon.abs();
    let mut trajectory = Trajectory::start(direction, t_start, initial);
    if escaped(&settings, initial) {
        trajectory.termination = Termination::EscapedBounds { t: t_start };
        return Ok(trajectory);
    }

    match settings.method {
        IntegrationMethod::Dopri5 => run_adaptive(system, &mut trajectory, t_end, &settings),
        IntegrationMethod::Rk4 => run_fixed(system, &mut trajectory, t_end, &settings),
    }

    if !trajectory.is_complete() {
        debug!(
            "{:?} trajectory from {:?} stopped at t = {}: {:?}",
            direction,
            initial,
            trajectory.last_time(),
            trajectory.termination
        );
    }
    Ok(trajectory)
}

fn escaped(settings: &IntegrationSettings, state: &[f64]) -> bool {
    settings.escape_bounds.as_ref().is_some_and(|bounds| {
        state
            .iter()
            .zip(bounds)
            .any(|(&value, range)| !range.contains(value))
    })
}

fn evaluation_failed(t: f64, error: EvaluationError) -> Termination {
    Termination::EvaluationFailed {
        t,
        reason: error.to_string(),
    }
}

fn run_fixed<S: DynamicalSystem<f64>>(
    system: &S,
    trajectory: &mut Trajectory,
    t_end: f64,
    settings: &IntegrationSettings,
) {
    let sign = trajectory.direction.sign();
    let mut solver = RK4::<f64>::new(trajectory.dim);
    let mut t = trajectory.last_time();
    let mut state = trajectory.last_state().to_vec();
    let mut steps = 0usize;

    while (t_end - t) * sign > 0.0 {
        if steps >= settings.max_steps {
            trajectory.termination = Termination::StepLimit;
            return;
        }
        let remaining = (t_end - t).abs();
        let last = remaining <= settings.fixed_step;
        let dt = sign * remaining.min(settings.fixed_step);
        if let Err(error) = solver.step(system, &mut t, &mut state, dt) {
            trajectory.termination = evaluation_failed(t, error);
            return;
        }
        if last {
            t = t_end;
        }
        if state.iter().any(|x| !x.is_finite()) {
            trajectory.termination = evaluation_failed(
                t,
                EvaluationError::NonFinite {
                    operation: "integration step",
                },
            );
            return;
        }
        trajectory.push(t, &state);
        steps += 1;
        if escaped(settings, &state) {
            trajectory.termination = Termination::EscapedBounds { t };
            return;
        }
    }
}

fn run_adaptive<S: DynamicalSystem<f64>>(
    system: &S,
    trajectory: &mut Trajectory,
    t_end: f64,
    settings: &IntegrationSettings,
) {
    let dim = trajectory.dim;
    let sign = trajectory.direction.sign();
    let span = (t_end - trajectory.last_time()).abs();
    if span == 0.0 {
        return;
    }

    let mut t = trajectory.last_time();
    let mut state = trajectory.last_state().to_vec();
    let h_max = settings.h_max.unwrap_or(span / 100.0).min(span);
    let mut h = match settings.initial_step {
        Some(h) => h,
        None => match initial_step(system, t, &state, sign, h_max, settings) {
            Ok(h) => h,
            Err(error) => {
                trajectory.termination = evaluation_failed(t, error);
                return;
            }
        },
    }
    .min(h_max);

    let mut stepper = Dopri5::new(dim);
    let mut candidate = vec![0.0; dim];
    let mut error = vec![0.0; dim];
    let mut steps = 0usize;
    let mut rejected = false;
    let exponent = -1.0 / Dopri5::ORDER as f64;

    while (t_end - t) * sign > 0.0 {
        if steps >= settings.max_steps {
            trajectory.termination = Termination::StepLimit;
            return;
        }
        let h_min = 16.0 * f64::EPSILON * t.abs().max(1.0);
        if h < h_min {
            trajectory.termination = Termination::StepSizeUnderflow { t };
            return;
        }

        let remaining = (t_end - t).abs();
        let last = remaining <= h;
        let step = if last { remaining } else { h };
        if let Err(stage_error) =
            stepper.try_step(system, t, &state, sign * step, &mut candidate, &mut error)
        {
            trajectory.termination = evaluation_failed(t, stage_error);
            return;
        }
        steps += 1;

        let err = error_norm(&state, &candidate, &error, settings);
        if err.is_nan() {
            trajectory.termination = evaluation_failed(
                t,
                EvaluationError::NonFinite {
                    operation: "integration step",
                },
            );
            return;
        }

        if err <= 1.0 {
            t = if last { t_end } else { t + sign * step };
            state.copy_from_slice(&candidate);
            trajectory.push(t, &state);
            if escaped(settings, &state) {
                trajectory.termination = Termination::EscapedBounds { t };
                return;
            }
            let mut factor = if err == 0.0 {
                MAX_FACTOR
            } else {
                (SAFETY * err.powf(exponent)).clamp(MIN_FACTOR, MAX_FACTOR)
            };
            if rejected {
                factor = factor.min(1.0);
            }
            rejected = false;
            h = (step * factor).min(h_max);
        } else {
            let factor = (SAFETY * err.powf(exponent)).clamp(MIN_FACTOR, 1.0);
            rejected = true;
            h = step * factor;
        }
    }
}

/// Weighted RMS norm of the local error estimate.
fn error_norm(state: &[f64], candidate: &[f64], error: &[f64], settings: &IntegrationSettings) -> f64 {
    let sum: f64 = state
        .iter()
        .zip(candidate)
        .zip(error)
        .map(|((y0, y1), e)| {
            let scale = settings.atol + settings.rtol * y0.abs().max(y1.abs());
            scaled(*e, scale).powi(2)
        })
        .sum();
    (sum / state.len().max(1) as f64).sqrt()
}

/// `value / scale`, where a zero scale only tolerates an exact zero.
fn scaled(value: f64, scale: f64) -> f64 {
    if scale == 0.0 && value == 0.0 {
        0.0
    } else {
        value / scale
    }
}

/// Starting step estimate from the size of the field and its variation
/// over a small explicit Euler step.
fn initial_step<S: DynamicalSystem<f64>>(
    system: &S,
    t: f64,
    state: &[f64],
    sign: f64,
    h_max: f64,
    settings: &IntegrationSettings,
) -> std::result::Result<f64, EvaluationError> {
    let dim = state.len();
    let scale: Vec<f64> = state
        .iter()
        .map(|y| settings.atol + settings.rtol * y.abs())
        .collect();
    let rms = |values: &[f64]| {
        (values
            .iter()
            .zip(&scale)
            .map(|(v, s)| scaled(*v, *s).powi(2))
            .sum::<f64>()
            / dim.max(1) as f64)
            .sqrt()
    };

    let mut f0 = vec![0.0; dim];
    system.apply(t, state, &mut f0)?;
    let d0 = rms(state);
    let d1 = rms(&f0);
    let h0 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    }
    .min(h_max);

    let y1: Vec<f64> = state
        .iter()
        .zip(&f0)
        .map(|(y, f)| y + sign * h0 * f)
        .collect();
    let mut f1 = vec![0.0; dim];
    if system.apply(t + sign * h0, &y1, &mut f1).is_err() {
        return Ok(h0);
    }
    let diff: Vec<f64> = f1.iter().zip(&f0).map(|(a, b)| a - b).collect();
    let d2 = rms(&diff) / h0;

    let h1 = if d1.max(d2) <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(1.0 / Dopri5::ORDER as f64)
    };
    Ok((100.0 * h0).min(h1).min(h_max))
}

/// Forward and backward trajectories through the same initial condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Orbit {
    pub forward: Trajectory,
    pub backward: Trajectory,
}

impl Orbit {
    /// Times and flattened states in increasing time: the backward branch
    /// reversed, then the forward branch. The shared start appears once.
    pub fn time_course(&self) -> (Vec<f64>, Vec<f64>) {
        let dim = self.forward.dim;
        let mut times = Vec::with_capacity(self.forward.len() + self.backward.len());
        let mut states = Vec::with_capacity(self.forward.states.len() + self.backward.states.len());
        for i in (1..self.backward.len()).rev() {
            if let Some(state) = self.backward.state(i) {
                times.push(self.backward.times[i]);
                states.extend_from_slice(state);
            }
        }
        times.extend_from_slice(&self.forward.times);
        states.extend_from_slice(&self.forward.states);
        debug_assert_eq!(states.len(), times.len() * dim);
        (times, states)
    }
}

/// Integrates forward for `t_forward` and backward for `|t_backward|` time units,
/// the way a click on the phase plane does with the gallery's `t_f` and `t_r`.
pub fn trace_orbit(
    model: &SystemModel,
    initial: &[f64],
    t_start: f64,
    t_forward: f64,
    t_backward: f64,
    settings: &IntegrationSettings,
) -> Result<Orbit> {
    let forward = integrate(
        model,
        initial,
        t_start,
        t_forward,
        Direction::Forward,
        settings,
    )?;
    let backward = integrate(
        model,
        initial,
        t_start,
        t_backward,
        Direction::Backward,
        settings,
    )?;
    Ok(Orbit { forward, backward })
}
