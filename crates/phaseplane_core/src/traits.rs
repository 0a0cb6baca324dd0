use crate::error::EvaluationError;
use num_traits::Float;
use std::fmt::Debug;

/// A trait for types that can be used as scalars in a vector field.
/// `f64` for plain evaluation, `Dual` when a Jacobian is needed.
pub trait Scalar: Float + Debug + 'static {
    /// Lifts a real constant (a literal or a parameter value) into the scalar type.
    fn from_real(value: f64) -> Self;

    /// The real part of the value, used for domain checks.
    fn real(self) -> f64;
}

impl Scalar for f64 {
    fn from_real(value: f64) -> Self {
        value
    }

    fn real(self) -> f64 {
        self
    }
}

/// Represents a first-order ODE system `dx/dt = f(t, x)`.
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// x: current state
    /// out: buffer to write dx/dt into
    fn apply(&self, t: T, x: &[T], out: &mut [T]) -> Result<(), EvaluationError>;
}

/// A fixed-step solver that advances a system by one step.
pub trait Steppable<T: Scalar> {
    /// Performs one step of size dt (negative dt integrates backward).
    /// `t` and `state` are only updated when every stage evaluated cleanly.
    fn step(
        &mut self,
        system: &impl DynamicalSystem<T>,
        t: &mut T,
        state: &mut [T],
        dt: T,
    ) -> Result<(), EvaluationError>;
}

/// An embedded Runge-Kutta pair: one step yields a solution and a local error estimate.
pub trait EmbeddedStep {
    /// Order of the propagated solution, used by the step-size controller.
    const ORDER: usize;

    /// Attempts a step of size `dt` from `(t, state)` without committing it.
    /// Writes the candidate solution to `out` and the error estimate to `error`.
    fn try_step(
        &mut self,
        system: &impl DynamicalSystem<f64>,
        t: f64,
        state: &[f64],
        dt: f64,
        out: &mut [f64],
        error: &mut [f64],
    ) -> Result<(), EvaluationError>;
}
