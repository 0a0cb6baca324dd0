pub mod autodiff;
pub mod equation_engine;
pub mod equilibrium;
pub mod error;
pub mod field;
pub mod gallery;
pub mod nullcline;
pub mod solvers;
pub mod system;
pub mod trajectory;
/// The `phaseplane_core` crate is the numerical engine behind PhasePlane, an
/// interactive explorer for one- and two-dimensional ODEs `dx/dt = f(t, x)`.
///
/// Key components:
/// - **Equation Engine**: parses user expressions (with implicit multiplication
///   such as `axy` or `b(x^2-y^2)`) into bytecode for a small stack VM.
/// - **System**: `SystemModel` owns the compiled field and its parameters.
/// - **Analysis**: fixed points (`equilibrium`), nullclines, direction fields
///   and trajectories (`trajectory`, backed by the Dormand-Prince and RK4 `solvers`).
/// - **Autodiff**: dual numbers for the Jacobians used by Newton's method.
/// - **Gallery**: the bundled example systems.
pub mod traits;

pub use error::{EvaluationError, ParseError, PlaneError};
pub use system::{AxisRange, ParameterSet, SystemModel, SystemSpec};
