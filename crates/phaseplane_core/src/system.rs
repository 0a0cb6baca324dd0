//! The user-edited dynamical system: raw expressions, parameters and the
//! compiled vector field built from them.

use crate::autodiff::{self, Dual};
use crate::equation_engine::{
    compile_with, CompiledExpression, SymbolTable, DEFAULT_INDEPENDENT_VARIABLE,
};
use crate::error::{EvaluationError, PlaneError, Result};
use crate::gallery::GalleryEntry;
use crate::traits::DynamicalSystem;
use log::debug;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;

/// A closed interval `[min, max]` along one axis, serialized as a two-element array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct AxisRange {
    pub min: f64,
    pub max: f64,
}

impl AxisRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min.is_finite() && self.max.is_finite() && self.max > self.min {
            Ok(())
        } else {
            Err(PlaneError::InvalidLimits {
                min: self.min,
                max: self.max,
            })
        }
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    pub fn contains(&self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }

    /// Widens the range by `|max - min| * factor / 2` on each side.
    pub fn expand(&self, factor: f64) -> Self {
        let extension = self.width().abs() * factor / 2.0;
        Self::new(self.min - extension, self.max + extension)
    }

    /// `n` evenly spaced values including both ends (just the midpoint for `n == 1`).
    pub fn linspace(&self, n: usize) -> Vec<f64> {
        match n {
            0 => Vec::new(),
            1 => vec![0.5 * (self.min + self.max)],
            _ => {
                let step = self.width() / (n - 1) as f64;
                (0..n).map(|i| self.min + step * i as f64).collect()
            }
        }
    }
}

impl Default for AxisRange {
    fn default() -> Self {
        Self::new(-5.0, 5.0)
    }
}

impl From<[f64; 2]> for AxisRange {
    fn from([min, max]: [f64; 2]) -> Self {
        Self::new(min, max)
    }
}

impl From<AxisRange> for [f64; 2] {
    fn from(range: AxisRange) -> Self {
        [range.min, range.max]
    }
}

/// Named parameter values, kept in name order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(BTreeMap<String, f64>);

impl ParameterSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) -> Option<f64> {
        self.0.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<f64> {
        self.0.values().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(name, value)| (name.into(), value)).collect())
    }
}

impl<S: Into<String>, const N: usize> From<[(S, f64); N]> for ParameterSet {
    fn from(entries: [(S, f64); N]) -> Self {
        entries.into_iter().collect()
    }
}

fn default_independent_variable() -> String {
    DEFAULT_INDEPENDENT_VARIABLE.to_string()
}

/// Raw, uncompiled description of a system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSpec {
    pub state_vars: Vec<String>,
    #[serde(default = "default_independent_variable")]
    pub indep_var: String,
    pub expressions: Vec<String>,
    #[serde(default)]
    pub params: ParameterSet,
}

impl SystemSpec {
    /// Uses the default names: `x` in 1D, `x, y` in 2D, with independent variable `t`.
    pub fn new(dimension: usize, expressions: Vec<String>, params: ParameterSet) -> Result<Self> {
        let state_vars = match dimension {
            1 => vec!["x".to_string()],
            2 => vec!["x".to_string(), "y".to_string()],
            other => return Err(PlaneError::UnsupportedDimension(other)),
        };
        Ok(Self {
            state_vars,
            indep_var: default_independent_variable(),
            expressions,
            params,
        })
    }

    pub fn dimension(&self) -> usize {
        self.state_vars.len()
    }
}

/// A compiled system ready for evaluation.
///
/// Every analysis takes a `&SystemModel`; `set_system` and `set_spec`
/// compile the complete replacement before touching the current field, so
/// a failed edit leaves the model exactly as it was.
#[derive(Debug, Clone)]
pub struct SystemModel {
    spec: SystemSpec,
    field: Vec<CompiledExpression>,
    param_values: Vec<f64>,
    // Reused VM stacks; this makes the model !Sync.
    stack: RefCell<Vec<f64>>,
    dual_stack: RefCell<Vec<Dual>>,
}

impl SystemModel {
    pub fn new(spec: SystemSpec) -> Result<Self> {
        let (field, param_values) = compile_spec(&spec)?;
        Ok(Self {
            spec,
            field,
            param_values,
            stack: RefCell::new(Vec::with_capacity(64)),
            dual_stack: RefCell::new(Vec::with_capacity(64)),
        })
    }

    pub fn from_gallery_entry(entry: &GalleryEntry) -> Result<Self> {
        Self::new(entry.to_spec()?)
    }

    /// Replaces the system using the default variable names.
    pub fn set_system(
        &mut self,
        dimension: usize,
        expressions: Vec<String>,
        params: ParameterSet,
    ) -> Result<()> {
        self.set_spec(SystemSpec::new(dimension, expressions, params)?)
    }

    pub fn set_spec(&mut self, spec: SystemSpec) -> Result<()> {
        let (field, param_values) = compile_spec(&spec)?;
        self.spec = spec;
        self.field = field;
        self.param_values = param_values;
        Ok(())
    }

    pub fn spec(&self) -> &SystemSpec {
        &self.spec
    }

    pub fn dimension(&self) -> usize {
        self.field.len()
    }

    pub fn state_vars(&self) -> &[String] {
        &self.spec.state_vars
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.spec.params
    }

    /// Parameter values in name order, as the compiled field reads them.
    pub fn parameter_values(&self) -> &[f64] {
        &self.param_values
    }

    pub fn component(&self, index: usize) -> Option<&CompiledExpression> {
        self.field.get(index)
    }

    /// Changes one parameter value without recompiling.
    pub fn update_parameter(&mut self, name: &str, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(PlaneError::InvalidParameter {
                name: name.to_string(),
                value,
            });
        }
        let index = self
            .spec
            .params
            .iter()
            .position(|(candidate, _)| candidate == name)
            .ok_or_else(|| PlaneError::UnknownParameter(name.to_string()))?;
        self.spec.params.insert(name, value);
        self.param_values[index] = value;
        Ok(())
    }

    /// The derivative of every state variable, in declared order.
    pub fn evaluate(&self, t: f64, state: &[f64]) -> Result<Vec<f64>> {
        let mut out = vec![0.0; self.dimension()];
        self.evaluate_into(t, state, &mut out)?;
        Ok(out)
    }

    pub fn evaluate_into(&self, t: f64, state: &[f64], out: &mut [f64]) -> Result<()> {
        let dim = self.dimension();
        for found in [state.len(), out.len()] {
            if found != dim {
                return Err(PlaneError::DimensionMismatch { expected: dim, found });
            }
        }
        <Self as DynamicalSystem<f64>>::apply(self, t, state, out)?;
        Ok(())
    }

    /// Evaluates one component over a flattened array of states.
    pub fn evaluate_component_batch(
        &self,
        index: usize,
        t: f64,
        states: &[f64],
    ) -> Result<Vec<std::result::Result<f64, EvaluationError>>> {
        let expression = self.field.get(index).ok_or(PlaneError::DimensionMismatch {
            expected: self.dimension(),
            found: index + 1,
        })?;
        Ok(expression.evaluate_batch(t, states, &self.param_values))
    }

    /// Row-major Jacobian of the field at `(t, state)` by forward-mode autodiff.
    pub fn jacobian(&self, t: f64, state: &[f64]) -> Result<Vec<f64>> {
        let dim = self.dimension();
        if state.len() != dim {
            return Err(PlaneError::DimensionMismatch {
                expected: dim,
                found: state.len(),
            });
        }
        Ok(autodiff::jacobian(t, state, |t, x, out| {
            <Self as DynamicalSystem<Dual>>::apply(self, t, x, out)
        })?)
    }
}

/// Compiles every expression of `spec` against one symbol table.
fn compile_spec(spec: &SystemSpec) -> Result<(Vec<CompiledExpression>, Vec<f64>)> {
    let dim = spec.dimension();
    if !(1..=2).contains(&dim) {
        return Err(PlaneError::UnsupportedDimension(dim));
    }
    if spec.expressions.len() != dim {
        return Err(PlaneError::DimensionMismatch {
            expected: dim,
            found: spec.expressions.len(),
        });
    }
    if let Some((name, value)) = spec.params.iter().find(|(_, value)| !value.is_finite()) {
        return Err(PlaneError::InvalidParameter {
            name: name.to_string(),
            value,
        });
    }

    let table = SymbolTable::new(&spec.state_vars, &spec.indep_var, &spec.params.names())
        .map_err(PlaneError::Symbols)?;
    let field = spec
        .state_vars
        .iter()
        .zip(&spec.expressions)
        .map(|(variable, expression)| {
            compile_with(expression, &table).map_err(|source| PlaneError::Parse {
                variable: variable.clone(),
                expression: expression.clone(),
                source,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    debug!(
        "compiled {}D system {:?} with parameters {:?}",
        dim, spec.expressions, spec.params
    );
    Ok((field, spec.params.values()))
}

impl DynamicalSystem<f64> for SystemModel {
    fn dimension(&self) -> usize {
        self.field.len()
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) -> std::result::Result<(), EvaluationError> {
        let mut stack = self.stack.borrow_mut();
        for (slot, expression) in out.iter_mut().zip(&self.field) {
            *slot = expression.evaluate_with(t, x, &self.param_values, &mut *stack)?;
        }
        Ok(())
    }
}

impl DynamicalSystem<Dual> for SystemModel {
    fn dimension(&self) -> usize {
        self.field.len()
    }

    fn apply(&self, t: Dual, x: &[Dual], out: &mut [Dual]) -> std::result::Result<(), EvaluationError> {
        let mut stack = self.dual_stack.borrow_mut();
        for (slot, expression) in out.iter_mut().zip(&self.field) {
            *slot = expression.evaluate_with(t, x, &self.param_values, &mut *stack)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn van_der_pol() -> SystemModel {
        let spec = SystemSpec::new(
            2,
            strings(&["y", "mu(1-x^2)y - x"]),
            ParameterSet::from([("mu", 1.0)]),
        )
        .expect("2D is supported");
        SystemModel::new(spec).expect("system should compile")
    }

    #[test]
    fn evaluates_every_component_in_order() {
        let model = van_der_pol();
        let value = model.evaluate(0.0, &[2.0, 1.0]).expect("should evaluate");
        assert_eq!(value, vec![1.0, -5.0]);
    }

    #[test]
    fn update_parameter_changes_evaluation_without_recompiling() {
        let mut model = van_der_pol();
        model.update_parameter("mu", 0.0).expect("mu exists");
        let value = model.evaluate(0.0, &[2.0, 1.0]).expect("should evaluate");
        assert_eq!(value, vec![1.0, -2.0]);
        assert_eq!(model.parameters().get("mu"), Some(0.0));

        assert_eq!(
            model.update_parameter("nu", 1.0),
            Err(PlaneError::UnknownParameter("nu".to_string()))
        );
        assert!(matches!(
            model.update_parameter("mu", f64::NAN),
            Err(PlaneError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn failed_set_system_keeps_previous_field() {
        let mut model = van_der_pol();
        let err = model
            .set_system(2, strings(&["y", "x + q"]), ParameterSet::new())
            .expect_err("q is undeclared");
        assert!(err.as_parse_error().is_some());
        assert!(matches!(err, PlaneError::Parse { ref variable, .. } if variable == "y"));
        assert_eq!(model.evaluate(0.0, &[2.0, 1.0]), Ok(vec![1.0, -5.0]));

        assert_eq!(
            model.set_system(3, strings(&["x", "y", "z"]), ParameterSet::new()),
            Err(PlaneError::UnsupportedDimension(3))
        );
        assert_eq!(
            model.set_system(2, strings(&["x"]), ParameterSet::new()),
            Err(PlaneError::DimensionMismatch {
                expected: 2,
                found: 1
            })
        );
        assert!(matches!(
            model.set_system(1, strings(&["x"]), ParameterSet::from([("x", 1.0)])),
            Err(PlaneError::Symbols(_))
        ));
        assert_eq!(model.dimension(), 2);
    }

    #[test]
    fn set_system_switches_dimension() {
        let mut model = van_der_pol();
        model
            .set_system(1, strings(&["rx(1-x)"]), ParameterSet::from([("r", 2.0)]))
            .expect("logistic should compile");
        assert_eq!(model.dimension(), 1);
        assert_eq!(model.evaluate(0.0, &[0.5]), Ok(vec![0.5]));
    }

    #[test]
    fn evaluation_reports_dimension_and_domain_errors() {
        let model = van_der_pol();
        assert_eq!(
            model.evaluate(0.0, &[1.0]),
            Err(PlaneError::DimensionMismatch {
                expected: 2,
                found: 1
            })
        );

        let spec = SystemSpec::new(1, strings(&["1/(x-1)"]), ParameterSet::new())
            .expect("1D is supported");
        let model = SystemModel::new(spec).expect("should compile");
        assert_eq!(
            model.evaluate(0.0, &[1.0]),
            Err(PlaneError::Evaluation(EvaluationError::DivisionByZero))
        );
    }

    #[test]
    fn jacobian_matches_analytic_derivative() {
        let model = van_der_pol();
        let jacobian = model.jacobian(0.0, &[2.0, 1.0]).expect("should differentiate");
        // d/dx (mu(1-x^2)y - x) = -2 mu x y - 1
        assert_relative_eq!(jacobian[0], 0.0);
        assert_relative_eq!(jacobian[1], 1.0);
        assert_relative_eq!(jacobian[2], -5.0);
        assert_relative_eq!(jacobian[3], -3.0);
    }

    #[test]
    fn custom_names_and_time_dependence() {
        let spec = SystemSpec {
            state_vars: strings(&["u"]),
            indep_var: "s".to_string(),
            expressions: strings(&["-u + sin(s)"]),
            params: ParameterSet::new(),
        };
        let model = SystemModel::new(spec).expect("should compile");
        let value = model
            .evaluate(std::f64::consts::FRAC_PI_2, &[1.0])
            .expect("should evaluate");
        assert_relative_eq!(value[0], 0.0);
    }

    #[test]
    fn axis_range_helpers() {
        let range = AxisRange::new(-1.0, 3.0);
        assert_eq!(range.expand(0.5), AxisRange::new(-2.0, 4.0));
        assert_eq!(range.linspace(3), vec![-1.0, 1.0, 3.0]);
        assert!(AxisRange::new(1.0, 1.0).validate().is_err());
        assert!(AxisRange::new(f64::NEG_INFINITY, 1.0).validate().is_err());

        let parsed: Vec<AxisRange> = serde_json::from_str("[[-5, 5], [0, 10]]").expect("valid JSON");
        assert_eq!(parsed, vec![AxisRange::new(-5.0, 5.0), AxisRange::new(0.0, 10.0)]);
    }
}
