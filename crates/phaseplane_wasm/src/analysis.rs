//! Analysis entry points: fixed points, nullclines, trajectories and the direction field.

use crate::system::WasmPhasePlane;
use crate::{to_js, to_js_error};
use phaseplane_core::equilibrium::{find_fixed_points, FixedPoint};
use phaseplane_core::error::Result as PlaneResult;
use phaseplane_core::field::{sample_field, FieldSample};
use phaseplane_core::nullcline::{compute_nullclines, Nullcline};
use phaseplane_core::system::AxisRange;
use phaseplane_core::trajectory::{integrate, trace_orbit, Direction, Orbit, Trajectory};
use std::collections::BTreeMap;
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
impl WasmPhasePlane {
    /// Fixed points inside the current axes limits.
    pub fn find_fixed_points(&self) -> Result<JsValue, JsValue> {
        to_js(&self.try_fixed_points().map_err(to_js_error)?)
    }

    /// Nullclines keyed by state variable name. 2D systems only.
    pub fn compute_nullclines(&self) -> Result<JsValue, JsValue> {
        to_js(&self.try_nullclines().map_err(to_js_error)?)
    }

    pub fn integrate(
        &self,
        initial: Vec<f64>,
        t_start: f64,
        horizon: f64,
        forward: bool,
    ) -> Result<JsValue, JsValue> {
        let direction = if forward {
            Direction::Forward
        } else {
            Direction::Backward
        };
        let trajectory = self
            .try_integrate(&initial, t_start, horizon, direction)
            .map_err(to_js_error)?;
        to_js(&trajectory)
    }

    /// Forward and backward trajectories for the current `t_f` and `t_r`.
    pub fn trace_orbit(&self, initial: Vec<f64>, t_start: f64) -> Result<JsValue, JsValue> {
        to_js(&self.try_orbit(&initial, t_start).map_err(to_js_error)?)
    }

    pub fn sample_field(
        &self,
        points_per_axis: usize,
        expansion_factor: f64,
    ) -> Result<JsValue, JsValue> {
        let sample = self
            .try_field(points_per_axis, expansion_factor)
            .map_err(to_js_error)?;
        to_js(&sample)
    }
}

impl WasmPhasePlane {
    pub(crate) fn try_fixed_points(&self) -> PlaneResult<Vec<FixedPoint>> {
        find_fixed_points(&self.model, &self.view.axes_limits, &self.fixed_points)
    }

    pub(crate) fn try_nullclines(&self) -> PlaneResult<BTreeMap<String, Nullcline>> {
        compute_nullclines(&self.model, &self.view.axes_limits, &self.nullclines)
    }

    pub(crate) fn try_integrate(
        &self,
        initial: &[f64],
        t_start: f64,
        horizon: f64,
        direction: Direction,
    ) -> PlaneResult<Trajectory> {
        integrate(
            &self.model,
            initial,
            t_start,
            horizon,
            direction,
            &self.integration,
        )
    }

    pub(crate) fn try_orbit(&self, initial: &[f64], t_start: f64) -> PlaneResult<Orbit> {
        trace_orbit(
            &self.model,
            initial,
            t_start,
            self.view.t_f,
            self.view.t_r,
            &self.integration,
        )
    }

    /// The 1D field lives in the `(t, x)` plane.
    pub(crate) fn try_field(
        &self,
        points_per_axis: usize,
        expansion_factor: f64,
    ) -> PlaneResult<FieldSample> {
        let axes = match self.view.axes_limits.as_slice() {
            [x] => vec![self.view.time_range.unwrap_or(AxisRange::new(0.0, 10.0)), *x],
            limits => limits.to_vec(),
        };
        sample_field(&self.model, &axes, points_per_axis, expansion_factor)
    }
}


#[cfg(all(test, target_arch = "wasm32"))]
mod wasm_tests {
    use crate::system::WasmPhasePlane;
    use phaseplane_core::equilibrium::FixedPoint;
    use phaseplane_core::trajectory::Trajectory;
    use serde_wasm_bindgen::{from_value, to_value};
    use wasm_bindgen_test::wasm_bindgen_test;

    #[wasm_bindgen_test]
    fn analysis_results_cross_the_boundary() {
        let mut plane = WasmPhasePlane::new(2).expect("2D default");
        plane
            .set_system(
                2,
                vec!["ax + by".to_string(), "cx + dy".to_string()],
                vec!["a".into(), "b".into(), "c".into(), "d".into()],
                vec![1.0, -1.0, 1.0, 1.0],
            )
            .expect("valid system");
        let points: Vec<FixedPoint> =
            from_value(plane.find_fixed_points().expect("valid search")).expect("fixed points");
        assert_eq!(points.len(), 1);

        let trajectory: Trajectory =
            from_value(plane.integrate(vec![1.0, 0.0], 0.0, 1.0, true).expect("valid input"))
                .expect("trajectory");
        assert_eq!(trajectory.last_time(), 1.0);
    }

    #[wasm_bindgen_test]
    fn invalid_limits_are_reported_as_strings() {
        let mut plane = WasmPhasePlane::new(2).expect("2D default");
        let limits = to_value(&vec![[1.0, -1.0], [-1.0, 1.0]]).expect("limits");
        let message = plane
            .set_axes_limits(limits)
            .err()
            .and_then(|err| err.as_string())
            .unwrap_or_default();
        assert!(!message.is_empty());
    }
}
