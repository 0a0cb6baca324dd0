//! The system held by the UI: editing, parameters and view settings.

use crate::{to_js, to_js_error};
use phaseplane_core::equilibrium::FixedPointSettings;
use phaseplane_core::error::{PlaneError, Result as PlaneResult};
use phaseplane_core::gallery::{default_system, Gallery, GalleryEntry, ViewSettings};
use phaseplane_core::nullcline::NullclineSettings;
use phaseplane_core::system::{AxisRange, ParameterSet, SystemModel};
use phaseplane_core::trajectory::IntegrationSettings;
use serde_wasm_bindgen::from_value;
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub struct WasmPhasePlane {
    pub(crate) model: SystemModel,
    pub(crate) view: ViewSettings,
    pub(crate) integration: IntegrationSettings,
    pub(crate) fixed_points: FixedPointSettings,
    pub(crate) nullclines: NullclineSettings,
}

#[wasm_bindgen]
impl WasmPhasePlane {
    /// Starts from the default gallery system of the given dimension.
    #[wasm_bindgen(constructor)]
    pub fn new(dimension: usize) -> Result<WasmPhasePlane, JsValue> {
        console_error_panic_hook::set_once();
        Self::try_default(dimension).map_err(to_js_error)
    }

    /// Loads `name` from a gallery JSON document.
    pub fn from_gallery_json(json: &str, name: &str) -> Result<WasmPhasePlane, JsValue> {
        console_error_panic_hook::set_once();
        let gallery = Gallery::from_json_str(json).map_err(to_js_error)?;
        let entry = gallery
            .get(name)
            .ok_or_else(|| to_js_error(format!("no system named `{name}` in gallery")))?;
        Self::try_from_entry(entry).map_err(to_js_error)
    }

    pub fn dimension(&self) -> usize {
        self.model.dimension()
    }

    pub fn state_vars(&self) -> Vec<String> {
        self.model.state_vars().to_vec()
    }

    pub fn expressions(&self) -> Vec<String> {
        self.model.spec().expressions.clone()
    }

    pub fn parameters(&self) -> Result<JsValue, JsValue> {
        to_js(self.model.parameters())
    }

    pub fn set_system(
        &mut self,
        dimension: usize,
        expressions: Vec<String>,
        param_names: Vec<String>,
        param_values: Vec<f64>,
    ) -> Result<(), JsValue> {
        self.try_set_system(dimension, expressions, param_names, param_values)
            .map_err(to_js_error)
    }

    pub fn update_parameter(&mut self, name: &str, value: f64) -> Result<(), JsValue> {
        self.model.update_parameter(name, value).map_err(to_js_error)
    }

    pub fn evaluate(&self, t: f64, state: Vec<f64>) -> Result<Vec<f64>, JsValue> {
        self.model.evaluate(t, &state).map_err(to_js_error)
    }

    pub fn set_horizons(&mut self, t_f: f64, t_r: f64) -> Result<(), JsValue> {
        self.try_set_horizons(t_f, t_r).map_err(to_js_error)
    }

    /// Replaces the plot limits, given as `[[min, max], ...]`, one pair per state variable.
    pub fn set_axes_limits(&mut self, limits: JsValue) -> Result<(), JsValue> {
        let limits: Vec<AxisRange> = from_value(limits)
            .map_err(|e| JsValue::from_str(&format!("Invalid axes limits: {}", e)))?;
        self.try_set_axes_limits(limits).map_err(to_js_error)
    }

    pub fn view(&self) -> Result<JsValue, JsValue> {
        to_js(&self.view)
    }

    pub fn set_integration_settings(&mut self, settings: JsValue) -> Result<(), JsValue> {
        self.integration = from_value(settings)
            .map_err(|e| JsValue::from_str(&format!("Invalid integration settings: {}", e)))?;
        Ok(())
    }

    pub fn set_fixed_point_settings(&mut self, settings: JsValue) -> Result<(), JsValue> {
        self.fixed_points = from_value(settings)
            .map_err(|e| JsValue::from_str(&format!("Invalid fixed point settings: {}", e)))?;
        Ok(())
    }

    pub fn set_nullcline_resolution(&mut self, resolution: usize) {
        self.nullclines.resolution = resolution;
    }
}

impl WasmPhasePlane {
    pub(crate) fn try_default(dimension: usize) -> PlaneResult<Self> {
        Self::try_from_entry(&default_system(dimension)?)
    }

    pub(crate) fn try_from_entry(entry: &GalleryEntry) -> PlaneResult<Self> {
        Ok(Self {
            model: SystemModel::from_gallery_entry(entry)?,
            view: entry.view()?,
            integration: IntegrationSettings::default(),
            fixed_points: FixedPointSettings::default(),
            nullclines: NullclineSettings::default(),
        })
    }

    pub(crate) fn try_set_system(
        &mut self,
        dimension: usize,
        expressions: Vec<String>,
        param_names: Vec<String>,
        param_values: Vec<f64>,
    ) -> PlaneResult<()> {
        if param_names.len() != param_values.len() {
            return Err(PlaneError::DimensionMismatch {
                expected: param_names.len(),
                found: param_values.len(),
            });
        }
        if let Some(name) = param_names
            .iter()
            .enumerate()
            .find_map(|(i, name)| param_names[..i].contains(name).then_some(name))
        {
            return Err(PlaneError::InvalidSettings(format!(
                "parameter `{name}` is given more than once"
            )));
        }
        let params: ParameterSet = param_names.into_iter().zip(param_values).collect();
        let previous_dimension = self.model.dimension();
        self.model.set_system(dimension, expressions, params)?;
        if dimension != previous_dimension {
            let horizons = (self.view.t_f, self.view.t_r);
            self.view = ViewSettings::for_dimension(dimension);
            (self.view.t_f, self.view.t_r) = horizons;
        }
        Ok(())
    }

    pub(crate) fn try_set_horizons(&mut self, t_f: f64, t_r: f64) -> PlaneResult<()> {
        if !t_f.is_finite() || !t_r.is_finite() {
            return Err(PlaneError::InvalidSettings(
                "integration horizons must be finite".to_string(),
            ));
        }
        self.view.t_f = t_f;
        self.view.t_r = t_r;
        Ok(())
    }

    pub(crate) fn try_set_axes_limits(&mut self, limits: Vec<AxisRange>) -> PlaneResult<()> {
        let dim = self.model.dimension();
        if limits.len() != dim {
            return Err(PlaneError::DimensionMismatch {
                expected: dim,
                found: limits.len(),
            });
        }
        for range in &limits {
            range.validate()?;
        }
        self.view.axes_limits = limits;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::WasmPhasePlane;
    use phaseplane_core::error::PlaneError;
    use phaseplane_core::system::AxisRange;

    #[test]
    fn starts_from_default_systems() {
        let plane = WasmPhasePlane::try_default(2).expect("2D default");
        assert_eq!(plane.dimension(), 2);
        assert_eq!(plane.state_vars(), vec!["x".to_string(), "y".to_string()]);
        assert_eq!(plane.view.t_f, 5.0);

        let plane = WasmPhasePlane::try_default(1).expect("1D default");
        assert_eq!(plane.expressions(), vec!["sin(x)".to_string()]);
    }

    #[test]
    fn set_system_keeps_previous_system_on_error() {
        let mut plane = WasmPhasePlane::try_default(2).expect("2D default");
        let err = plane
            .try_set_system(
                2,
                vec!["y".to_string(), "q".to_string()],
                Vec::new(),
                Vec::new(),
            )
            .expect_err("q is undeclared");
        assert!(err.as_parse_error().is_some());
        assert_eq!(plane.expressions()[1], "mu(1 - x^2)y - x");

        assert!(matches!(
            plane.try_set_system(2, vec!["y".into(), "x".into()], vec!["a".into()], Vec::new()),
            Err(PlaneError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn duplicate_parameter_names_are_rejected() {
        let mut plane = WasmPhasePlane::try_default(2).expect("2D default");
        let result = plane.try_set_system(
            2,
            vec!["ay".to_string(), "-x".to_string()],
            vec!["a".into(), "a".into()],
            vec![1.0, 2.0],
        );
        assert!(matches!(result, Err(PlaneError::InvalidSettings(_))));
        assert_eq!(plane.expressions()[1], "mu(1 - x^2)y - x");
    }

    #[test]
    fn switching_dimension_resets_axes_but_keeps_horizons() {
        let mut plane = WasmPhasePlane::try_default(2).expect("2D default");
        plane.try_set_horizons(8.0, -3.0).expect("finite horizons");
        plane
            .try_set_system(1, vec!["-x".to_string()], Vec::new(), Vec::new())
            .expect("valid system");
        assert_eq!(plane.view.axes_limits, vec![AxisRange::new(-5.0, 5.0)]);
        assert_eq!((plane.view.t_f, plane.view.t_r), (8.0, -3.0));
        assert!(plane.try_set_horizons(f64::NAN, 1.0).is_err());
    }

    #[test]
    fn axes_limits_are_validated() {
        let mut plane = WasmPhasePlane::try_default(2).expect("2D default");
        assert!(plane
            .try_set_axes_limits(vec![AxisRange::new(-1.0, 1.0)])
            .is_err());
        assert!(plane
            .try_set_axes_limits(vec![AxisRange::new(1.0, -1.0), AxisRange::new(-1.0, 1.0)])
            .is_err());
        plane
            .try_set_axes_limits(vec![AxisRange::new(-2.0, 2.0); 2])
            .expect("valid limits");
        assert_eq!(plane.view.axes_limits[0], AxisRange::new(-2.0, 2.0));
    }
}
