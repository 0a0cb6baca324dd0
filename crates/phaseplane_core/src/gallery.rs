//! Named example systems, stored as JSON.

use crate::error::{PlaneError, Result};
use crate::system::{AxisRange, ParameterSet, SystemSpec};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

pub const DEFAULT_SYSTEM_1D: &str = "Example system - sine wave";
pub const DEFAULT_SYSTEM_2D: &str = "Van der Pol's Equation";

const GALLERY_1D: &str = include_str!("../resources/gallery_1D.json");
const GALLERY_2D: &str = include_str!("../resources/gallery_2D.json");

/// One gallery record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub system_name: String,
    pub system_coords: Vec<String>,
    pub ode_expr_strings: Vec<String>,
    #[serde(default)]
    pub params: ParameterSet,
    pub t_f: f64,
    pub t_r: f64,
    pub axes_limits: Vec<AxisRange>,
}

/// Integration horizons and plot limits for a system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewSettings {
    pub t_f: f64,
    pub t_r: f64,
    /// Time axis of the `(t, x)` plot, 1D only.
    pub time_range: Option<AxisRange>,
    pub axes_limits: Vec<AxisRange>,
}

impl ViewSettings {
    pub fn for_dimension(dimension: usize) -> Self {
        Self {
            t_f: 5.0,
            t_r: -5.0,
            time_range: (dimension == 1).then(|| AxisRange::new(0.0, 10.0)),
            axes_limits: vec![AxisRange::default(); dimension],
        }
    }
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self::for_dimension(2)
    }
}

impl GalleryEntry {
    pub fn dimension(&self) -> usize {
        self.system_coords.len()
    }

    pub fn to_spec(&self) -> Result<SystemSpec> {
        let spec = SystemSpec {
            state_vars: self.system_coords.clone(),
            indep_var: crate::equation_engine::DEFAULT_INDEPENDENT_VARIABLE.to_string(),
            expressions: self.ode_expr_strings.clone(),
            params: self.params.clone(),
        };
        if !(1..=2).contains(&spec.dimension()) {
            return Err(PlaneError::UnsupportedDimension(spec.dimension()));
        }
        Ok(spec)
    }

    /// Splits `axes_limits` into the optional time axis and the state axes.
    pub fn view(&self) -> Result<ViewSettings> {
        let dim = self.dimension();
        let (time_range, axes_limits) = match (dim, self.axes_limits.as_slice()) {
            (1, [x]) => (None, vec![*x]),
            (1, [t, x]) => (Some(*t), vec![*x]),
            (2, [x, y]) => (None, vec![*x, *y]),
            (1 | 2, limits) => {
                return Err(PlaneError::Gallery(format!(
                    "`{}` has {} axis limits for a {}D system",
                    self.system_name,
                    limits.len(),
                    dim
                )))
            }
            (other, _) => return Err(PlaneError::UnsupportedDimension(other)),
        };
        for range in time_range.iter().chain(&axes_limits) {
            range.validate()?;
        }
        if !self.t_f.is_finite() || !self.t_r.is_finite() {
            return Err(PlaneError::Gallery(format!(
                "`{}` has non-finite integration horizons",
                self.system_name
            )));
        }
        Ok(ViewSettings {
            t_f: self.t_f,
            t_r: self.t_r,
            time_range,
            axes_limits,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.system_coords.len() != self.ode_expr_strings.len() {
            return Err(PlaneError::Gallery(format!(
                "`{}` has {} coordinates but {} expressions",
                self.system_name,
                self.system_coords.len(),
                self.ode_expr_strings.len()
            )));
        }
        self.to_spec()?;
        self.view()?;
        Ok(())
    }
}

/// A collection of gallery records, looked up by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Gallery {
    pub gallery: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let gallery: Gallery =
            serde_json::from_str(json).map_err(|e| PlaneError::Gallery(e.to_string()))?;
        let mut seen = HashSet::new();
        for entry in &gallery.gallery {
            if !seen.insert(entry.system_name.as_str()) {
                return Err(PlaneError::Gallery(format!(
                    "duplicate system name `{}`",
                    entry.system_name
                )));
            }
            entry.validate()?;
        }
        Ok(gallery)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read gallery file {}", path.display()))
            .map_err(|e| PlaneError::Gallery(format!("{e:#}")))?;
        Self::from_json_str(&json)
    }

    pub fn builtin_1d() -> Result<Self> {
        Self::from_json_str(GALLERY_1D)
    }

    pub fn builtin_2d() -> Result<Self> {
        Self::from_json_str(GALLERY_2D)
    }

    pub fn builtin(dimension: usize) -> Result<Self> {
        match dimension {
            1 => Self::builtin_1d(),
            2 => Self::builtin_2d(),
            other => Err(PlaneError::UnsupportedDimension(other)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&GalleryEntry> {
        self.gallery.iter().find(|entry| entry.system_name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.gallery
            .iter()
            .map(|entry| entry.system_name.as_str())
            .collect()
    }
}

/// The system shown on start-up for the given dimension.
pub fn default_system(dimension: usize) -> Result<GalleryEntry> {
    let (gallery, name) = match dimension {
        1 => (Gallery::builtin_1d()?, DEFAULT_SYSTEM_1D),
        2 => (Gallery::builtin_2d()?, DEFAULT_SYSTEM_2D),
        other => return Err(PlaneError::UnsupportedDimension(other)),
    };
    gallery
        .get(name)
        .cloned()
        .ok_or_else(|| PlaneError::Gallery(format!("missing default system `{name}`")))
}
