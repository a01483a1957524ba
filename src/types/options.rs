//! Layout options.
//!
//! A fixed set of recognized options. Caps use `None` (or `0` on the wire)
//! for "unbounded".

use serde::{Deserialize, Serialize};
use crate::error::LayoutError;

/// Default horizontal distance between adjacent layers.
pub const DEFAULT_LAYER_SPACING: f64 = 250.0;

/// Default vertical distance between adjacent sublevel rows.
pub const DEFAULT_SUBLEVEL_SPACING: f64 = 200.0;

/// Default number of contiguous layers grouped into one level.
pub const DEFAULT_LAYERS_PER_LEVEL: u32 = 2;

/// Options controlling layer, level and coordinate assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutOptions {
    /// Horizontal distance between layers.
    pub layer_spacing: f64,
    /// Vertical distance between sublevel rows.
    pub sublevel_spacing: f64,
    /// Reorder rows inside each level by predecessor barycenter.
    pub optimize_layout: bool,
    /// Cap on distinct layers; deeper layers fold into the last one.
    pub max_layers: Option<u32>,
    /// Cap on distinct levels; deeper levels fold into the last one.
    pub max_levels: Option<u32>,
    /// Cap on nodes per sublevel.
    pub blocks_per_sublevel: Option<u32>,
    /// Number of contiguous layers that make up one level.
    pub layers_per_level: u32,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            layer_spacing: DEFAULT_LAYER_SPACING,
            sublevel_spacing: DEFAULT_SUBLEVEL_SPACING,
            optimize_layout: false,
            max_layers: None,
            max_levels: None,
            blocks_per_sublevel: None,
            layers_per_level: DEFAULT_LAYERS_PER_LEVEL,
        }
    }
}

impl LayoutOptions {
    /// Normalize wire conventions (`0` means unbounded) and validate.
    pub fn normalized(mut self) -> Result<Self, LayoutError> {
        self.max_layers = self.max_layers.filter(|&v| v > 0);
        self.max_levels = self.max_levels.filter(|&v| v > 0);
        self.blocks_per_sublevel = self.blocks_per_sublevel.filter(|&v| v > 0);
        if self.layers_per_level == 0 {
            self.layers_per_level = DEFAULT_LAYERS_PER_LEVEL;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check spacing values.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if !(self.layer_spacing.is_finite() && self.layer_spacing > 0.0) {
            return Err(LayoutError::Validation(format!(
                "layer_spacing must be positive, got {}",
                self.layer_spacing
            )));
        }
        if !(self.sublevel_spacing.is_finite() && self.sublevel_spacing > 0.0) {
            return Err(LayoutError::Validation(format!(
                "sublevel_spacing must be positive, got {}",
                self.sublevel_spacing
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_caps_mean_unbounded() {
        let options = LayoutOptions {
            max_layers: Some(0),
            max_levels: Some(3),
            blocks_per_sublevel: Some(0),
            layers_per_level: 0,
            ..LayoutOptions::default()
        }
        .normalized()
        .unwrap();

        assert_eq!(options.max_layers, None);
        assert_eq!(options.max_levels, Some(3));
        assert_eq!(options.blocks_per_sublevel, None);
        assert_eq!(options.layers_per_level, DEFAULT_LAYERS_PER_LEVEL);
    }

    #[test]
    fn test_negative_spacing_rejected() {
        let options = LayoutOptions {
            layer_spacing: -1.0,
            ..LayoutOptions::default()
        };
        assert!(matches!(options.normalized(), Err(LayoutError::Validation(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let options: LayoutOptions =
            serde_json::from_str(r#"{"optimize_layout": true}"#).unwrap();
        assert!(options.optimize_layout);
        assert_eq!(options.layer_spacing, DEFAULT_LAYER_SPACING);
    }
}
