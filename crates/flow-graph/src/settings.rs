//! Document settings
//!
//! Labels and layout values used by structural operations. Loaded from JSON
//! with every field optional; missing fields fall back to [`defaults`].

use serde::{Deserialize, Serialize};

use crate::error::{FlowGraphError, Result};

/// Default values for document settings
pub mod defaults {
    /// Label template for synthesized tabs; `{}` is replaced by the tab number
    pub const WORKSPACE_LABEL: &str = "Flow {}";
    /// Name prefix for new subflow templates
    pub const SUBFLOW_NAME_PREFIX: &str = "Subflow";
    /// Label of the placeholder tab for nodes whose `z` is unknown
    pub const MISSING_WORKSPACE_LABEL: &str = "Missing flow";
    /// Node size used for bounding boxes
    pub const NODE_WIDTH: f64 = 100.0;
    pub const NODE_HEIGHT: f64 = 30.0;
    pub const GRID_SIZE: f64 = 20.0;
    pub const SNAP_TO_GRID: bool = true;
    /// Vertical distance between stacked subflow ports
    pub const PORT_SPACING: f64 = 55.0;
    /// Maximum number of history snapshots
    pub const HISTORY_DEPTH: usize = 100;
    /// zstd level for history snapshots
    pub const HISTORY_COMPRESSION_LEVEL: i32 = 3;
}

/// Settings for a flow document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FlowSettings {
    pub workspace_label: String,
    pub subflow_name_prefix: String,
    pub missing_workspace_label: String,
    pub node_width: f64,
    pub node_height: f64,
    pub grid_size: f64,
    pub snap_to_grid: bool,
    pub port_spacing: f64,
    pub history_depth: usize,
    pub history_compression_level: i32,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            workspace_label: defaults::WORKSPACE_LABEL.to_string(),
            subflow_name_prefix: defaults::SUBFLOW_NAME_PREFIX.to_string(),
            missing_workspace_label: defaults::MISSING_WORKSPACE_LABEL.to_string(),
            node_width: defaults::NODE_WIDTH,
            node_height: defaults::NODE_HEIGHT,
            grid_size: defaults::GRID_SIZE,
            snap_to_grid: defaults::SNAP_TO_GRID,
            port_spacing: defaults::PORT_SPACING,
            history_depth: defaults::HISTORY_DEPTH,
            history_compression_level: defaults::HISTORY_COMPRESSION_LEVEL,
        }
    }
}

impl FlowSettings {
    /// Parse settings from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(FlowGraphError::from)
    }

    /// Label for the n-th synthesized tab
    pub fn workspace_label_for(&self, n: usize) -> String {
        self.workspace_label.replacen("{}", &n.to_string(), 1)
    }

    /// Round a coordinate to the grid when snapping is on
    pub fn snap(&self, value: f64) -> f64 {
        if self.snap_to_grid && self.grid_size > 0.0 {
            (value / self.grid_size).round() * self.grid_size
        } else {
            value
        }
    }
}
