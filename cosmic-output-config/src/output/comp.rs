// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputState {
    #[serde(rename = "true")]
    Enabled,
    #[serde(rename = "false")]
    Disabled,
}

fn default_state() -> OutputState {
    OutputState::Enabled
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct OutputConfig {
    /// `((width, height), refresh in mHz)`. A missing refresh rate lets the
    /// backend pick its default.
    pub mode: ((i32, i32), Option<u32>),
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub transform: TransformDef,
    #[serde(default = "default_state")]
    pub enabled: OutputState,
}

impl Default for OutputConfig {
    fn default() -> OutputConfig {
        OutputConfig {
            mode: ((0, 0), None),
            scale: 1.0,
            transform: TransformDef::Normal,
            enabled: OutputState::Enabled,
        }
    }
}

impl OutputConfig {
    pub fn mode_size(&self) -> (i32, i32) {
        self.mode.0
    }

    /// Refresh rate in mHz, `0` if unset.
    pub fn mode_refresh(&self) -> i32 {
        self.mode
            .1
            .and_then(|refresh| i32::try_from(refresh).ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformDef {
    #[default]
    Normal,
    _90,
    _180,
    _270,
    Flipped,
    Flipped90,
    Flipped180,
    Flipped270,
}
