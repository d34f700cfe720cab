// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs::OpenOptions, path::Path};
use tracing::{error, warn};

pub mod output;

use output::comp::OutputConfig;

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    pub damage: DamageConfig,
    pub framebuffer: FramebufferConfig,
    pub remote: RemoteConfig,
    pub native: NativeConfig,
    /// Stored output configurations, keyed by output name.
    pub outputs: HashMap<String, OutputConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DamageConfig {
    /// Number of previous frames remembered for buffer-age based redraws.
    pub history_len: usize,
    /// Damage with more rectangles than this is collapsed to its extents.
    pub max_rects: usize,
}

impl Default for DamageConfig {
    fn default() -> Self {
        DamageConfig {
            history_len: 4,
            max_rects: 20,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FramebufferConfig {
    pub path: String,
    /// Refresh rate in mHz used when a mode change does not specify one.
    pub default_refresh: i32,
}

impl Default for FramebufferConfig {
    fn default() -> Self {
        FramebufferConfig {
            path: String::from("/dev/fb0"),
            default_refresh: 60_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub width: i32,
    pub height: i32,
    pub default_refresh: i32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            width: 1280,
            height: 720,
            default_refresh: 60_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct NativeConfig {
    /// Images that may be submitted to the host without being released yet.
    pub in_flight_slots: usize,
    pub swapchain_len: usize,
    /// Consecutive commits failing for lack of a free slot before the output
    /// is given up on.
    pub stall_limit: u32,
}

impl Default for NativeConfig {
    fn default() -> Self {
        NativeConfig {
            in_flight_slots: 8,
            swapchain_len: 3,
            stall_limit: 120,
        }
    }
}

pub fn load_config(path: Option<impl AsRef<Path>>) -> BackendConfig {
    if let Some(path) = path.as_ref() {
        let path: &Path = path.as_ref();
        if path.exists() {
            let file = match OpenOptions::new().read(true).open(path) {
                Ok(file) => file,
                Err(err) => {
                    warn!(?err, "Failed to open {}, using defaults", path.display());
                    return BackendConfig::default();
                }
            };
            match ron::de::from_reader::<_, BackendConfig>(file) {
                Ok(config) => return config,
                Err(err) => {
                    warn!(?err, "Failed to read backend config, resetting..");
                    if let Err(err) = std::fs::remove_file(path) {
                        error!(?err, "Failed to remove backend config.");
                    }
                }
            }
        }
    }

    BackendConfig::default()
}
