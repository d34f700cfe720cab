// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use cosmic_output_config::{
    load_config,
    output::comp::{OutputConfig, OutputState, TransformDef},
    BackendConfig,
};
use smithay::utils::{Size, Transform};
use tracing::{debug, info};

use crate::output::{CurrentState, PendingState};

pub struct Config {
    pub backend: BackendConfig,
    pub path: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Config {
        let path = Self::find_config();
        let backend = load_config(path.as_ref());
        Config { backend, path }
    }

    fn find_config() -> Option<PathBuf> {
        let mut locations = Vec::with_capacity(3);
        if let Ok(base) = xdg::BaseDirectories::new() {
            locations.push(base.get_config_file("cosmic-output.ron"));
        }
        if let Ok(base) = xdg::BaseDirectories::with_prefix("cosmic-output") {
            locations.push(base.get_config_file("config.ron"));
        }
        locations.push(PathBuf::from("/etc/cosmic-output.ron"));

        for path in locations {
            debug!("Trying config location: {}", path.display());
            if path.exists() {
                info!("Using config at {}", path.display());
                return Some(path);
            }
        }
        None
    }
}

pub fn transform_from_config(transform: TransformDef) -> Transform {
    match transform {
        TransformDef::Normal => Transform::Normal,
        TransformDef::_90 => Transform::_90,
        TransformDef::_180 => Transform::_180,
        TransformDef::_270 => Transform::_270,
        TransformDef::Flipped => Transform::Flipped,
        TransformDef::Flipped90 => Transform::Flipped90,
        TransformDef::Flipped180 => Transform::Flipped180,
        TransformDef::Flipped270 => Transform::Flipped270,
    }
}

/// Stages `config` on top of `current`.
///
/// A disabled output only gets disabled, the rest of its configuration is
/// kept for when it is enabled again.
pub fn pending_from_config(config: &OutputConfig, current: &CurrentState) -> PendingState {
    let mut pending = PendingState::default();
    let enabled = config.enabled == OutputState::Enabled;
    if enabled != current.enabled {
        pending.set_enabled(enabled);
    }
    if !enabled {
        return pending;
    }

    let (w, h) = config.mode_size();
    let refresh = config.mode_refresh();
    let mode_differs = current.mode.map_or(true, |mode| {
        mode.size != Size::from((w, h)) || (refresh != 0 && mode.refresh != refresh)
    });
    if w > 0 && h > 0 && mode_differs {
        pending.set_custom_mode((w, h).into(), refresh);
    }

    let transform = transform_from_config(config.transform);
    if transform != current.transform {
        pending.set_transform(transform);
    }
    if config.scale != current.scale {
        pending.set_scale(config.scale);
    }
    pending
}
