// SPDX-License-Identifier: GPL-3.0-only

/// Forces every frame to be redrawn completely, ignoring buffer ages.
pub const FULL_DAMAGE_VAR: &str = "COSMIC_OUTPUT_FULL_DAMAGE";

pub fn bool_var(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?.to_lowercase();
    Some(["1", "true", "yes", "y"].contains(&value.as_str()))
}

pub fn full_damage_forced() -> bool {
    bool_var(FULL_DAMAGE_VAR).unwrap_or(false)
}
