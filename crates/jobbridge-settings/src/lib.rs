//! # jobbridge-settings
//!
//! Gateway configuration loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`GatewaySettings::default()`]
//! 2. **Settings file**: `~/.jobbridge/settings.json` or an explicit path,
//!    deep-merged over the defaults
//! 3. **Environment variables**: `JOBBRIDGE_*` overrides
//!
//! The binary applies its CLI flags on top and then calls
//! [`GatewaySettings::validate`].

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_settings,
    load_settings_from_path, settings_path,
};
pub use types::*;
