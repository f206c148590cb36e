//! # parley-settings
//!
//! Settings are loaded from three layers, lowest priority first:
//! 1. Compiled defaults ([`ParleySettings::default()`])
//! 2. `~/.parley/settings.json`, deep-merged over the defaults
//! 3. `PARLEY_*` environment variables

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_overrides, deep_merge, load_settings, load_settings_from_path, settings_path,
};
pub use types::*;
