//! # fanout-settings
//!
//! Layered configuration for the fan-out tier.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`FanoutSettings::default()`]
//! 2. **Config file**: JSON, deep-merged over defaults
//! 3. **Environment variables**: `FANOUT_*` overrides (highest priority)
//!
//! The loaded value is validated before it is returned. There is no global
//! instance: the binary loads settings once and hands them to the server.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, resolve_settings_path};
pub use types::*;
