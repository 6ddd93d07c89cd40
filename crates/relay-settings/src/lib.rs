//! # relay-settings
//!
//! Configuration for the relay transport, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **Settings file**: `~/.relay/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `RELAY_*` overrides (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use relay_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("WebSocket port: {}", settings.transport.port);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{LoggingSettings, RelaySettings, TransportSettings};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = RelaySettings::default();
        let _path = settings_path();
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = RelaySettings::default();
        assert_eq!(settings.transport.host, "0.0.0.0");
        assert_eq!(settings.transport.port, 3001);
        assert_eq!(settings.transport.liveness_timeout_ms, 10_000);
        assert_eq!(settings.logging.level, "info");
        assert!(settings.validate().is_ok());
    }
}
