//! Shared constants.

/// Name used to derive platform-default directories (`~/.local/share/pier`, etc).
pub const APP_NAME: &str = "pier";
