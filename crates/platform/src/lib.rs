//! Cross-platform filesystem primitives used by the build engine:
//! OS/arch detection, default store directory resolution, and the
//! recursive permission-freezing used to make published artifacts
//! immutable.

pub mod consts;
pub mod error;
pub mod immutable;
pub mod paths;
mod platform;

pub use error::{ImmutableError, PlatformError};
pub use immutable::{make_immutable, make_mutable};
pub use platform::{Arch, Os, Platform};
