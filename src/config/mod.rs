//! Configuration Module
//!
//! Connection profiles and the profiles file they are loaded from.

pub mod loader;
pub mod profile;

pub use loader::{load_profiles, parse_profiles_content};
pub use profile::{
    expand_path, ConnectionProfile, ProfileError, TunnelDirection, DEFAULT_CONNECT_TIMEOUT_SECS,
    DEFAULT_SSH_PORT,
};
