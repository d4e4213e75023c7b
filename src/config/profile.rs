//! Connection Profile
//!
//! Describes one support session: where the SSH server is, how to
//! authenticate, which local port to expose and in which direction the
//! tunnel runs.
//!
//! A profile is validated twice:
//! - structurally when it is built ([`ConnectionProfile::parse`] /
//!   [`ConnectionProfile::validate`])
//! - at runtime right before a session uses it
//!   ([`ConnectionProfile::runtime_validate`]): path expansion, defaults and
//!   existence checks

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

/// Default SSH server port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default TCP connect timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: f64 = 7.0;

/// Profile validation errors
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Field {0} must not be empty")]
    EmptyField(String),

    #[error("Invalid port for {field}: {value:?}")]
    InvalidPort { field: String, value: String },

    #[error("Invalid tunnel direction: {0:?} (expected forward/f/fwd or reverse/r/rev)")]
    InvalidTunnelDirection(String),

    #[error("Invalid connect timeout: {0:?} (must be a number greater than zero)")]
    InvalidTimeout(String),

    #[error("Invalid boolean for {field}: {value:?}")]
    InvalidBool { field: String, value: String },

    #[error("Invalid companion executable: {} does not exist", .0.display())]
    InvalidCompanionExecutable(PathBuf),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProfileError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::Validation
    }
}

/// Direction of the support tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum TunnelDirection {
    /// Local port -> pre-agreed port on the server (the consumer side)
    Forward,
    /// Server-allocated port -> local port (the provider side)
    Reverse,
}

impl FromStr for TunnelDirection {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" | "f" | "fwd" => Ok(TunnelDirection::Forward),
            "reverse" | "r" | "rev" => Ok(TunnelDirection::Reverse),
            _ => Err(ProfileError::InvalidTunnelDirection(s.to_string())),
        }
    }
}

impl TryFrom<String> for TunnelDirection {
    type Error = ProfileError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for TunnelDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelDirection::Forward => f.write_str("forward"),
            TunnelDirection::Reverse => f.write_str("reverse"),
        }
    }
}

/// Support session connection profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    /// Profile name (section name in the profiles file)
    pub name: String,

    /// SSH server host name or address
    pub server_host: String,

    /// SSH server port (default: 22, filled in by runtime validation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,

    /// Prompt the user for unknown host keys instead of rejecting them
    #[serde(default)]
    pub allow_unknown_host: bool,

    /// OpenSSH-format file storing accepted host keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_store_path: Option<PathBuf>,

    /// Login name (default: the local user)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Try keys held by the SSH agent
    #[serde(default)]
    pub allow_agent_auth: bool,

    /// Private key file used for authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_path: Option<PathBuf>,

    /// Try ~/.ssh/id_* keys
    #[serde(default)]
    pub search_default_keys: bool,

    /// Request SSH compression
    #[serde(default)]
    pub enable_compression: bool,

    /// Port of the local support service (e.g. a VNC server)
    pub local_support_port: u16,

    /// Tunnel direction
    pub tunnel_direction: TunnelDirection,

    /// Companion executable launched once the tunnel is up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub companion_executable_path: Option<PathBuf>,

    /// Companion argument template, `%d` is replaced by the local support port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub companion_args_template: Option<String>,

    /// TCP connect timeout in seconds (default: 7.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_seconds: Option<f64>,

    /// Session log file, installed by [`crate::logging::init_profile_logging`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file_path: Option<PathBuf>,
}

impl ConnectionProfile {
    /// Create a profile with the required fields, everything else unset
    pub fn new(
        name: impl Into<String>,
        server_host: impl Into<String>,
        local_support_port: u16,
        tunnel_direction: TunnelDirection,
    ) -> Self {
        Self {
            name: name.into(),
            server_host: server_host.into(),
            server_port: None,
            allow_unknown_host: false,
            host_key_store_path: None,
            username: None,
            allow_agent_auth: false,
            client_key_path: None,
            search_default_keys: false,
            enable_compression: false,
            local_support_port,
            tunnel_direction,
            companion_executable_path: None,
            companion_args_template: None,
            connect_timeout_seconds: None,
            log_file_path: None,
        }
    }

    /// Build a profile from one key/value section of a profiles file.
    ///
    /// Keys are matched case-insensitively and ignore `_` and `-`, so
    /// `serverHost`, `server_host` and `ServerHost` are equivalent.
    /// Unknown keys are ignored.
    pub fn parse(name: &str, section: &HashMap<String, String>) -> Result<Self, ProfileError> {
        let section = SectionView::new(section);

        let server_host = section.require("serverHost")?.to_string();
        let local_support_port =
            parse_port("localSupportPort", section.require("localSupportPort")?)?;
        let tunnel_direction = match section.raw("tunnelDirection") {
            Some(raw) => raw.parse::<TunnelDirection>()?,
            None => return Err(ProfileError::MissingField("tunnelDirection".to_string())),
        };

        let mut profile = Self::new(name, server_host, local_support_port, tunnel_direction);

        if let Some(value) = section.get("serverPort") {
            profile.server_port = Some(parse_port("serverPort", value)?);
        }
        if let Some(value) = section.get("connectTimeoutSeconds") {
            profile.connect_timeout_seconds = Some(parse_timeout(value)?);
        }
        if let Some(value) = section.get("allowUnknownHost") {
            profile.allow_unknown_host = parse_bool("allowUnknownHost", value)?;
        }
        if let Some(value) = section.get("allowAgentAuth") {
            profile.allow_agent_auth = parse_bool("allowAgentAuth", value)?;
        }
        if let Some(value) = section.get("searchDefaultKeys") {
            profile.search_default_keys = parse_bool("searchDefaultKeys", value)?;
        }
        if let Some(value) = section.get("enableCompression") {
            profile.enable_compression = parse_bool("enableCompression", value)?;
        }

        profile.username = section.get("username").map(str::to_string);
        profile.host_key_store_path = section.get("hostKeyStorePath").map(PathBuf::from);
        profile.client_key_path = section.get("clientKeyPath").map(PathBuf::from);
        profile.companion_executable_path = section.get("companionExecutablePath").map(PathBuf::from);
        profile.companion_args_template = section.get("companionArgsTemplate").map(str::to_string);
        profile.log_file_path = section.get("logFilePath").map(PathBuf::from);

        profile.validate()?;
        Ok(profile)
    }

    /// Structural validation
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.name.trim().is_empty() {
            return Err(ProfileError::EmptyField("name".to_string()));
        }
        if self.server_host.trim().is_empty() {
            return Err(ProfileError::EmptyField("serverHost".to_string()));
        }
        if self.local_support_port == 0 {
            return Err(ProfileError::InvalidPort {
                field: "localSupportPort".to_string(),
                value: "0".to_string(),
            });
        }
        if self.server_port == Some(0) {
            return Err(ProfileError::InvalidPort {
                field: "serverPort".to_string(),
                value: "0".to_string(),
            });
        }
        if let Some(timeout) = self.connect_timeout_seconds {
            if !timeout.is_finite() || timeout <= 0.0 {
                return Err(ProfileError::InvalidTimeout(timeout.to_string()));
            }
        }
        Ok(())
    }

    /// Validation performed right before a session uses the profile.
    ///
    /// With `expand` set, every path field gets environment and home
    /// directory expansion, unset defaults are filled in and the companion
    /// executable (if any) must exist. Applying it twice yields the same
    /// profile.
    pub fn runtime_validate(&mut self, expand: bool) -> Result<(), ProfileError> {
        if expand {
            for path in [
                &mut self.host_key_store_path,
                &mut self.client_key_path,
                &mut self.companion_executable_path,
                &mut self.log_file_path,
            ]
            .into_iter()
            .flatten()
            {
                *path = expand_path(path);
            }

            self.server_port.get_or_insert(DEFAULT_SSH_PORT);
            self.connect_timeout_seconds
                .get_or_insert(DEFAULT_CONNECT_TIMEOUT_SECS);

            if let Some(exe) = &self.companion_executable_path {
                if !exe.is_file() {
                    return Err(ProfileError::InvalidCompanionExecutable(exe.clone()));
                }
            }
        }

        self.validate()
    }

    /// Effective SSH server port
    pub fn server_port(&self) -> u16 {
        self.server_port.unwrap_or(DEFAULT_SSH_PORT)
    }

    /// Effective connect timeout in seconds
    pub fn connect_timeout_seconds(&self) -> f64 {
        self.connect_timeout_seconds
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS)
    }
}

/// Key/value section with normalized keys
struct SectionView<'a> {
    entries: HashMap<String, &'a str>,
}

impl<'a> SectionView<'a> {
    fn new(section: &'a HashMap<String, String>) -> Self {
        Self {
            entries: section
                .iter()
                .map(|(k, v)| (normalize_key(k), v.trim()))
                .collect(),
        }
    }

    fn raw(&self, field: &str) -> Option<&'a str> {
        self.entries.get(&normalize_key(field)).copied()
    }

    /// Value of a field, empty values count as unset
    fn get(&self, field: &str) -> Option<&'a str> {
        self.raw(field).filter(|v| !v.is_empty())
    }

    fn require(&self, field: &str) -> Result<&'a str, ProfileError> {
        self.get(field)
            .ok_or_else(|| ProfileError::MissingField(field.to_string()))
    }
}

/// Expand `$VAR`, `${VAR}` and a leading `~` in a path.
///
/// Unset variables are left as written.
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full_with_context_no_errors(
        &raw,
        || dirs::home_dir().map(|h| h.to_string_lossy().into_owned()),
        |var| std::env::var(var).ok(),
    );
    PathBuf::from(expanded.as_ref())
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

fn parse_port(field: &str, value: &str) -> Result<u16, ProfileError> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ProfileError::InvalidPort {
            field: field.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_timeout(value: &str) -> Result<f64, ProfileError> {
    match value.trim().parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => Ok(secs),
        _ => Err(ProfileError::InvalidTimeout(value.to_string())),
    }
}

fn parse_bool(field: &str, value: &str) -> Result<bool, ProfileError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ProfileError::InvalidBool {
            field: field.to_string(),
            value: value.to_string(),
        }),
    }
}
