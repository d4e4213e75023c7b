//! Support Profiles File
//!
//! Loads connection profiles from an INI-style text file:
//!
//! ```text
//! # Provider side: expose the local VNC server
//! [desktop]
//! serverHost = support.example.com
//! localSupportPort = 5900
//! tunnelDirection = reverse
//! companionExecutablePath = /usr/bin/x11vnc
//! companionArgsTemplate = -rfbport %d -localhost
//! ```
//!
//! Each `[name]` section becomes one [`ConnectionProfile`].

use std::collections::HashMap;
use std::path::Path;

use tokio::fs;
use tracing::{debug, info};

use super::profile::{ConnectionProfile, ProfileError};

/// Load profiles from disk.
///
/// A missing file yields no profiles.
pub async fn load_profiles(path: &Path) -> Result<Vec<ConnectionProfile>, ProfileError> {
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Profiles file {} not found", path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(ProfileError::Io(e)),
    };

    let profiles = parse_profiles_content(&content)?;
    info!(
        "Loaded {} support profile(s) from {}",
        profiles.len(),
        path.display()
    );
    Ok(profiles)
}

/// Parse profiles file content, keeping section order
pub fn parse_profiles_content(content: &str) -> Result<Vec<ConnectionProfile>, ProfileError> {
    let mut sections: Vec<(String, HashMap<String, String>)> = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(header) = line.strip_prefix('[') {
            let name = header
                .strip_suffix(']')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .ok_or_else(|| ProfileError::Parse {
                    line: line_no,
                    message: format!("malformed section header: {}", line),
                })?;
            if sections.iter().any(|(existing, _)| existing == name) {
                return Err(ProfileError::Parse {
                    line: line_no,
                    message: format!("duplicate section: {}", name),
                });
            }
            sections.push((name.to_string(), HashMap::new()));
            continue;
        }

        // "key = value" or "key: value", whichever separator comes first
        let sep = line
            .find(|c| c == '=' || c == ':')
            .ok_or_else(|| ProfileError::Parse {
                line: line_no,
                message: format!("expected key = value, got: {}", line),
            })?;
        let key = line[..sep].trim();
        let value = line[sep + 1..].trim();
        if key.is_empty() {
            return Err(ProfileError::Parse {
                line: line_no,
                message: "empty key".to_string(),
            });
        }

        match sections.last_mut() {
            Some((_, entries)) => {
                entries.insert(key.to_string(), value.to_string());
            }
            None => {
                return Err(ProfileError::Parse {
                    line: line_no,
                    message: format!("entry outside of a section: {}", key),
                })
            }
        }
    }

    sections
        .iter()
        .map(|(name, entries)| ConnectionProfile::parse(name, entries))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelDirection;
    use std::path::PathBuf;

    #[test]
    fn test_parse_two_profiles() {
        let content = r#"
# Provider side
[desktop]
serverHost = support.example.com
serverPort = 2222
localSupportPort = 5900
tunnelDirection = reverse
companionArgsTemplate = -rfbport %d -localhost

; Consumer side
[viewer]
serverHost: support.example.com
localSupportPort: 5500
tunnelDirection: fwd
companionExecutablePath: C:\Program Files\vnc\viewer.exe
"#;

        let profiles = parse_profiles_content(content).unwrap();
        assert_eq!(profiles.len(), 2);

        assert_eq!(profiles[0].name, "desktop");
        assert_eq!(profiles[0].server_port(), 2222);
        assert_eq!(profiles[0].tunnel_direction, TunnelDirection::Reverse);
        assert_eq!(
            profiles[0].companion_args_template.as_deref(),
            Some("-rfbport %d -localhost")
        );

        assert_eq!(profiles[1].name, "viewer");
        assert_eq!(profiles[1].tunnel_direction, TunnelDirection::Forward);
        assert_eq!(
            profiles[1].companion_executable_path,
            Some(PathBuf::from(r"C:\Program Files\vnc\viewer.exe"))
        );
    }

    #[test]
    fn test_entry_outside_section() {
        let err = parse_profiles_content("serverHost = x\n[a]\n").unwrap_err();
        assert!(matches!(err, ProfileError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_duplicate_section() {
        let content = "[a]\nserverHost=h\nlocalSupportPort=1\ntunnelDirection=f\n[a]\n";
        let err = parse_profiles_content(content).unwrap_err();
        assert!(matches!(err, ProfileError::Parse { line: 5, .. }));
    }

    #[test]
    fn test_invalid_profile_surfaces_validation_error() {
        let content = "[a]\nserverHost=h\nlocalSupportPort=5900\ntunnelDirection=sideways\n";
        assert!(matches!(
            parse_profiles_content(content),
            Err(ProfileError::InvalidTunnelDirection(_))
        ));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let profiles = load_profiles(&dir.path().join("support.ini")).await.unwrap();
        assert!(profiles.is_empty());
    }

    #[tokio::test]
    async fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("support.ini");
        std::fs::write(
            &path,
            "[desk]\nserverHost=h\nlocalSupportPort=5900\ntunnelDirection=r\n",
        )
        .unwrap();

        let profiles = load_profiles(&path).await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].local_support_port, 5900);
    }
}
