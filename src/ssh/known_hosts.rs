//! Known hosts management for SSH host key verification
//!
//! A [`KnownHostsStore`] is an explicit object owned by one transport, never
//! a process-wide singleton. It reads OpenSSH `known_hosts` files and can be
//! backed by one writable file where newly accepted keys are appended.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;
use crate::config::DEFAULT_SSH_PORT;

/// Identity presented by a remote server during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub host: String,
    pub port: u16,
    /// Algorithm name as written in known_hosts (e.g. `ssh-ed25519`)
    pub key_type: String,
    /// Base64 encoded public key blob
    pub key_data: String,
    /// `SHA256:` fingerprint as printed by `ssh-keygen -l`
    pub fingerprint: String,
}

impl HostIdentity {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        key_type: impl Into<String>,
        key_data: impl Into<String>,
    ) -> Self {
        let key_data = key_data.into();
        let fingerprint = fingerprint_from_b64(&key_data);
        Self {
            host: host.into(),
            port,
            key_type: key_type.into(),
            key_data,
            fingerprint,
        }
    }

    pub fn from_public_key(host: &str, port: u16, key: &PublicKey) -> Self {
        Self::new(
            host,
            port,
            key.algorithm().as_str(),
            BASE64.encode(key.public_key_bytes()),
        )
    }

    /// Host name as written in known_hosts: `host` or `[host]:port`
    pub fn display_host(&self) -> String {
        make_key(&self.host, self.port)
    }
}

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches a stored entry
    Verified,
    /// No key of this type stored for the host
    Unknown,
    /// Key differs from the stored entry (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// Known host keys, optionally backed by a writable file
pub struct KnownHostsStore {
    /// host -> keys (several key types per host are allowed)
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    /// File that accepted keys are appended to
    path: Option<PathBuf>,
}

impl Default for KnownHostsStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl KnownHostsStore {
    /// Store that remembers accepted keys for the lifetime of the process only
    pub fn in_memory() -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Open the store used by a transport.
    ///
    /// The user's `~/.ssh/known_hosts` is consulted read-only. When
    /// `store_path` is given it is loaded (and created if missing) and every
    /// newly accepted key is appended to it.
    pub fn open(store_path: Option<&Path>) -> Result<Self, SshError> {
        let store = Self::in_memory();

        if let Some(system) = dirs::home_dir().map(|h| h.join(".ssh").join("known_hosts")) {
            if Some(system.as_path()) != store_path {
                if let Err(e) = store.load_file(&system) {
                    warn!("Failed to load {}: {}", system.display(), e);
                }
            }
        }

        match store_path {
            Some(path) => store.with_file(path),
            None => Ok(store),
        }
    }

    /// Back an existing store with a writable file, loading its entries
    pub fn with_file(mut self, path: &Path) -> Result<Self, SshError> {
        if !path.exists() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| key_file_error(path, e))?;
            }
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| key_file_error(path, e))?;
        }
        self.load_file(path)?;
        self.path = Some(path.to_path_buf());
        Ok(self)
    }

    /// Merge the entries of a known_hosts file into the store
    pub fn load_file(&self, path: &Path) -> Result<usize, SshError> {
        if !path.exists() {
            return Ok(0);
        }

        let file = fs::File::open(path).map_err(|e| key_file_error(path, e))?;
        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line.map_err(|e| key_file_error(path, e))?;
            let line = line.trim();

            // Markers (@cert-authority, @revoked) are not supported
            if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // Hashed hostnames (|1|...) cannot be matched by name
                if hostname.starts_with('|') || hostname.is_empty() {
                    continue;
                }
                hosts
                    .entry(normalize_hostname(hostname))
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        debug!(
            "Loaded {} known host entries from {} ({} unique hosts)",
            entry_count,
            path.display(),
            hosts.len()
        );
        Ok(entry_count)
    }

    /// Verify a host's identity against the stored keys
    pub fn verify(&self, identity: &HostIdentity) -> HostKeyVerification {
        let lookup_key = identity.display_host();
        let hosts = self.hosts.read();

        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown;
        };

        match entries.iter().find(|e| e.key_type == identity.key_type) {
            Some(entry) if entry.key_data == identity.key_data => {
                debug!(
                    "Host key verified for {} (type: {})",
                    lookup_key, identity.key_type
                );
                HostKeyVerification::Verified
            }
            Some(entry) => {
                let expected_fingerprint = fingerprint_from_b64(&entry.key_data);
                warn!(
                    "HOST KEY CHANGED for {} (type: {})! Expected {}, got {}",
                    lookup_key, identity.key_type, expected_fingerprint, identity.fingerprint
                );
                HostKeyVerification::Changed {
                    expected_fingerprint,
                    actual_fingerprint: identity.fingerprint.clone(),
                }
            }
            None => {
                debug!(
                    "Host {} known but no {} key stored, treating as new",
                    lookup_key, identity.key_type
                );
                HostKeyVerification::Unknown
            }
        }
    }

    /// Whether any key is stored for `host:port`
    pub fn contains(&self, host: &str, port: u16) -> bool {
        self.hosts.read().contains_key(&make_key(host, port))
    }

    /// Remember an accepted identity, appending it to the backing file
    pub fn add_identity(&self, identity: &HostIdentity) -> Result<(), SshError> {
        let lookup_key = identity.display_host();

        if let Some(path) = &self.path {
            append_to_file(path, &lookup_key, &identity.key_type, &identity.key_data)?;
        }

        self.hosts
            .write()
            .entry(lookup_key.clone())
            .or_default()
            .push(HostKeyEntry {
                key_type: identity.key_type.clone(),
                key_data: identity.key_data.clone(),
            });

        info!(
            "Added host key for {} (type: {}, {})",
            lookup_key, identity.key_type, identity.fingerprint
        );
        Ok(())
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// `[host]:22` and `host` name the same entry
fn normalize_hostname(host: &str) -> String {
    let host = host.to_lowercase();
    match host.strip_suffix(&format!("]:{}", DEFAULT_SSH_PORT)) {
        Some(stripped) => stripped.trim_start_matches('[').to_string(),
        None => host,
    }
}

/// Create lookup key for host:port
fn make_key(host: &str, port: u16) -> String {
    let host = host.to_lowercase();
    if port == DEFAULT_SSH_PORT {
        host
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// SHA256 fingerprint of a base64 key blob
pub fn fingerprint_from_b64(key_b64: &str) -> String {
    match BASE64.decode(key_b64) {
        Ok(bytes) => {
            let hash = Sha256::digest(&bytes);
            format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
        }
        Err(_) => "unknown".to_string(),
    }
}

fn append_to_file(path: &Path, host: &str, key_type: &str, key_b64: &str) -> Result<(), SshError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| key_file_error(path, e))?;

    writeln!(file, "{} {} {}", host, key_type, key_b64).map_err(|e| key_file_error(path, e))
}

fn key_file_error(path: &Path, err: std::io::Error) -> SshError {
    SshError::KeyFile(format!("{}: {}", path.display(), err))
}
