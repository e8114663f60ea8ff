use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use crate::error::{Result, TftpError};

/// Write operation configuration (§6: writes require the target not to
/// exist; there is no `allow_overwrite` escape hatch — §4.3 always rejects
/// an existing WRQ target).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WriteConfig {
    /// Enable WRQ handling at all (disabled by default).
    pub enabled: bool,

    /// Glob patterns a WRQ filename must match to be accepted.
    /// Examples: ["*.txt", "configs/*.cfg", "firmware/device-*.bin"].
    /// Empty means no writes are allowed even if `enabled` is true.
    pub allowed_patterns: Vec<String>,
}

/// Privilege-drop configuration (§6's `user`/`group`/`umask` row).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivilegeConfig {
    /// Drop to this user after bind, if non-empty and running as root.
    pub user: String,
    /// Drop to this group after bind, if non-empty and running as root.
    pub group: String,
    /// Octal umask applied after the privilege drop, e.g. "022". Empty
    /// leaves the inherited umask untouched.
    pub umask: String,
}

impl Default for PrivilegeConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            group: String::new(),
            umask: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    /// Enable the structured audit event stream (§10.3), separate from
    /// ordinary tracing output.
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            audit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability.
    Text,
    /// JSON structured logging for SIEM ingestion.
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    pub root_dir: PathBuf,
    pub bind_addr: SocketAddr,

    /// Default template for both read and write path mapping (§4.2).
    pub filename_template: String,
    /// Per-direction override for RRQ; falls back to `filename_template`.
    pub filename_get_template: Option<String>,
    /// Per-direction override for WRQ; falls back to `filename_template`.
    pub filename_put_template: Option<String>,

    /// Maximum file size in bytes the server will serve over RRQ.
    /// 0 means unlimited.
    pub max_file_size_bytes: u64,

    pub logging: LoggingConfig,
    pub write_config: WriteConfig,
    pub privilege: PrivilegeConfig,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/snow-owl/tftp"),
            bind_addr: SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 69),
            filename_template: "{filename}".to_string(),
            filename_get_template: None,
            filename_put_template: None,
            max_file_size_bytes: 104_857_600, // 100 MB
            logging: LoggingConfig::default(),
            write_config: WriteConfig::default(),
            privilege: PrivilegeConfig::default(),
        }
    }
}

impl TftpConfig {
    pub fn get_template(&self) -> &str {
        self.filename_get_template
            .as_deref()
            .unwrap_or(&self.filename_template)
    }

    pub fn put_template(&self) -> &str {
        self.filename_put_template
            .as_deref()
            .unwrap_or(&self.filename_template)
    }
}

pub fn load_config(path: &std::path::Path) -> Result<TftpConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TftpConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Tftp(format!("invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_default_config(path: &std::path::Path) -> Result<()> {
    write_config(path, &TftpConfig::default())
}

pub fn write_config(path: &std::path::Path, config: &TftpConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Tftp(format!("failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Validate configuration before the server binds a socket and starts
/// serving. `validate_bind` additionally probes that `bind_addr` is free;
/// skipped by `--check-config` so it can run without the real port.
pub fn validate_config(config: &TftpConfig, validate_bind: bool) -> Result<()> {
    if !config.root_dir.is_absolute() {
        return Err(TftpError::Tftp(
            "root_dir must be an absolute path".to_string(),
        ));
    }

    match std::fs::metadata(&config.root_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TftpError::Tftp("root_dir must be a directory".to_string()));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TftpError::Tftp(
                "root_dir does not exist; create it or adjust config".to_string(),
            ));
        }
        Err(e) => return Err(TftpError::Io(e)),
    }

    if let Err(e) = std::fs::read_dir(&config.root_dir) {
        return Err(TftpError::Tftp(format!("root_dir is not readable: {}", e)));
    }

    if config.bind_addr.port() == 0 {
        return Err(TftpError::Tftp(
            "bind_addr port must be non-zero".to_string(),
        ));
    }

    if validate_bind {
        if let Err(e) = std::net::UdpSocket::bind(config.bind_addr) {
            return Err(TftpError::Tftp(format!("bind_addr is not available: {}", e)));
        }
    }

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            TftpError::Tftp("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(TftpError::Tftp(
                        "logging.file parent must be a directory".to_string(),
                    ));
                }
            }
            Err(e) => return Err(TftpError::Tftp(format!("logging.file parent error: {}", e))),
        }
    }

    validate_write_config(&config.write_config)?;
    validate_privilege_config(&config.privilege)?;
    Ok(())
}

pub fn validate_write_config(config: &WriteConfig) -> Result<()> {
    if config.enabled && config.allowed_patterns.is_empty() {
        return Err(TftpError::Tftp(
            "write_config.enabled is true but allowed_patterns is empty; \
            add patterns or disable writes"
                .to_string(),
        ));
    }

    for pattern in &config.allowed_patterns {
        if pattern.trim().is_empty() {
            return Err(TftpError::Tftp(
                "write_config.allowed_patterns cannot contain empty patterns".to_string(),
            ));
        }
        if pattern == "*" || pattern == "**" || pattern == "**/*" {
            return Err(TftpError::Tftp(format!(
                "write pattern '{}' is too permissive; use a specific pattern like '*.txt'",
                pattern
            )));
        }
        glob::Pattern::new(pattern)
            .map_err(|e| TftpError::Tftp(format!("invalid glob pattern '{}': {}", pattern, e)))?;
    }

    Ok(())
}

pub fn validate_privilege_config(config: &PrivilegeConfig) -> Result<()> {
    if !config.umask.is_empty() {
        u32::from_str_radix(&config.umask, 8)
            .map_err(|_| TftpError::Tftp(format!("umask '{}' is not valid octal", config.umask)))?;
    }
    Ok(())
}
