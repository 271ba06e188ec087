use super::types::{Config, SessionOptions};
use crate::error::{Result, SshError};
use std::path::Path;
use tracing::{debug, warn};

/// Load host profiles from a YAML file
///
/// # Errors
///
/// Returns an error if:
/// - The configuration file does not exist
/// - The file cannot be read
/// - The YAML content is invalid or cannot be parsed
/// - The configuration fails validation (no hosts, empty hostname, missing key file)
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Err(SshError::ConfigNotFound {
            path: path.display().to_string(),
        });
    }

    // Profiles may carry passwords
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(metadata) = std::fs::metadata(path) {
            let mode = metadata.mode() & 0o777;
            if mode & 0o037 != 0 {
                warn!(
                    config_path = %path.display(),
                    permissions = format!("{mode:04o}"),
                    "Config file may contain secrets and has permissive permissions. \
                     Consider: chmod 640 {}",
                    path.display()
                );
            }
        }
    }

    let content = std::fs::read_to_string(path)?;
    let config: Config = serde_saphyr::from_str(&content)?;

    validate_config(&config)?;
    debug!(hosts = config.hosts.len(), path = %path.display(), "Configuration loaded");

    Ok(config)
}

fn validate_config(config: &Config) -> Result<()> {
    if config.hosts.is_empty() {
        return Err(SshError::ConfigInvalid {
            field: "hosts".to_string(),
            reason: "At least one host must be defined".to_string(),
        });
    }

    for (name, host) in &config.hosts {
        if host.hostname.is_empty() {
            return Err(SshError::ConfigInvalid {
                field: format!("hosts.{name}.hostname"),
                reason: "Hostname cannot be empty".to_string(),
            });
        }

        validate_session_options(&format!("hosts.{name}.session"), &host.session)?;
    }

    Ok(())
}

/// Check a set of session options for values that can never work.
///
/// # Errors
///
/// Returns [`SshError::ConfigInvalid`] naming the offending field under `prefix`.
pub fn validate_session_options(prefix: &str, options: &SessionOptions) -> Result<()> {
    if options.port == 0 {
        return Err(SshError::ConfigInvalid {
            field: format!("{prefix}.port"),
            reason: "Port cannot be 0".to_string(),
        });
    }

    if options.user.as_deref().is_some_and(str::is_empty) {
        return Err(SshError::ConfigInvalid {
            field: format!("{prefix}.user"),
            reason: "User cannot be empty".to_string(),
        });
    }

    if options.passphrase.is_some() && options.key.is_none() {
        return Err(SshError::ConfigInvalid {
            field: format!("{prefix}.passphrase"),
            reason: "A passphrase requires a key".to_string(),
        });
    }

    if let Some(key) = &options.key {
        let expanded = shellexpand::tilde(key);
        let key_path = Path::new(expanded.as_ref());
        if !key_path.exists() {
            return Err(SshError::ConfigInvalid {
                field: format!("{prefix}.key"),
                reason: format!("SSH key file '{key}' not found"),
            });
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if let Ok(metadata) = std::fs::metadata(key_path) {
                let mode = metadata.mode() & 0o777;
                if mode & 0o077 != 0 {
                    return Err(SshError::ConfigInvalid {
                        field: format!("{prefix}.key"),
                        reason: format!(
                            "SSH key file '{key}' has permissions {mode:04o}; expected 0600. \
                             Fix with: chmod 600 {key}"
                        ),
                    });
                }
            }
        }
    }

    Ok(())
}

/// Get the default config path
#[must_use]
pub fn default_config_path() -> std::path::PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("sshmux")
        .join("config.yaml")
}
