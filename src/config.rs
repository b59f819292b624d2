//! Layered configuration (A3): defaults, an optional TOML config file,
//! environment variables, then explicit bootstrap hooks — in ascending
//! precedence order.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::ScanError;

const ENV_PREFIX: &str = "SCAN_";
const DEFAULT_CONFIG_FILE_NAME: &str = "scan-device.toml";

/// Bootstrap hooks read once at controller construction (§6). These take
/// precedence over everything else because they represent the caller's
/// explicit, in-process intent rather than ambient environment state.
#[derive(Debug, Clone, Default)]
pub struct BootstrapHooks {
    pub qr_payload_path: Option<PathBuf>,
    pub autopair: bool,
    pub auto_capture_secs: Option<u64>,
    pub auto_export: bool,
    pub session_id_override: Option<String>,
}

impl BootstrapHooks {
    /// Reads the `SCAN_QR_PAYLOAD_PATH` / `SCAN_AUTOPAIR` / `SCAN_AUTO_CAPTURE_SECS`
    /// / `SCAN_AUTO_EXPORT` / `SCAN_SESSION_ID` environment variables.
    pub fn from_env() -> Self {
        Self {
            qr_payload_path: std::env::var("SCAN_QR_PAYLOAD_PATH").ok().map(PathBuf::from),
            autopair: parse_bool_env("SCAN_AUTOPAIR"),
            auto_capture_secs: std::env::var("SCAN_AUTO_CAPTURE_SECS").ok().and_then(|v| v.parse().ok()),
            auto_export: parse_bool_env("SCAN_AUTO_EXPORT"),
            session_id_override: std::env::var("SCAN_SESSION_ID").ok(),
        }
    }
}

fn parse_bool_env(key: &str) -> bool {
    std::env::var(key).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes")).unwrap_or(false)
}

#[derive(Debug, Deserialize, Default)]
struct FileSettings {
    session_root: Option<PathBuf>,
    identity_path: Option<PathBuf>,
    trust_store_path: Option<PathBuf>,
    log_filter: Option<String>,
}

/// The typed, validated settings the controller is built from (§3/A3).
#[derive(Debug, Clone)]
pub struct Settings {
    pub session_root: PathBuf,
    pub identity_path: PathBuf,
    pub trust_store_path: PathBuf,
    pub log_filter: String,
    pub bootstrap: BootstrapHooks,
}

impl Settings {
    /// Merges defaults -> optional TOML config file -> environment
    /// variables -> explicit bootstrap hooks, in that order, and validates
    /// the result once.
    pub fn load(bootstrap: BootstrapHooks) -> Result<Self, ScanError> {
        let config_dir = dirs::config_dir().unwrap_or_else(std::env::temp_dir);
        let data_dir = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);

        let mut session_root = data_dir.join("scan-device").join("sessions");
        let mut identity_path = data_dir.join("scan-device").join("identity.json");
        let mut trust_store_path = data_dir.join("scan-device").join("trust.json");
        let mut log_filter = "info,scan_device_core=info".to_string();

        let config_file_path = config_dir.join(DEFAULT_CONFIG_FILE_NAME);
        if let Ok(bytes) = std::fs::read_to_string(&config_file_path) {
            let file_settings: FileSettings = toml::from_str(&bytes)
                .map_err(|e| ScanError::Config(format!("{}: {e}", config_file_path.display())))?;
            if let Some(v) = file_settings.session_root {
                session_root = v;
            }
            if let Some(v) = file_settings.identity_path {
                identity_path = v;
            }
            if let Some(v) = file_settings.trust_store_path {
                trust_store_path = v;
            }
            if let Some(v) = file_settings.log_filter {
                log_filter = v;
            }
        }

        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}SESSION_ROOT")) {
            session_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}IDENTITY_PATH")) {
            identity_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}TRUST_STORE_PATH")) {
            trust_store_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}LOG_FILTER")) {
            log_filter = v;
        }

        let settings = Self { session_root, identity_path, trust_store_path, log_filter, bootstrap };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ScanError> {
        if self.log_filter.trim().is_empty() {
            return Err(ScanError::Config("log_filter must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_hooks_parse_bool_flags_case_insensitively() {
        std::env::set_var("SCAN_AUTOPAIR_TEST_PROBE", "TRUE");
        assert!(parse_bool_env("SCAN_AUTOPAIR_TEST_PROBE"));
        std::env::remove_var("SCAN_AUTOPAIR_TEST_PROBE");
    }

    #[test]
    fn empty_log_filter_fails_validation() {
        let settings = Settings {
            session_root: PathBuf::from("/tmp"),
            identity_path: PathBuf::from("/tmp/identity.json"),
            trust_store_path: PathBuf::from("/tmp/trust.json"),
            log_filter: "   ".to_string(),
            bootstrap: BootstrapHooks::default(),
        };
        assert!(settings.validate().is_err());
    }
}
