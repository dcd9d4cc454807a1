//! The immutable policy/endpoint record every other component reads from.
//!
//! §3 names this record's fields; §1 treats its *loading* as an external
//! collaborator. This module is the concrete collaborator this workspace
//! ships so the binary in `bin/rtl-fanout` has something real to load,
//! mirroring how the teacher's `branding` crate loads its own metadata via
//! `toml` (`crates/branding/Cargo.toml`).

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// What happens when a session's bounded outbound queue is full and a new
/// buffer needs to be enqueued (§3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheFullBehaviour {
    /// Empty the queue, log, keep the session.
    DropSamples,
    /// Close the session.
    DropClient,
    /// Drop only the single new buffer.
    Ignore,
}

impl Default for CacheFullBehaviour {
    fn default() -> Self {
        Self::DropSamples
    }
}

/// The full configuration record described in §3.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_address: IpAddr,
    pub listen_port: u16,
    pub rtl_tcp_host: String,
    pub rtl_tcp_port: u16,

    pub use_ip_access_control: bool,
    pub allowed_ranges: Vec<String>,
    pub denied_ranges: Vec<String>,
    pub order_allow_deny: bool,

    pub freq_allowed_ranges: Vec<(u32, u32)>,
    pub allow_gain_set: bool,
    pub allow_sample_rate_set: bool,
    pub first_client_can_set: bool,
    pub client_cant_set_until: u64,

    pub cache_full_behaviour: CacheFullBehaviour,

    pub watchdog_interval: u64,
    pub reconnect_interval: u64,
    pub initial_sample_rate: u32,

    pub use_dsp_command: bool,
    pub dsp_command: String,
    pub debug_dsp_command: bool,

    pub log_file_path: Option<PathBuf>,

    pub setuid_on_start: bool,
    pub uid: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::from([0, 0, 0, 0]),
            listen_port: 1234,
            rtl_tcp_host: String::from("127.0.0.1"),
            rtl_tcp_port: 1235,
            use_ip_access_control: false,
            allowed_ranges: Vec::new(),
            denied_ranges: Vec::new(),
            order_allow_deny: false,
            freq_allowed_ranges: vec![(24_000_000, 1_766_000_000)],
            allow_gain_set: true,
            allow_sample_rate_set: false,
            first_client_can_set: true,
            client_cant_set_until: 0,
            cache_full_behaviour: CacheFullBehaviour::default(),
            watchdog_interval: 10,
            reconnect_interval: 5,
            initial_sample_rate: 2_048_000,
            use_dsp_command: false,
            dsp_command: String::new(),
            debug_dsp_command: false,
            log_file_path: None,
            setuid_on_start: false,
            uid: 0,
        }
    }
}

/// Failure to load a [`Config`] from disk.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl Config {
    /// Loads and parses a TOML config file, replacing the original's
    /// `__import__(config_script)` (`rtl_mus.py::main`) with a path argument.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Config;

    /// A complete, permissive [`Config`] for unit tests, mirroring the
    /// teacher's `base_module()` test fixture
    /// (`crates/daemon/src/tests/support.rs`).
    pub(crate) fn base_config() -> Config {
        Config::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_a_minimal_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtl-fanout.toml");
        std::fs::write(
            &path,
            r#"
            listen_port = 1234
            rtl_tcp_host = "127.0.0.1"
            rtl_tcp_port = 1235
            watchdog_interval = 10
            "#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.listen_port, 1234);
        assert_eq!(config.watchdog_interval, 10);
        // Fields absent from the file fall back to Config::default().
        assert_eq!(config.cache_full_behaviour, CacheFullBehaviour::DropSamples);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Config::load("/nonexistent/rtl-fanout.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
