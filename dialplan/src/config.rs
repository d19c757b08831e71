use std::{fs, path::Path, time::Duration};

use anyhow::Result;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/nebula/dialplan.conf";

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// Most interpreter loops allowed to run at once.
    pub max_calls: Option<usize>,
    /// Refuse new calls while the one minute load average is above this.
    pub max_load: Option<f64>,
    pub response_timeout_ms: u64,
    pub digit_timeout_ms: u64,
    /// Byte bound on one substitution result. Longer output is truncated.
    pub substitution_limit: usize,
    pub max_include_depth: usize,
    /// End the call when an extension runs out of priorities instead of
    /// waiting for more digits.
    pub autofallthrough: bool,
    pub system_name: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_calls: None,
            max_load: None,
            response_timeout_ms: 10_000,
            digit_timeout_ms: 5_000,
            substitution_limit: 8192,
            max_include_depth: 128,
            autofallthrough: false,
            system_name: None,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Config> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn digit_timeout(&self) -> Duration {
        Duration::from_millis(self.digit_timeout_ms)
    }
}
