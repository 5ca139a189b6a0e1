use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

/// Service configuration, loaded from a JSON config file.
///
/// The numeric fields deserialize as signed integers so that an
/// out-of-range value in the file clamps to its default instead of
/// failing the parse and discarding the rest of the config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// TCP port the HTTP listener binds to.
    pub port: i64,
    /// Enables verbose logging.
    pub debug: bool,
    /// Lock acquisition timeout, in seconds.
    pub timeout: i64,
    /// Capacity of every dispatcher queue.
    pub atomic_buffer: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 9000,
            debug: false,
            timeout: 5,
            atomic_buffer: 1,
        }
    }
}

impl AppConfig {
    /// Reads the config file at `path`, falling back to defaults when the
    /// file is missing or unparseable. Out-of-range values are clamped to
    /// their defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let mut config = match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => config,
                Err(err) => {
                    warn!(%err, path = %path.display(), "could not parse config file, using defaults");
                    Self::default()
                }
            },
            Err(err) => {
                warn!(%err, path = %path.display(), "could not read config file, using defaults");
                Self::default()
            }
        };
        config.normalize();
        config
    }

    fn normalize(&mut self) {
        if !(1..=65533).contains(&self.port) {
            warn!(port = self.port, "service port invalid or not specified, defaulting to 9000");
            self.port = 9000;
        }
        if self.timeout <= 0 {
            self.timeout = 5;
        }
        if self.atomic_buffer < 1 {
            warn!("atomic buffer invalid or not specified, defaulting to 1");
            self.atomic_buffer = 1;
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout as u64)
    }

    /// A config tuned for fast testing.
    ///
    /// - **timeout:** 1 second, so acquisition-timeout tests finish quickly.
    #[cfg(test)]
    pub(crate) fn for_testing() -> Self {
        Self {
            timeout: 1,
            ..Default::default()
        }
    }
}
