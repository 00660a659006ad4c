// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller configuration, deserialized from a TOML file.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Path of the embedded cluster configuration database.
    pub database_path: Utf8PathBuf,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LogConfig {
    /// Minimum level emitted: "trace", "debug", "info", "warn", "error" or
    /// "critical".
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig { level: default_log_level() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("read config file {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        error: std::io::Error,
    },
    #[error("parse config file {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        error: toml::de::Error,
    },
}

impl Config {
    pub fn from_file(path: &Utf8Path) -> Result<Config, ConfigFileError> {
        let contents =
            std::fs::read_to_string(path).map_err(|error| {
                ConfigFileError::Io { path: path.to_owned(), error }
            })?;
        toml::from_str(&contents).map_err(|error| ConfigFileError::Parse {
            path: path.to_owned(),
            error,
        })
    }
}

#[cfg(test)]
mod test {
    use super::Config;

    #[test]
    fn test_parse() {
        let config: Config = toml::from_str(
            r#"
            database_path = "/var/lib/orr/config.db"

            [log]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.database_path, "/var/lib/orr/config.db");
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_log_defaults() {
        let config: Config =
            toml::from_str(r#"database_path = "config.db""#).unwrap();
        assert_eq!(config.log.level, "info");
    }
}
