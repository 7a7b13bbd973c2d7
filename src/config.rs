//! Configuration precedence: CLI flag > environment variable > config file
//! (TOML, optional) > built-in default.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct FileConfig {
    db: Option<PathBuf>,
    port: Option<u16>,
    model: Option<String>,
    require_header: Option<String>,
}

/// Resolved `serve` configuration, after applying the full precedence chain.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub systemd_activation: bool,
    pub default_model: Option<String>,
    pub require_header: Option<String>,
}

impl ServeConfig {
    /// `cli` fields are `None`/`false` for anything not passed on the
    /// command line; `config_path` is the optional `--config` file.
    pub fn resolve(cli: CliOverrides, config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match config_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::Other(format!("reading {}: {e}", path.display())))?;
                toml::from_str(&text)
                    .map_err(|e| ConfigError::Other(format!("parsing {}: {e}", path.display())))?
            }
            None => FileConfig::default(),
        };

        let db_path = cli
            .db_path
            .or_else(|| std::env::var("SHELLEY_DB_PATH").ok().map(PathBuf::from))
            .or(file.db)
            .unwrap_or_else(default_db_path);

        let port = cli
            .port
            .or_else(|| std::env::var("SHELLEY_PORT").ok().and_then(|p| p.parse().ok()))
            .or(file.port)
            .unwrap_or(8000);

        let default_model = cli
            .model
            .or_else(|| std::env::var("SHELLEY_DEFAULT_MODEL").ok())
            .or(file.model);

        let require_header = cli.require_header.or(file.require_header);

        Ok(Self {
            db_path,
            port,
            systemd_activation: cli.systemd_activation,
            default_model,
            require_header,
        })
    }
}

/// What the CLI parsed directly, before env/file/default fallback.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub db_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub systemd_activation: bool,
    pub model: Option<String>,
    pub require_header: Option<String>,
}

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".shelley/shelley.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_env_and_file() {
        std::env::set_var("SHELLEY_PORT", "9001");
        let cli = CliOverrides {
            port: Some(1234),
            ..Default::default()
        };
        let resolved = ServeConfig::resolve(cli, None).unwrap();
        assert_eq!(resolved.port, 1234);
        std::env::remove_var("SHELLEY_PORT");
    }

    #[test]
    fn default_db_path_is_under_home() {
        let cli = CliOverrides::default();
        let resolved = ServeConfig::resolve(cli, None).unwrap();
        assert!(resolved.db_path.to_string_lossy().contains(".shelley"));
    }
}
