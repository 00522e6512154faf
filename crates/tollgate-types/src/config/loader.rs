//! Configuration file discovery and loading.
//!
//! The discovery order is:
//! 1. An explicit path (the CLI `--config` flag).
//! 2. `TOLLGATE_CONFIG` environment variable.
//! 3. `~/.tollgate/config.json`
//! 4. If none found, built-in defaults.
//!
//! Explicit and environment paths must exist; the home-directory path is
//! only used when present.

use std::path::{Path, PathBuf};

use super::Config;
use crate::error::{Result, TollgateError};

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "TOLLGATE_CONFIG";

/// Discover the config file path using the fallback chain.
///
/// Returns `None` when no candidate applies.
pub fn discover_config_path(
    explicit: Option<&Path>,
    env_value: Option<String>,
    home_dir: Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Some(env_path) = env_value.filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(env_path));
    }

    let home_path = home_dir?.join(".tollgate").join("config.json");
    home_path.exists().then_some(home_path)
}

/// Load and validate the configuration.
///
/// Returns the config together with the file it was read from (`None`
/// when running on defaults).
pub fn load_config(explicit: Option<&Path>) -> Result<(Config, Option<PathBuf>)> {
    let path = discover_config_path(
        explicit,
        std::env::var(CONFIG_ENV_VAR).ok(),
        dirs::home_dir(),
    );

    let Some(path) = path else {
        return Ok((Config::default(), None));
    };

    let config = load_config_file(&path)?;
    Ok((config, Some(path)))
}

/// Read, parse, and validate one config file.
pub fn load_config_file(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Err(TollgateError::ConfigNotFound {
            path: path.display().to_string(),
        });
    }
    let contents = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn explicit_path_wins() {
        let path = discover_config_path(
            Some(Path::new("/etc/tollgate.json")),
            Some("/from/env.json".into()),
            None,
        );
        assert_eq!(path, Some(PathBuf::from("/etc/tollgate.json")));
    }

    #[test]
    fn env_var_before_home() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".tollgate")).unwrap();
        std::fs::write(home.path().join(".tollgate/config.json"), "{}").unwrap();

        let path = discover_config_path(
            None,
            Some("/from/env.json".into()),
            Some(home.path().to_path_buf()),
        );
        assert_eq!(path, Some(PathBuf::from("/from/env.json")));
    }

    #[test]
    fn home_path_used_when_present() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".tollgate")).unwrap();
        std::fs::write(home.path().join(".tollgate/config.json"), "{}").unwrap();

        let path = discover_config_path(None, None, Some(home.path().to_path_buf()));
        assert_eq!(path, Some(home.path().join(".tollgate/config.json")));
    }

    #[test]
    fn nothing_found() {
        let home = tempfile::tempdir().unwrap();
        assert!(discover_config_path(None, None, Some(home.path().to_path_buf())).is_none());
        assert!(discover_config_path(None, Some(String::new()), None).is_none());
    }

    #[test]
    fn load_file_parses_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"server":{{"port":9443}}}}"#).unwrap();
        let cfg = load_config_file(file.path()).unwrap();
        assert_eq!(cfg.server.port, 9443);
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let err = load_config_file(Path::new("/nonexistent/tollgate.json")).unwrap_err();
        assert!(matches!(err, TollgateError::ConfigNotFound { .. }));
    }

    #[test]
    fn load_invalid_json_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        let err = load_config_file(file.path()).unwrap_err();
        assert!(matches!(err, TollgateError::Json(_)));
    }

    #[test]
    fn load_invalid_config_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"agents":[{{"id":"x"}},{{"id":"x"}}]}}"#).unwrap();
        let err = load_config_file(file.path()).unwrap_err();
        assert!(matches!(err, TollgateError::ConfigInvalid { .. }));
    }

    #[test]
    fn load_config_follows_env_var() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"server":{{"port":9555}}}}"#).unwrap();
        let env_path = file.path().to_string_lossy().into_owned();

        temp_env::with_var(CONFIG_ENV_VAR, Some(env_path.as_str()), || {
            let (cfg, path) = load_config(None).unwrap();
            assert_eq!(cfg.server.port, 9555);
            assert_eq!(path.as_deref(), Some(file.path()));
        });
    }

    #[test]
    fn load_config_env_var_must_exist() {
        temp_env::with_var(CONFIG_ENV_VAR, Some("/nonexistent/tollgate.json"), || {
            let err = load_config(None).unwrap_err();
            assert!(matches!(err, TollgateError::ConfigNotFound { .. }));
        });
    }
}
