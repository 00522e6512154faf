//! `tollgate config` -- display or validate the resolved configuration.
//!
//! # Examples
//!
//! ```text
//! tollgate config show
//! tollgate config validate --config ./tollgate.json
//! ```

use std::path::Path;
use std::process::ExitCode;

use tollgate_types::TollgateError;
use tollgate_types::config::Config;

/// Display the resolved configuration as formatted JSON.
///
/// API keys serialize as empty strings.
pub fn config_show(config: &Config) {
    match serde_json::to_string_pretty(config) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("error: failed to serialize config: {e}"),
    }
}

/// Load and validate the configuration, printing a one-line summary.
///
/// Exits non-zero when the file is missing, unparsable, or invalid.
pub fn config_validate(config_override: Option<&Path>) -> ExitCode {
    match validate(config_override) {
        Ok(report) => {
            println!("{report}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("config invalid: {e}");
            ExitCode::FAILURE
        }
    }
}

fn validate(config_override: Option<&Path>) -> Result<String, TollgateError> {
    let (config, path) = tollgate_types::config::load_config(config_override)?;
    let source = path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "built-in defaults".into());
    Ok(format!("config OK: {source}\n  {}", summary(&config)))
}

fn summary(config: &Config) -> String {
    let tools: usize = config.agents.iter().map(|a| a.tools.len()).sum();
    let policies: usize = config.agents.iter().map(|a| a.policies.len()).sum();
    format!(
        "{} agent(s), {tools} tool(s), {policies} policy(ies), {} mcp server(s)",
        config.agents.len(),
        config.mcp.servers.len(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_show_does_not_panic() {
        config_show(&Config::default());
    }

    #[test]
    fn summary_counts() {
        let config: Config = serde_json::from_str(
            r#"{"agents":[{"id":"a","tools":[{"name":"t"}],"policies":[]}]}"#,
        )
        .unwrap();
        assert_eq!(
            summary(&config),
            "1 agent(s), 1 tool(s), 0 policy(ies), 0 mcp server(s)"
        );
    }

    #[test]
    fn validate_missing_explicit_file() {
        let err = validate(Some(Path::new("/nonexistent/tollgate.json"))).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn validate_reports_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"agents":[{"id":"a"},{"id":"a"}]}"#).unwrap();
        let err = validate(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("duplicate agent id 'a'"));
    }

    #[test]
    fn validate_accepts_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"agents":[{"id":"a","default":true}]}"#).unwrap();
        let report = validate(Some(&path)).unwrap();
        assert!(report.starts_with("config OK: "));
        assert!(report.contains("1 agent(s)"));
    }
}
