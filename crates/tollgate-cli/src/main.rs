//! `tollgate` -- CLI binary for the tollgate LLM guardrail proxy.
//!
//! Provides the following subcommands:
//!
//! - `tollgate serve` -- Run the proxy in front of the configured providers.
//! - `tollgate config` -- Show or validate the resolved configuration.
//! - `tollgate policy` -- Inspect agent policies and dry-run tool calls.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tollgate_types::config::{Config, LogFormat};

mod commands;

/// tollgate LLM guardrail proxy.
#[derive(Parser)]
#[command(name = "tollgate", about = "tollgate LLM guardrail proxy", version)]
struct Cli {
    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path (overrides auto-discovery).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server.
    Serve(commands::serve::ServeArgs),

    /// Show or validate configuration.
    Config {
        #[command(subcommand)]
        action: ConfigCmd,
    },

    /// Inspect and dry-run tool invocation policies.
    Policy {
        #[command(subcommand)]
        action: PolicyCmd,
    },
}

/// Subcommands for `tollgate config`.
#[derive(Subcommand)]
enum ConfigCmd {
    /// Show the full resolved configuration (API keys are never printed).
    Show,

    /// Load and validate the configuration, then report the result.
    Validate,
}

/// Subcommands for `tollgate policy`.
#[derive(Subcommand)]
enum PolicyCmd {
    /// List an agent's assigned tools and policies.
    List {
        /// Agent id.
        #[arg(long)]
        agent: String,
    },

    /// Evaluate a single tool call against an agent's policies.
    Check(commands::policy::CheckArgs),
}

/// Initialise tracing. `RUST_LOG` wins; otherwise `--verbose` selects
/// `debug` and the configured level applies.
fn init_logging(verbose: bool, config: Option<&Config>) {
    let default_filter = match config {
        _ if verbose => "debug".to_owned(),
        Some(cfg) => cfg.logging.level.clone(),
        None => "info".to_owned(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let json = config.is_some_and(|cfg| cfg.logging.format == LogFormat::Json);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // `config validate` reports load failures itself.
    if let Commands::Config {
        action: ConfigCmd::Validate,
    } = cli.command
    {
        init_logging(cli.verbose, None);
        return Ok(commands::config_cmd::config_validate(cli.config.as_deref()));
    }

    let (config, path) = commands::load_config(cli.config.as_deref())?;
    init_logging(cli.verbose, Some(&config));
    if let Some(path) = &path {
        tracing::debug!(path = %path.display(), "loaded config");
    }

    let code = match cli.command {
        Commands::Serve(args) => {
            commands::serve::run(args, config).await?;
            ExitCode::SUCCESS
        }
        Commands::Config { action } => match action {
            ConfigCmd::Show => {
                commands::config_cmd::config_show(&config);
                ExitCode::SUCCESS
            }
            ConfigCmd::Validate => commands::config_cmd::config_validate(cli.config.as_deref()),
        },
        Commands::Policy { action } => match action {
            PolicyCmd::List { agent } => {
                commands::policy::policy_list(&config, &agent).await?;
                ExitCode::SUCCESS
            }
            PolicyCmd::Check(args) => commands::policy::policy_check(&config, args).await?,
        },
    };

    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_without_error() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_help_contains_binary_name() {
        let help = Cli::command().render_help().to_string();
        assert!(help.contains("tollgate"));
    }

    #[test]
    fn cli_has_all_subcommands() {
        let cmd = Cli::command();
        let sub_names: Vec<&str> = cmd.get_subcommands().map(|s| s.get_name()).collect();
        assert!(sub_names.contains(&"serve"));
        assert!(sub_names.contains(&"config"));
        assert!(sub_names.contains(&"policy"));
    }

    #[test]
    fn cli_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tollgate", "config", "show", "--verbose", "--config", "/tmp/tollgate.json",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/tollgate.json")));
    }

    #[test]
    fn cli_serve_overrides() {
        let cli = Cli::try_parse_from(["tollgate", "serve", "--host", "127.0.0.1", "--port", "8088"])
            .unwrap();
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.host.as_deref(), Some("127.0.0.1"));
                assert_eq!(args.port, Some(8088));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn cli_policy_check_parses() {
        let result = Cli::try_parse_from([
            "tollgate", "policy", "check",
            "--agent", "assistant",
            "--tool", "send_email",
            "--args", r#"{"to":"a@b.com"}"#,
            "--trusted",
        ]);
        assert!(result.is_ok());
    }

    #[test]
    fn cli_policy_check_requires_tool() {
        let result = Cli::try_parse_from(["tollgate", "policy", "check", "--agent", "assistant"]);
        assert!(result.is_err());
    }
}
