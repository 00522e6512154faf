//! CLI command implementations for `tollgate`.
//!
//! - [`serve`] -- Run the proxy server.
//! - [`config_cmd`] -- Show and validate configuration.
//! - [`policy`] -- List policies and dry-run tool calls against them.

pub mod config_cmd;
pub mod policy;
pub mod serve;

use std::path::{Path, PathBuf};

use anyhow::Context;
use tollgate_types::config::Config;

/// Load configuration from the given path override or via auto-discovery.
///
/// Discovery order: `--config`, then `TOLLGATE_CONFIG`, then
/// `~/.tollgate/config.json`. Returns the default config when no file is
/// found.
pub fn load_config(config_override: Option<&Path>) -> anyhow::Result<(Config, Option<PathBuf>)> {
    tollgate_types::config::load_config(config_override).context("failed to load config")
}
