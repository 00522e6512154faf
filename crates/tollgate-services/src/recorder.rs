//! JSONL interaction recorder.
//!
//! One [`Interaction`] per line, appended. Appends are serialized so
//! concurrent records never interleave within a line.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use tollgate_core::error::PersistenceError;
use tollgate_core::store::InteractionRecorder;
use tollgate_types::Interaction;

use crate::error::Result;

/// Appends interactions to a JSONL file.
#[derive(Debug)]
pub struct JsonlRecorder {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlRecorder {
    /// Record to `path`. The file and its parent directories are created on
    /// first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// The file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record followed by a newline.
    pub async fn append(&self, interaction: &Interaction) -> Result<()> {
        let mut line = serde_json::to_string(interaction)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read every record back, skipping lines that do not parse.
    pub async fn load(&self) -> Result<Vec<Interaction>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        let mut out = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => out.push(record),
                Err(e) => warn!(line = line_no + 1, error = %e, "skipping invalid JSONL line"),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl InteractionRecorder for JsonlRecorder {
    async fn record_interaction(
        &self,
        interaction: Interaction,
    ) -> std::result::Result<(), PersistenceError> {
        self.append(&interaction)
            .await
            .map_err(|e| PersistenceError(format!("{}: {e}", self.path.display())))
    }
}
