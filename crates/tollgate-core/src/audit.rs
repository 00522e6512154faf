//! Fire-and-forget audit dispatch.
//!
//! Interactions are recorded on a detached task so a slow or failing
//! recorder never delays or fails the client response.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tollgate_types::Interaction;

use crate::store::InteractionRecorder;

/// Hands finished exchanges to an [`InteractionRecorder`].
#[derive(Clone, Default)]
pub struct AuditDispatcher {
    recorder: Option<Arc<dyn InteractionRecorder>>,
}

impl AuditDispatcher {
    /// Dispatch to `recorder`.
    pub fn new(recorder: Arc<dyn InteractionRecorder>) -> Self {
        Self {
            recorder: Some(recorder),
        }
    }

    /// A dispatcher that drops every record.
    pub fn disabled() -> Self {
        Self { recorder: None }
    }

    /// Whether records go anywhere.
    pub fn is_enabled(&self) -> bool {
        self.recorder.is_some()
    }

    /// Record `interaction` in the background.
    ///
    /// The handle is only useful to tests; callers on the response path
    /// drop it.
    pub fn dispatch(&self, interaction: Interaction) -> Option<JoinHandle<()>> {
        let recorder = self.recorder.clone()?;
        Some(tokio::spawn(async move {
            let id = interaction.id;
            let agent_id = interaction.agent_id.clone();
            let status = interaction.status;
            match recorder.record_interaction(interaction).await {
                Ok(()) => debug!(%id, agent_id = %agent_id, ?status, "interaction recorded"),
                Err(e) => warn!(%id, agent_id = %agent_id, error = %e, "failed to record interaction"),
            }
        }))
    }
}

impl std::fmt::Debug for AuditDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditDispatcher")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistenceError;
    use crate::store::MemoryRecorder;
    use async_trait::async_trait;
    use serde_json::json;
    use tollgate_types::{InteractionStatus, ProviderKind, UsageTokens};

    fn interaction() -> Interaction {
        Interaction::new(
            "a1",
            ProviderKind::Anthropic,
            InteractionStatus::Completed,
            json!({"messages": []}),
            json!({"content": []}),
            UsageTokens { input: 3, output: 4 },
        )
    }

    struct FailingRecorder;

    #[async_trait]
    impl InteractionRecorder for FailingRecorder {
        async fn record_interaction(&self, _interaction: Interaction) -> Result<(), PersistenceError> {
            Err(PersistenceError("disk full".into()))
        }
    }

    #[tokio::test]
    async fn dispatch_records_in_background() {
        let recorder = Arc::new(MemoryRecorder::new());
        let audit = AuditDispatcher::new(recorder.clone());
        audit.dispatch(interaction()).unwrap().await.unwrap();
        let records = recorder.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].interaction_type, "anthropic:chat");
    }

    #[tokio::test]
    async fn recorder_failure_is_swallowed() {
        let audit = AuditDispatcher::new(Arc::new(FailingRecorder));
        let handle = audit.dispatch(interaction()).unwrap();
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn disabled_dispatches_nothing() {
        let audit = AuditDispatcher::disabled();
        assert!(!audit.is_enabled());
        assert!(audit.dispatch(interaction()).is_none());
    }
}
