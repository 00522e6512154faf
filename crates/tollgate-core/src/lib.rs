//! # tollgate-core
//!
//! Guardrail engine for the tollgate LLM proxy.
//!
//! Contains the tool injector, the trust classifier, the policy evaluator,
//! the collaborator contracts (agent/tool store, policy store, tool
//! executor, interaction recorder), and the pipeline orchestrator that
//! sequences them for buffered and streaming requests.

pub mod audit;
pub mod classifier;
pub mod error;
pub mod injector;
pub mod pipeline;
pub mod policy;
pub mod retry;
pub mod store;

pub use audit::AuditDispatcher;
pub use classifier::{NoopSink, ProgressSink, TrustClassifier};
pub use error::{ExecutionError, PersistenceError, PipelineError, StoreError};
pub use injector::inject_tools;
pub use pipeline::{Pipeline, PipelineDeps, PipelineSettings, ProxyRequest, StreamItem};
pub use policy::{PolicyEvaluator, Refusal};
pub use retry::RetryConfig;
pub use store::{
    InMemoryStore, InteractionRecorder, MemoryRecorder, PolicyStore, ToolExecutor, ToolResult,
    ToolStore,
};
