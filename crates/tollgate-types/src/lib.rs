//! # tollgate-types
//!
//! Core type definitions for the tollgate LLM guardrail proxy.
//!
//! This crate is the foundation of the dependency graph -- all other
//! tollgate crates depend on it. It contains:
//!
//! - **[`message`]** -- the provider-agnostic Common Message Model
//! - **[`tool`]** -- tool definitions as assigned to agents or declared by clients
//! - **[`policy`]** -- tool invocation policies and the per-request trust verdict
//! - **[`agent`]** -- agents the proxy operates on behalf of
//! - **[`interaction`]** -- audit records handed to the interaction store
//! - **[`provider`]** -- the set of supported upstream provider protocols
//! - **[`config`]** -- configuration schema and file discovery
//! - **[`error`]** -- [`TollgateError`]

pub mod agent;
pub mod config;
pub mod error;
pub mod interaction;
pub mod message;
pub mod policy;
pub mod provider;
pub mod secret;
pub mod tool;

pub use agent::Agent;
pub use error::{Result, TollgateError};
pub use interaction::{Interaction, InteractionStatus, UsageTokens};
pub use message::{CommonMessage, MessageOrigin, MessageUpdate, Role, ToolCall, TrustTag};
pub use policy::{Policy, PolicyAction, PolicyOperator, TrustVerdict};
pub use provider::ProviderKind;
pub use secret::SecretString;
pub use tool::ToolDefinition;
