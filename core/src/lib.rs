//! TestOps Copilot Core Module
//!
//! Domain model, configuration, error taxonomy, the Python AST layer and
//! the cached LLM client shared by every other crate in the workspace.

pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod parsing;

pub use config::{AppConfig, ConfigFormat, RetryPolicy, StageTimeouts};
pub use error::{CopilotError, CopilotResult};
pub use llm::{fallback_embedding, GenerateParams, LlmClient, LlmResponse, LlmSettings, LlmUsage};
pub use models::{
    AgentName, AuditAction, CaseType, CoverageAnalysis, GenerationMetric, MetricStatus, Request,
    RequestStatus, RiskLevel, SecurityAuditLog, SecurityLayer, TestCase, TestType,
    ValidationStatus,
};
pub use parsing::PythonAst;
