//! TestOps Copilot Agents Module
//!
//! The pipeline agents — reconnaissance, generator, validator with its
//! Safety Guard, optimizer — and the workflow coordinator that drives a
//! request through them.

pub mod coordinator;
pub mod generator;
pub mod optimizer;
pub mod reconnaissance;
pub mod validator;

pub use coordinator::{
    OptimizationSummary, Stage, WorkflowCheckpoint, WorkflowCoordinator, CHECKPOINT_VERSION,
};
pub use generator::{
    openapi::{extract_endpoints, parse_document, ApiEndpoint},
    GeneratedBatch, GeneratedTest, GeneratorAgent,
};
pub use optimizer::{
    canonicalize_source, code_hash, cosine_similarity, OptimizationResult, OptimizerAgent,
};
pub use reconnaissance::{
    PageButton, PageDriver, PageInput, PageLink, PageStructure, ReconnaissanceAgent,
    ScriptedDriver,
};
pub use validator::{
    SafetyFinding, SafetyGuard, SafetyVerdict, SandboxLayer, ValidationLevel, ValidationReport,
    ValidatorAgent,
};
