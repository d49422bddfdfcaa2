//! Safety Guard — layered static protection against dangerous code
//!
//! Four sub-layers, each contributing a risk level: static regex
//! blacklist, AST import/call analysis, behavioral file-operation
//! patterns, and an optional sandbox seam. The overall risk is the
//! maximum contribution; static and AST hard-blocks short-circuit.

use regex::RegexBuilder;
use std::sync::Arc;
use tracing::{debug, warn};

use testops_core::models::{AuditAction, RiskLevel, SecurityLayer};
use testops_core::parsing::PythonAst;

/// Regex blacklist. Any match is an immediate CRITICAL.
const CRITICAL_BLACKLIST: [&str; 13] = [
    r"\beval\s*\(",
    r"\bexec\s*\(",
    r"\bcompile\s*\(",
    r"\b__import__\s*\(",
    r"\bos\.system\s*\(",
    r"\bos\.popen\s*\(",
    r"\bsubprocess\.",
    r"\bsocket\.",
    r"\bpickle\.loads?\s*\(",
    r"\bsetattr\s*\(",
    r"\bdelattr\s*\(",
    r"\bglobals\s*\(",
    r"\blocals\s*\(",
];

/// Imports a generated test is allowed to use.
const ALLOWED_IMPORTS: [&str; 26] = [
    "pytest",
    "pytest_asyncio",
    "allure",
    "allure_commons",
    "allure_pytest",
    "playwright",
    "selenium",
    "httpx",
    "requests",
    "aiohttp",
    "json",
    "re",
    "datetime",
    "time",
    "uuid",
    "math",
    "random",
    "typing",
    "typing_extensions",
    "dataclasses",
    "enum",
    "collections",
    "functools",
    "itertools",
    "asyncio",
    "logging",
];

/// Builtins whose direct call is blocked at the AST layer.
const BLACKLISTED_BUILTINS: [&str; 4] = ["eval", "exec", "compile", "__import__"];

/// One sub-layer's contribution.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SafetyFinding {
    pub layer: SecurityLayer,
    pub risk_level: RiskLevel,
    pub issues: Vec<String>,
    pub blocked_patterns: Vec<String>,
}

/// Aggregated Safety Guard decision for one test.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SafetyVerdict {
    pub risk_level: RiskLevel,
    pub action_taken: AuditAction,
    /// One finding per sub-layer that fired, in layer order.
    pub findings: Vec<SafetyFinding>,
}

impl SafetyVerdict {
    fn from_findings(findings: Vec<SafetyFinding>) -> Self {
        let risk_level = findings
            .iter()
            .map(|f| f.risk_level)
            .max()
            .unwrap_or(RiskLevel::Safe);
        let action_taken = if risk_level.is_blocking() {
            AuditAction::Blocked
        } else if findings.is_empty() {
            AuditAction::Allowed
        } else {
            AuditAction::Warning
        };
        Self {
            risk_level,
            action_taken,
            findings,
        }
    }

    /// All issue messages, in layer order.
    pub fn issues(&self) -> Vec<String> {
        self.findings
            .iter()
            .flat_map(|f| f.issues.iter().cloned())
            .collect()
    }
}

/// Optional sandbox seam. No implementation ships; an absent sandbox
/// contributes nothing to the risk.
pub trait SandboxLayer: Send + Sync {
    fn evaluate(&self, test_code: &str) -> Option<SafetyFinding>;
}

/// The Safety Guard itself.
pub struct SafetyGuard {
    sandbox: Option<Arc<dyn SandboxLayer>>,
}

impl SafetyGuard {
    pub fn new() -> Self {
        Self { sandbox: None }
    }

    pub fn with_sandbox(sandbox: Arc<dyn SandboxLayer>) -> Self {
        Self {
            sandbox: Some(sandbox),
        }
    }

    /// Run all sub-layers over one test source. `ast` is provided by the
    /// validator when the source parsed.
    pub fn validate(&self, test_code: &str, ast: Option<&PythonAst>) -> SafetyVerdict {
        let mut findings = Vec::new();

        // Layer 1: static regex scan. Any hit is CRITICAL and final.
        if let Some(finding) = self.static_analysis(test_code) {
            warn!("Safety Guard static layer blocked test: {:?}", finding.blocked_patterns);
            findings.push(finding);
            return SafetyVerdict::from_findings(findings);
        }

        // Layer 2: AST imports and calls.
        if let Some(ast) = ast {
            if let Some(finding) = self.ast_analysis(ast) {
                let blocking = finding.risk_level.is_blocking();
                findings.push(finding);
                if blocking {
                    return SafetyVerdict::from_findings(findings);
                }
            }
        }

        // Layer 3: behavioral file-operation patterns.
        if let Some(finding) = self.behavioral_analysis(test_code) {
            findings.push(finding);
        }

        // Layer 4: sandbox, when wired in.
        if let Some(sandbox) = &self.sandbox {
            if let Some(finding) = sandbox.evaluate(test_code) {
                findings.push(finding);
            }
        }

        SafetyVerdict::from_findings(findings)
    }

    fn static_analysis(&self, test_code: &str) -> Option<SafetyFinding> {
        let mut blocked = Vec::new();
        for pattern in CRITICAL_BLACKLIST {
            let re = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("blacklist pattern must compile");
            if re.is_match(test_code) {
                blocked.push(pattern.to_string());
            }
        }

        if blocked.is_empty() {
            return None;
        }
        Some(SafetyFinding {
            layer: SecurityLayer::Static,
            risk_level: RiskLevel::Critical,
            issues: blocked
                .iter()
                .map(|p| format!("Blacklisted pattern matched: {p}"))
                .collect(),
            blocked_patterns: blocked,
        })
    }

    fn ast_analysis(&self, ast: &PythonAst) -> Option<SafetyFinding> {
        let mut issues = Vec::new();
        let mut blocked = Vec::new();
        let mut risk = RiskLevel::Safe;

        for module in ast.imports() {
            if !ALLOWED_IMPORTS.contains(&module.as_str()) {
                issues.push(format!("Forbidden import: {module}"));
                blocked.push(module);
                risk = risk.max(RiskLevel::High);
            }
        }

        for call in ast.calls() {
            if BLACKLISTED_BUILTINS.contains(&call.as_str()) {
                issues.push(format!("Forbidden function call: {call}"));
                blocked.push(call);
                risk = risk.max(RiskLevel::Critical);
            }
        }

        if issues.is_empty() {
            return None;
        }
        debug!("Safety Guard AST layer flagged: {issues:?}");
        Some(SafetyFinding {
            layer: SecurityLayer::Ast,
            risk_level: risk,
            issues,
            blocked_patterns: blocked,
        })
    }

    fn behavioral_analysis(&self, test_code: &str) -> Option<SafetyFinding> {
        let mut issues = Vec::new();

        let file_write = RegexBuilder::new(r#"open\s*\([^)]*["']w["']"#)
            .build()
            .expect("file write pattern must compile");
        if file_write.is_match(test_code) {
            issues.push("File write operation detected".to_string());
        }

        let file_delete = RegexBuilder::new(r"(os\.remove|os\.unlink|shutil\.rmtree)")
            .build()
            .expect("file delete pattern must compile");
        if file_delete.is_match(test_code) {
            issues.push("File deletion operation detected".to_string());
        }

        if issues.is_empty() {
            return None;
        }
        Some(SafetyFinding {
            layer: SecurityLayer::Behavioral,
            risk_level: RiskLevel::Medium,
            issues,
            blocked_patterns: Vec::new(),
        })
    }
}

impl Default for SafetyGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(code: &str) -> SafetyVerdict {
        let guard = SafetyGuard::new();
        let ast = PythonAst::parse(code).ok();
        guard.validate(code, ast.as_ref())
    }

    #[test]
    fn test_clean_test_is_safe() {
        let v = verdict(
            "import pytest\ndef test_ok():\n    assert 1 + 1 == 2\n",
        );
        assert_eq!(v.risk_level, RiskLevel::Safe);
        assert_eq!(v.action_taken, AuditAction::Allowed);
        assert!(v.findings.is_empty());
    }

    #[test]
    fn test_eval_anywhere_is_critical() {
        let v = verdict("def test_bad():\n    eval(\"1+1\")\n");
        assert_eq!(v.risk_level, RiskLevel::Critical);
        assert_eq!(v.action_taken, AuditAction::Blocked);
        assert_eq!(v.findings[0].layer, SecurityLayer::Static);
        assert!(!v.findings[0].blocked_patterns.is_empty());
    }

    #[test]
    fn test_subprocess_is_critical() {
        let v = verdict("import subprocess\ndef test_bad():\n    subprocess.run([\"ls\"])\n");
        assert_eq!(v.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn test_forbidden_import_is_high() {
        let v = verdict("import ftplib\ndef test_bad():\n    assert True\n");
        assert_eq!(v.risk_level, RiskLevel::High);
        assert_eq!(v.action_taken, AuditAction::Blocked);
        assert_eq!(v.findings[0].layer, SecurityLayer::Ast);
        assert!(v.findings[0].issues[0].contains("ftplib"));
    }

    #[test]
    fn test_allowed_imports_pass_ast_layer() {
        let v = verdict(
            "import pytest\nimport allure\nfrom playwright.sync_api import Page\ndef test_ok():\n    assert True\n",
        );
        assert_eq!(v.risk_level, RiskLevel::Safe);
    }

    #[test]
    fn test_file_write_is_medium_warning() {
        let v = verdict("def test_bad():\n    f = open(\"out.txt\", \"w\")\n    assert f\n");
        assert_eq!(v.risk_level, RiskLevel::Medium);
        assert_eq!(v.action_taken, AuditAction::Warning);
        assert_eq!(v.findings[0].layer, SecurityLayer::Behavioral);
    }

    #[test]
    fn test_file_delete_is_medium_warning() {
        let v = verdict("import os\ndef test_bad():\n    os.remove(\"x\")\n    assert True\n");
        assert_eq!(v.risk_level, RiskLevel::Medium);
        assert!(v.issues().iter().any(|i| i.contains("deletion")));
    }

    #[test]
    fn test_static_layer_short_circuits() {
        // eval plus a forbidden import: only the static finding remains.
        let v = verdict("import ftplib\ndef test_bad():\n    eval(\"x\")\n");
        assert_eq!(v.findings.len(), 1);
        assert_eq!(v.findings[0].layer, SecurityLayer::Static);
        assert_eq!(v.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn test_determinism() {
        let code = "import ftplib\ndef test_bad():\n    assert True\n";
        let a = verdict(code);
        let b = verdict(code);
        assert_eq!(a.risk_level, b.risk_level);
        assert_eq!(a.issues(), b.issues());
    }
}
