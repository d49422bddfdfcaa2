//! Validator Agent
//!
//! Classifies each generated test independently through four ordered
//! layers: syntax, semantic (Allure metadata + assertions), logic, and
//! the Safety Guard. A batch is validated in parallel up to the
//! configured fan-out; results always follow input order, and a single
//! bad test never rejects the batch.

pub mod safety_guard;

use futures::stream::{self, StreamExt};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use testops_core::models::{RiskLevel, ValidationStatus};
use testops_core::parsing::PythonAst;

pub use safety_guard::{SafetyFinding, SafetyGuard, SafetyVerdict, SandboxLayer};

const SEMANTIC_PENALTY: i32 = 30;
const LOGIC_PENALTY: i32 = 20;
const PASS_SCORE_FLOOR: i32 = 50;

/// How deep to validate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationLevel {
    Syntax,
    Semantic,
    Full,
}

impl ValidationLevel {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "syntax" => Some(ValidationLevel::Syntax),
            "semantic" => Some(ValidationLevel::Semantic),
            "full" => Some(ValidationLevel::Full),
            _ => None,
        }
    }
}

/// Full validation result for one test.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidationReport {
    pub status: ValidationStatus,
    pub score: i32,
    pub syntax_errors: Vec<String>,
    pub semantic_issues: Vec<String>,
    pub logic_issues: Vec<String>,
    pub safety: SafetyVerdict,
    /// Whether all required metadata decorators are present.
    pub metadata_present: bool,
    /// Structural hash, present when the source parsed.
    pub ast_hash: Option<String>,
}

impl ValidationReport {
    /// All issue messages in layer order: syntax, semantic, logic,
    /// safety. Stable across runs for identical input.
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        issues.extend(self.syntax_errors.iter().cloned());
        issues.extend(self.semantic_issues.iter().cloned());
        issues.extend(self.logic_issues.iter().cloned());
        issues.extend(self.safety.issues());
        issues
    }

    /// Tests that survive validation move on to the optimizer.
    pub fn survives(&self) -> bool {
        self.status != ValidationStatus::Failed
    }
}

fn assertion_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\bassert\s|\bexpect\s*\()").unwrap())
}

fn while_true_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"while\s+True\s*:").unwrap())
}

fn decorator_regex(name: &str) -> Regex {
    Regex::new(&format!(r"@allure\.{name}\s*\(")).expect("decorator pattern must compile")
}

/// Validator over the Safety Guard.
pub struct ValidatorAgent {
    guard: Arc<SafetyGuard>,
    fanout: usize,
}

impl ValidatorAgent {
    pub fn new(fanout: usize) -> Self {
        Self {
            guard: Arc::new(SafetyGuard::new()),
            fanout: fanout.max(1),
        }
    }

    pub fn with_guard(guard: Arc<SafetyGuard>, fanout: usize) -> Self {
        Self {
            guard,
            fanout: fanout.max(1),
        }
    }

    /// Validate one test source at the requested level.
    pub fn validate(&self, test_code: &str, level: ValidationLevel) -> ValidationReport {
        let mut score: i32 = 100;
        let mut syntax_errors = Vec::new();
        let mut semantic_issues = Vec::new();
        let mut logic_issues = Vec::new();

        let ast = PythonAst::parse(test_code).ok();
        let parse_ok = ast.as_ref().map(|a| !a.has_syntax_errors()).unwrap_or(false);
        let ast_hash = if parse_ok {
            ast.as_ref().map(|a| a.ast_hash())
        } else {
            None
        };

        // Layer 1: syntax. A failed parse ends validation with a
        // warning; the remaining layers never see unparseable code.
        if !parse_ok {
            syntax_errors.push("Source could not be parsed as Python".to_string());
            return ValidationReport {
                status: ValidationStatus::Warning,
                score: 0,
                syntax_errors,
                semantic_issues,
                logic_issues,
                safety: self.empty_verdict(),
                metadata_present: false,
                ast_hash: None,
            };
        }

        if level == ValidationLevel::Syntax {
            return ValidationReport {
                status: ValidationStatus::Passed,
                score,
                syntax_errors,
                semantic_issues,
                logic_issues,
                safety: self.empty_verdict(),
                metadata_present: false,
                ast_hash,
            };
        }

        // Layer 2: semantic. Missing metadata and assertions are
        // warnings, never hard errors; the generator is expected to
        // inject them and a stylistic omission must not sink a test.
        let mut metadata_present = true;
        for decorator in ["feature", "story", "title"] {
            if !decorator_regex(decorator).is_match(test_code) {
                semantic_issues.push(format!("Missing @allure.{decorator} decorator"));
                metadata_present = false;
                score -= SEMANTIC_PENALTY;
            }
        }
        let has_tag = decorator_regex("tag").is_match(test_code)
            || decorator_regex("severity").is_match(test_code);
        if !has_tag {
            semantic_issues.push("Missing @allure.tag or @allure.severity decorator".to_string());
            metadata_present = false;
            score -= SEMANTIC_PENALTY;
        }
        if !assertion_regex().is_match(test_code) {
            semantic_issues.push("Test contains no assertion".to_string());
            score -= SEMANTIC_PENALTY;
        }

        if level == ValidationLevel::Semantic {
            let status = Self::status_for(score, &syntax_errors, metadata_present, RiskLevel::Safe);
            return ValidationReport {
                status,
                score: score.max(0),
                syntax_errors,
                semantic_issues,
                logic_issues,
                safety: self.empty_verdict(),
                metadata_present,
                ast_hash,
            };
        }

        // Layer 3: logic.
        if while_true_regex().is_match(test_code) && !test_code.contains("break") {
            logic_issues.push("while True loop without break".to_string());
            score -= LOGIC_PENALTY;
        }
        if test_code.contains("time.sleep") {
            logic_issues.push("Sleep-based synchronization; use explicit waits".to_string());
            score -= LOGIC_PENALTY;
        }

        // Layer 4: Safety Guard.
        let safety = self.guard.validate(test_code, ast.as_ref());
        if safety.risk_level.is_blocking() {
            score = 0;
        }

        let status = Self::status_for(score, &syntax_errors, metadata_present, safety.risk_level);
        debug!(
            "Validation: status={} score={} risk={}",
            status.as_str(),
            score.max(0),
            safety.risk_level.as_str()
        );

        ValidationReport {
            status,
            score: score.max(0),
            syntax_errors,
            semantic_issues,
            logic_issues,
            safety,
            metadata_present,
            ast_hash,
        }
    }

    /// Validate a batch in parallel with bounded fan-out. Output order
    /// matches input order regardless of completion order.
    pub async fn validate_batch(&self, codes: &[String]) -> Vec<ValidationReport> {
        stream::iter(codes.iter().cloned().collect::<Vec<_>>())
            .map(|code| {
                let agent = self.clone_for_task();
                async move { agent.validate(&code, ValidationLevel::Full) }
            })
            .buffered(self.fanout)
            .collect()
            .await
    }

    fn clone_for_task(&self) -> ValidatorAgent {
        ValidatorAgent {
            guard: self.guard.clone(),
            fanout: self.fanout,
        }
    }

    fn empty_verdict(&self) -> SafetyVerdict {
        self.guard.validate("", None)
    }

    fn status_for(
        score: i32,
        syntax_errors: &[String],
        metadata_present: bool,
        risk: RiskLevel,
    ) -> ValidationStatus {
        if risk.is_blocking() {
            return ValidationStatus::Failed;
        }
        if syntax_errors.is_empty() && (metadata_present || score >= PASS_SCORE_FLOOR) {
            ValidationStatus::Passed
        } else {
            ValidationStatus::Warning
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testops_core::models::AuditAction;

    const GOOD_TEST: &str = r#"import allure
from playwright.sync_api import Page, expect

@allure.feature("User Authentication")
@allure.story("Login Flow")
@allure.title("Valid login succeeds")
@allure.tag("CRITICAL")
@allure.severity(allure.severity_level.CRITICAL)
def test_successful_login(page: Page):
    with allure.step("Open the login page"):
        page.goto("/login")
    assert page.url
"#;

    fn agent() -> ValidatorAgent {
        ValidatorAgent::new(8)
    }

    #[test]
    fn test_well_formed_test_passes() {
        let report = agent().validate(GOOD_TEST, ValidationLevel::Full);
        assert_eq!(report.status, ValidationStatus::Passed);
        assert_eq!(report.score, 100);
        assert!(report.metadata_present);
        assert!(report.ast_hash.is_some());
        assert_eq!(report.safety.risk_level, RiskLevel::Safe);
    }

    #[test]
    fn test_unparseable_source_is_warning_and_skips_later_layers() {
        let report = agent().validate("def broken(:\n    eval('x')\n", ValidationLevel::Full);
        assert_eq!(report.status, ValidationStatus::Warning);
        assert_eq!(report.syntax_errors.len(), 1);
        // Safety Guard never ran; the eval is not reported.
        assert_eq!(report.safety.risk_level, RiskLevel::Safe);
        assert!(report.ast_hash.is_none());
    }

    #[test]
    fn test_missing_metadata_is_warning_not_error() {
        let code = "def test_bare():\n    assert True\n";
        let report = agent().validate(code, ValidationLevel::Full);
        // 4 missing decorators at -30 each floor the score.
        assert_eq!(report.status, ValidationStatus::Warning);
        assert_eq!(report.score, 0);
        assert!(!report.metadata_present);
        assert_eq!(report.semantic_issues.len(), 4);
    }

    #[test]
    fn test_partial_metadata_can_still_pass_via_score() {
        // One missing decorator: score 70 >= 50, no syntax errors.
        let code = r#"import allure

@allure.feature("F")
@allure.story("S")
@allure.tag("NORMAL")
def test_nearly_complete():
    assert True
"#;
        let report = agent().validate(code, ValidationLevel::Full);
        assert_eq!(report.score, 70);
        assert_eq!(report.status, ValidationStatus::Passed);
        assert!(!report.metadata_present);
    }

    #[test]
    fn test_missing_assertion_penalized() {
        let code = r#"import allure

@allure.feature("F")
@allure.story("S")
@allure.title("T")
@allure.tag("NORMAL")
def test_no_assert(page):
    page.goto("/")
"#;
        let report = agent().validate(code, ValidationLevel::Full);
        assert!(report
            .semantic_issues
            .iter()
            .any(|i| i.contains("no assertion")));
        assert_eq!(report.score, 70);
        // Metadata is complete, so the test still passes.
        assert_eq!(report.status, ValidationStatus::Passed);
    }

    #[test]
    fn test_logic_warnings() {
        let code = r#"import allure
import time

@allure.feature("F")
@allure.story("S")
@allure.title("T")
@allure.tag("NORMAL")
def test_sleepy():
    while True:
        time.sleep(1)
    assert True
"#;
        let report = agent().validate(code, ValidationLevel::Full);
        assert_eq!(report.logic_issues.len(), 2);
        assert_eq!(report.score, 60);
        assert_eq!(report.status, ValidationStatus::Passed);
    }

    #[test]
    fn test_eval_fails_and_blocks() {
        let code = "def test_evil():\n    eval(\"1+1\")\n    assert True\n";
        let report = agent().validate(code, ValidationLevel::Full);
        assert_eq!(report.status, ValidationStatus::Failed);
        assert_eq!(report.score, 0);
        assert_eq!(report.safety.risk_level, RiskLevel::Critical);
        assert_eq!(report.safety.action_taken, AuditAction::Blocked);
        assert!(!report.survives());
    }

    #[test]
    fn test_medium_risk_does_not_fail() {
        let code = r#"import allure

@allure.feature("F")
@allure.story("S")
@allure.title("T")
@allure.tag("NORMAL")
def test_writes_file():
    f = open("out.txt", "w")
    assert f
"#;
        let report = agent().validate(code, ValidationLevel::Full);
        assert_eq!(report.safety.risk_level, RiskLevel::Medium);
        assert_eq!(report.status, ValidationStatus::Passed);
        assert!(report.survives());
    }

    #[test]
    fn test_syntax_level_stops_early() {
        let report = agent().validate("def test_x():\n    pass\n", ValidationLevel::Syntax);
        assert_eq!(report.status, ValidationStatus::Passed);
        assert!(report.semantic_issues.is_empty());
    }

    #[test]
    fn test_semantic_level_skips_logic_and_safety() {
        let code = "def test_x():\n    time.sleep(5)\n    assert True\n";
        let report = agent().validate(code, ValidationLevel::Semantic);
        assert!(report.logic_issues.is_empty());
        assert_eq!(report.safety.risk_level, RiskLevel::Safe);
    }

    #[test]
    fn test_determinism_of_full_report() {
        let code = "import ftplib\ndef test_x():\n    time.sleep(1)\n";
        let a = agent().validate(code, ValidationLevel::Full);
        let b = agent().validate(code, ValidationLevel::Full);
        assert_eq!(a.status, b.status);
        assert_eq!(a.score, b.score);
        assert_eq!(a.safety.risk_level, b.safety.risk_level);
        assert_eq!(a.issues(), b.issues());
    }

    #[tokio::test]
    async fn test_batch_order_follows_input_order() {
        let codes: Vec<String> = (0..20)
            .map(|i| format!("def test_case_{i}():\n    assert {i} == {i}\n"))
            .collect();
        let reports = agent().validate_batch(&codes).await;
        assert_eq!(reports.len(), 20);
        // Every report must correspond to its input slot; all parse and
        // carry distinct AST hashes in input order.
        let hashes: Vec<_> = reports.iter().map(|r| r.ast_hash.clone().unwrap()).collect();
        let mut expected = Vec::new();
        for code in &codes {
            expected.push(PythonAst::parse(code).unwrap().ast_hash());
        }
        assert_eq!(hashes, expected);
    }

    #[tokio::test]
    async fn test_batch_never_rejects_whole_batch() {
        let codes = vec![
            "def broken(:\n".to_string(),
            GOOD_TEST.to_string(),
            "def test_evil():\n    eval(\"x\")\n".to_string(),
        ];
        let reports = agent().validate_batch(&codes).await;
        assert_eq!(reports[0].status, ValidationStatus::Warning);
        assert_eq!(reports[1].status, ValidationStatus::Passed);
        assert_eq!(reports[2].status, ValidationStatus::Failed);
    }
}
