//! Generator Agent
//!
//! Turns a page structure (or OpenAPI endpoint list) plus numbered
//! requirements into raw test sources via the cached LLM client, splits
//! the response at test-function boundaries and extracts the Allure
//! metadata each test declares.

pub mod openapi;
pub mod prompts;

use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use testops_core::error::{CopilotError, CopilotResult};
use testops_core::llm::{GenerateParams, LlmClient, LlmUsage};
use testops_core::models::CaseType;

use crate::generator::openapi::ApiEndpoint;
use crate::reconnaissance::PageStructure;

/// One raw generated test before validation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GeneratedTest {
    pub name: String,
    pub code: String,
    pub case_type: CaseType,
    pub feature: Option<String>,
    pub story: Option<String>,
    pub title: Option<String>,
    pub severity: Option<String>,
    pub tags: Vec<String>,
    /// Zero-based requirement indices declared via REQ-<n> tags.
    pub covered_requirements: Vec<usize>,
    pub priority: u8,
}

/// Output of one generation stage run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GeneratedBatch {
    pub tests: Vec<GeneratedTest>,
    pub model: String,
    pub usage: Option<LlmUsage>,
    /// Transport attempts consumed across the call (and regeneration).
    pub attempts: u32,
}

fn def_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^(async\s+)?def\s+test_\w+\s*\(").unwrap())
}

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"def\s+(test_\w+)").unwrap())
}

fn feature_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"@allure\.feature\(\s*["']([^"']*)["']"#).unwrap())
}

fn story_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"@allure\.story\(\s*["']([^"']*)["']"#).unwrap())
}

fn title_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"@allure\.title\(\s*["']([^"']*)["']"#).unwrap())
}

fn severity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"@allure\.severity\(\s*allure\.severity_level\.(\w+)\s*\)").unwrap()
    })
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@allure\.tag\(([^)]*)\)").unwrap())
}

fn req_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^REQ-(\d+)$").unwrap())
}

impl GeneratedTest {
    /// Build a test record from one split source block.
    pub fn from_source(code: String) -> Self {
        let name = name_regex()
            .captures(&code)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "Generated Test".to_string());

        let case_type = if code.contains("@allure.manual") || !def_regex().is_match(&code) {
            CaseType::Manual
        } else {
            CaseType::Automated
        };

        let mut tags = Vec::new();
        for captures in tag_regex().captures_iter(&code) {
            for argument in captures[1].split(',') {
                let tag = argument.trim().trim_matches(|c| c == '"' || c == '\'');
                if !tag.is_empty() {
                    tags.push(tag.to_string());
                }
            }
        }

        let mut covered_requirements = Vec::new();
        for tag in &tags {
            if let Some(captures) = req_regex().captures(tag) {
                if let Ok(index) = captures[1].parse::<usize>() {
                    if !covered_requirements.contains(&index) {
                        covered_requirements.push(index);
                    }
                }
            }
        }

        let priority = if tags.iter().any(|t| t == "CRITICAL") {
            8
        } else if tags.iter().any(|t| t == "LOW") {
            3
        } else {
            5
        };

        let capture = |re: &Regex| {
            re.captures(&code)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        };

        Self {
            feature: capture(feature_regex()),
            story: capture(story_regex()),
            title: capture(title_regex()),
            severity: capture(severity_regex()),
            name,
            case_type,
            tags,
            covered_requirements,
            priority,
            code,
        }
    }
}

/// Generator agent over the cached LLM client.
pub struct GeneratorAgent {
    llm: Arc<LlmClient>,
}

impl GeneratorAgent {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    /// Generate UI tests from a page structure.
    pub async fn generate_ui_tests(
        &self,
        url: &str,
        page: &PageStructure,
        requirements: &[String],
    ) -> CopilotResult<GeneratedBatch> {
        let user_prompt = prompts::build_ui_prompt(url, page, requirements);
        self.generate_with_retry(prompts::UI_SYSTEM_PROMPT, &user_prompt)
            .await
    }

    /// Generate API tests from parsed OpenAPI endpoints.
    pub async fn generate_api_tests(
        &self,
        endpoints: &[ApiEndpoint],
        requirements: &[String],
    ) -> CopilotResult<GeneratedBatch> {
        let user_prompt = prompts::build_api_prompt(endpoints, requirements);
        self.generate_with_retry(prompts::API_SYSTEM_PROMPT, &user_prompt)
            .await
    }

    /// One LLM call plus a single cache-bypassing regeneration attempt
    /// when the output contains no tests.
    async fn generate_with_retry(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> CopilotResult<GeneratedBatch> {
        let response = self
            .llm
            .generate(GenerateParams {
                system_prompt: system_prompt.to_string(),
                user_prompt: user_prompt.to_string(),
                ..Default::default()
            })
            .await?;

        let mut attempts = response.attempts;
        let mut tests = split_tests(&response.content);
        let mut usage = response.usage;
        let model = response.model;

        if tests.is_empty() {
            warn!("Generator produced no tests, regenerating once without cache");
            let retry = self
                .llm
                .generate(GenerateParams {
                    system_prompt: system_prompt.to_string(),
                    user_prompt: user_prompt.to_string(),
                    use_cache: false,
                    ..Default::default()
                })
                .await?;
            attempts += retry.attempts;
            tests = split_tests(&retry.content);
            usage = retry.usage;
        }

        if tests.is_empty() {
            return Err(CopilotError::Permanent(
                "generator produced empty output".to_string(),
            ));
        }

        let tests: Vec<GeneratedTest> = tests.into_iter().map(GeneratedTest::from_source).collect();
        info!("Generated {} tests", tests.len());

        Ok(GeneratedBatch {
            tests,
            model,
            usage,
            attempts,
        })
    }
}

/// Split an LLM response into individual test sources.
///
/// Blocks start at the decorator run preceding each `def test_*`; code
/// fences are dropped. A non-empty response without any test function is
/// kept whole as a single manual test.
pub fn split_tests(content: &str) -> Vec<String> {
    let lines: Vec<&str> = content
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect();

    let def_lines: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| def_regex().is_match(line))
        .map(|(index, _)| index)
        .collect();

    if def_lines.is_empty() {
        let whole = lines.join("\n").trim().to_string();
        return if whole.is_empty() { Vec::new() } else { vec![whole] };
    }

    // Pull each block's start back over its decorator run.
    let starts: Vec<usize> = def_lines
        .iter()
        .map(|&def_line| {
            let mut start = def_line;
            while start > 0 && lines[start - 1].trim_start().starts_with('@') {
                start -= 1;
            }
            start
        })
        .collect();

    let mut blocks = Vec::new();
    for (block_index, &start) in starts.iter().enumerate() {
        let end = starts.get(block_index + 1).copied().unwrap_or(lines.len());
        let mut block = lines[start..end].join("\n").trim().to_string();
        if block.is_empty() {
            continue;
        }
        if !block.contains("import allure") {
            block = format!(
                "import allure\nfrom playwright.sync_api import Page, expect\n\n{block}"
            );
        }
        blocks.push(block);
    }

    debug!("Split response into {} test blocks", blocks.len());
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use testops_core::llm::{FakeTransport, LlmSettings};

    const TWO_TESTS: &str = r#"import allure
from playwright.sync_api import Page, expect

@allure.feature("User Authentication")
@allure.story("Login Flow")
@allure.title("Valid login succeeds")
@allure.tag("CRITICAL")
@allure.tag("REQ-0")
@allure.severity(allure.severity_level.CRITICAL)
def test_successful_login(page: Page):
    with allure.step("Open the login page"):
        page.goto("/login")
    with allure.step("Check login works"):
        assert page.url.endswith("/dashboard")

@allure.feature("User Authentication")
@allure.story("Login Flow")
@allure.title("Invalid password is rejected")
@allure.tag("NORMAL")
@allure.tag("REQ-1")
@allure.severity(allure.severity_level.NORMAL)
def test_invalid_password(page: Page):
    with allure.step("Submit a wrong password"):
        page.goto("/login")
    assert page.locator(".error-banner").is_visible()
"#;

    fn completion(content: &str) -> String {
        serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12}
        })
        .to_string()
    }

    fn agent(transport: Arc<FakeTransport>) -> GeneratorAgent {
        let settings = LlmSettings {
            retry_base_delay_ms: 1,
            ..Default::default()
        };
        GeneratorAgent::new(Arc::new(LlmClient::new(settings, transport)))
    }

    #[test]
    fn test_split_keeps_decorators_with_their_test() {
        let blocks = split_tests(TWO_TESTS);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("def test_successful_login"));
        assert!(blocks[0].contains("REQ-0"));
        assert!(!blocks[0].contains("REQ-1"));
        assert!(blocks[1].contains("def test_invalid_password"));
        assert!(blocks[1].contains("REQ-1"));
    }

    #[test]
    fn test_split_strips_code_fences() {
        let fenced = format!("```python\n{TWO_TESTS}\n```");
        let blocks = split_tests(&fenced);
        assert_eq!(blocks.len(), 2);
        assert!(!blocks[0].contains("```"));
    }

    #[test]
    fn test_split_without_functions_is_one_manual_block() {
        let blocks = split_tests("Scenario: open the page and check the title.");
        assert_eq!(blocks.len(), 1);

        let test = GeneratedTest::from_source(blocks[0].clone());
        assert_eq!(test.case_type, CaseType::Manual);
        assert_eq!(test.name, "Generated Test");
    }

    #[test]
    fn test_split_empty_content() {
        assert!(split_tests("").is_empty());
        assert!(split_tests("   \n  \n").is_empty());
    }

    #[test]
    fn test_metadata_extraction() {
        let blocks = split_tests(TWO_TESTS);
        let test = GeneratedTest::from_source(blocks[0].clone());

        assert_eq!(test.name, "test_successful_login");
        assert_eq!(test.case_type, CaseType::Automated);
        assert_eq!(test.feature.as_deref(), Some("User Authentication"));
        assert_eq!(test.story.as_deref(), Some("Login Flow"));
        assert_eq!(test.title.as_deref(), Some("Valid login succeeds"));
        assert_eq!(test.severity.as_deref(), Some("CRITICAL"));
        assert!(test.tags.contains(&"CRITICAL".to_string()));
        assert_eq!(test.covered_requirements, vec![0]);
        assert_eq!(test.priority, 8);
    }

    #[test]
    fn test_manual_decorator_forces_manual_type() {
        let source = "import allure\n@allure.manual\n@allure.feature(\"X\")\ndef test_manual_case():\n    \"\"\"Steps\"\"\"\n    pass\n";
        let test = GeneratedTest::from_source(source.to_string());
        assert_eq!(test.case_type, CaseType::Manual);
    }

    #[tokio::test]
    async fn test_generate_ui_tests_returns_batch() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_ok(&completion(TWO_TESTS));
        let agent = agent(transport);

        let page = crate::reconnaissance::ScriptedDriver::login_page("https://example.com");
        let batch = agent
            .generate_ui_tests(
                "https://example.com",
                &page,
                &["login works".to_string(), "bad password rejected".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(batch.tests.len(), 2);
        assert_eq!(batch.attempts, 1);
        assert_eq!(batch.usage.as_ref().unwrap().total_tokens, 12);
    }

    #[tokio::test]
    async fn test_empty_output_triggers_one_regeneration() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_ok(&completion(""));
        transport.push_ok(&completion(TWO_TESTS));
        let agent = agent(transport.clone());

        let page = crate::reconnaissance::ScriptedDriver::login_page("https://example.com");
        let batch = agent
            .generate_ui_tests("https://example.com", &page, &["login works".to_string()])
            .await
            .unwrap();

        assert_eq!(batch.tests.len(), 2);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_output_twice_is_permanent_failure() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_ok(&completion(""));
        transport.push_ok(&completion("   "));
        let agent = agent(transport);

        let page = crate::reconnaissance::ScriptedDriver::login_page("https://example.com");
        let err = agent
            .generate_ui_tests("https://example.com", &page, &["login works".to_string()])
            .await
            .unwrap_err();

        assert!(matches!(err, CopilotError::Permanent(_)));
    }
}
