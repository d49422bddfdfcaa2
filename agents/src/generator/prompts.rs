//! Prompt templates for the Generator Agent
//!
//! The system prompts pin the output contract: pytest + allure sources,
//! full decorator sets, AAA structure, and `REQ-<n>` tags declaring
//! which numbered requirement a test covers.

use crate::reconnaissance::PageStructure;
use crate::generator::openapi::ApiEndpoint;
use std::fmt::Write as _;

/// Elements quoted in the prompt per category.
const PROMPT_ELEMENT_LIMIT: usize = 10;

pub const UI_SYSTEM_PROMPT: &str = r#"You are a senior QA automation engineer specializing in Playwright and Python.
Generate production-ready automated tests in the Allure TestOps as Code format.

Mandatory requirements for every test:
1. Allure decorators before each test function:
   - @allure.feature("Feature name")
   - @allure.story("User story")
   - @allure.title("Descriptive test title")
   - @allure.tag("CRITICAL|NORMAL|LOW")
   - @allure.severity(allure.severity_level.CRITICAL|NORMAL|MINOR|TRIVIAL)
   - One @allure.tag("REQ-<n>") per numbered requirement the test covers
2. Arrange-Act-Assert structure, each logical action wrapped in allure.step()
3. Prefer data-testid selectors, then id, then CSS class selectors
4. Use page.wait_for_selector() or expect().to_be_visible(); never time.sleep()
5. Manual test cases carry @allure.manual and describe their steps in the
   docstring instead of Playwright code

Output only valid Python code."#;

pub const API_SYSTEM_PROMPT: &str = r#"You are a senior QA automation engineer specializing in API testing with Python.
Generate production-ready API tests in the Allure TestOps as Code format using pytest + httpx.

Mandatory requirements for every test:
1. Allure decorators before each test function:
   - @allure.feature("API: Resource")
   - @allure.story("Operation")
   - @allure.title("Descriptive test title")
   - @allure.tag("API", "CRITICAL|NORMAL|LOW")
   - @allure.severity(allure.severity_level.CRITICAL|NORMAL|MINOR)
   - One @allure.tag("REQ-<n>") per numbered requirement the test covers
2. Cover positive responses plus validation (400/422), auth (401) and
   not-found (404) cases per endpoint
3. Assert the status code and the response structure
4. Wrap each action in allure.step()

Output only valid Python code."#;

/// User prompt for UI generation: page context, visible elements and the
/// numbered requirement list.
pub fn build_ui_prompt(url: &str, page: &PageStructure, requirements: &[String]) -> String {
    let mut prompt = String::new();

    let _ = writeln!(prompt, "Generate test cases for this web page.\n");
    let _ = writeln!(prompt, "URL: {url}");
    let _ = writeln!(prompt, "Page title: {}\n", page.title);

    let _ = writeln!(prompt, "Visible buttons:");
    for button in page.buttons.iter().filter(|b| b.visible).take(PROMPT_ELEMENT_LIMIT) {
        let _ = writeln!(prompt, "- {} (selector: {})", button.text, button.selector);
    }

    let _ = writeln!(prompt, "\nVisible inputs:");
    for input in page.inputs.iter().filter(|i| i.visible).take(PROMPT_ELEMENT_LIMIT) {
        let _ = writeln!(
            prompt,
            "- {} (type: {}, selector: {})",
            input.name, input.input_type, input.selector
        );
    }

    let _ = writeln!(prompt, "\nVisible links:");
    for link in page.links.iter().filter(|l| l.visible).take(PROMPT_ELEMENT_LIMIT) {
        let _ = writeln!(prompt, "- {} -> {}", link.text, link.href);
    }

    let _ = writeln!(prompt, "\nRequirements:");
    for (index, requirement) in requirements.iter().enumerate() {
        let _ = writeln!(prompt, "{}. {requirement}", index + 1);
    }

    let _ = writeln!(
        prompt,
        "\nCreate at least one test per requirement and tag each test with \
         @allure.tag(\"REQ-<n>\") for the zero-based requirement index it covers. \
         Cover the happy path and the main edge cases."
    );

    prompt
}

/// User prompt for API generation from parsed OpenAPI endpoints.
pub fn build_api_prompt(endpoints: &[ApiEndpoint], requirements: &[String]) -> String {
    let mut prompt = String::new();

    let _ = writeln!(prompt, "Generate API test cases for these endpoints.\n");
    for endpoint in endpoints {
        let _ = writeln!(
            prompt,
            "- {} {} — {}",
            endpoint.method, endpoint.path, endpoint.summary
        );
        for parameter in &endpoint.parameters {
            let _ = writeln!(prompt, "    param: {parameter}");
        }
    }

    if !requirements.is_empty() {
        let _ = writeln!(prompt, "\nRequirements:");
        for (index, requirement) in requirements.iter().enumerate() {
            let _ = writeln!(prompt, "{}. {requirement}", index + 1);
        }
    }

    let _ = writeln!(
        prompt,
        "\nGenerate pytest + httpx tests with full Allure decorators, tagging each \
         test with @allure.tag(\"REQ-<n>\") for the zero-based requirement index it covers."
    );

    prompt
}
