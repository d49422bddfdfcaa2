//! Reconnaissance Agent
//!
//! Page-structure extraction sits behind the `PageDriver` trait; the
//! agent only owns the retry policy and the element caps. How the
//! structure is produced (headless browser, recorded fixture) is the
//! driver's business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use testops_core::error::{CopilotError, CopilotResult};

/// Element lists are capped to keep prompts and checkpoints bounded.
const MAX_ELEMENTS: usize = 50;

/// A clickable element on the page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageButton {
    pub text: String,
    pub selector: String,
    pub visible: bool,
}

/// An input field on the page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageInput {
    pub name: String,
    pub input_type: String,
    pub selector: String,
    pub visible: bool,
}

/// A hyperlink on the page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageLink {
    pub text: String,
    pub href: String,
    pub visible: bool,
}

/// Structure of one analyzed page.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PageStructure {
    pub title: String,
    pub url: String,
    pub buttons: Vec<PageButton>,
    pub inputs: Vec<PageInput>,
    pub links: Vec<PageLink>,
    /// Recommended selector per element key, preferring
    /// data-testid > id > class.
    pub selectors: HashMap<String, String>,
}

impl PageStructure {
    /// Apply the element caps in place.
    fn truncate(&mut self) {
        self.buttons.truncate(MAX_ELEMENTS);
        self.inputs.truncate(MAX_ELEMENTS);
        self.links.truncate(MAX_ELEMENTS);
    }
}

/// Pick the strongest selector available for an element.
pub fn preferred_selector(
    testid: Option<&str>,
    id: Option<&str>,
    class: Option<&str>,
) -> Option<String> {
    if let Some(testid) = testid {
        return Some(format!("[data-testid=\"{testid}\"]"));
    }
    if let Some(id) = id {
        return Some(format!("#{id}"));
    }
    class.map(|c| format!(".{c}"))
}

/// Source of page structures.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn fetch_page(&self, url: &str, timeout: Duration) -> CopilotResult<PageStructure>;
}

/// Reconnaissance agent: drives a `PageDriver` with the stage retry
/// policy (fixed pause between attempts).
pub struct ReconnaissanceAgent {
    driver: Arc<dyn PageDriver>,
    max_retries: u32,
    timeout: Duration,
    retry_delay: Duration,
}

impl ReconnaissanceAgent {
    pub fn new(driver: Arc<dyn PageDriver>, max_retries: u32, timeout: Duration) -> Self {
        Self {
            driver,
            max_retries,
            timeout,
            retry_delay: Duration::from_secs(2),
        }
    }

    /// Shorter pause for tests.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Analyze a page, retrying transient driver failures.
    pub async fn analyze_page(&self, url: &str) -> CopilotResult<PageStructure> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.driver.fetch_page(url, self.timeout).await {
                Ok(mut structure) => {
                    structure.truncate();
                    info!(
                        "Reconnaissance of {url} found {} buttons, {} inputs, {} links",
                        structure.buttons.len(),
                        structure.inputs.len(),
                        structure.links.len()
                    );
                    return Ok(structure);
                }
                Err(e) if e.is_transient() && attempt <= self.max_retries => {
                    warn!("Reconnaissance attempt {attempt} for {url} failed: {e}, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    debug!("Reconnaissance of {url} gave up after {attempt} attempts");
                    return Err(e);
                }
            }
        }
    }
}

/// Scripted driver for tests: returns queued outcomes in FIFO order.
pub struct ScriptedDriver {
    outcomes: Mutex<VecDeque<CopilotResult<PageStructure>>>,
    calls: Mutex<u32>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            calls: Mutex::new(0),
        }
    }

    pub fn push_page(&self, page: PageStructure) {
        self.outcomes.lock().unwrap().push_back(Ok(page));
    }

    pub fn push_timeout(&self) {
        self.outcomes
            .lock()
            .unwrap()
            .push_back(Err(CopilotError::Transient("page load timeout".into())));
    }

    pub fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }

    /// A small login page used across tests.
    pub fn login_page(url: &str) -> PageStructure {
        let mut selectors = HashMap::new();
        selectors.insert(
            "login-button".to_string(),
            "[data-testid=\"login-button\"]".to_string(),
        );
        PageStructure {
            title: "Login".to_string(),
            url: url.to_string(),
            buttons: vec![PageButton {
                text: "Sign in".to_string(),
                selector: "[data-testid=\"login-button\"]".to_string(),
                visible: true,
            }],
            inputs: vec![
                PageInput {
                    name: "username".to_string(),
                    input_type: "text".to_string(),
                    selector: "[data-testid=\"username-input\"]".to_string(),
                    visible: true,
                },
                PageInput {
                    name: "password".to_string(),
                    input_type: "password".to_string(),
                    selector: "[data-testid=\"password-input\"]".to_string(),
                    visible: true,
                },
            ],
            links: vec![PageLink {
                text: "Forgot password".to_string(),
                href: "/reset".to_string(),
                visible: true,
            }],
            selectors,
        }
    }
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageDriver for ScriptedDriver {
    async fn fetch_page(&self, url: &str, _timeout: Duration) -> CopilotResult<PageStructure> {
        *self.calls.lock().unwrap() += 1;
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Self::login_page(url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(driver: Arc<ScriptedDriver>) -> ReconnaissanceAgent {
        ReconnaissanceAgent::new(driver, 2, Duration::from_secs(60))
            .with_retry_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_analyze_page_returns_structure() {
        let driver = Arc::new(ScriptedDriver::new());
        let structure = agent(driver)
            .analyze_page("https://example.com/login")
            .await
            .unwrap();

        assert_eq!(structure.title, "Login");
        assert_eq!(structure.inputs.len(), 2);
        assert!(structure.selectors.contains_key("login-button"));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.push_timeout();
        driver.push_page(ScriptedDriver::login_page("https://example.com"));

        let structure = agent(driver.clone())
            .analyze_page("https://example.com")
            .await
            .unwrap();
        assert_eq!(structure.title, "Login");
        assert_eq!(driver.call_count(), 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_transient() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.push_timeout();
        driver.push_timeout();
        driver.push_timeout();

        let err = agent(driver.clone())
            .analyze_page("https://example.com")
            .await
            .unwrap_err();
        assert!(err.is_transient());
        // Initial attempt plus two retries.
        assert_eq!(driver.call_count(), 3);
    }

    #[tokio::test]
    async fn test_element_lists_capped() {
        let driver = Arc::new(ScriptedDriver::new());
        let mut page = ScriptedDriver::login_page("https://example.com");
        page.links = (0..80)
            .map(|i| PageLink {
                text: format!("link {i}"),
                href: format!("/page/{i}"),
                visible: true,
            })
            .collect();
        driver.push_page(page);

        let structure = agent(driver)
            .analyze_page("https://example.com")
            .await
            .unwrap();
        assert_eq!(structure.links.len(), 50);
    }

    #[test]
    fn test_selector_preference_order() {
        assert_eq!(
            preferred_selector(Some("submit"), Some("btn"), Some("primary")),
            Some("[data-testid=\"submit\"]".to_string())
        );
        assert_eq!(
            preferred_selector(None, Some("btn"), Some("primary")),
            Some("#btn".to_string())
        );
        assert_eq!(
            preferred_selector(None, None, Some("primary")),
            Some(".primary".to_string())
        );
        assert_eq!(preferred_selector(None, None, None), None);
    }
}
