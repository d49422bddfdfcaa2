//! Plain-HTTP page driver
//!
//! A browser-less `PageDriver` for environments without a headless
//! browser: fetches the page over HTTP and extracts structure with
//! regexes. Deployments with a real browser driver plug it in through
//! the same trait.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use testops_agents::{PageButton, PageDriver, PageInput, PageLink, PageStructure};
use testops_core::error::{CopilotError, CopilotResult};

pub struct HttpPageDriver {
    client: reqwest::Client,
}

impl HttpPageDriver {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpPageDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageDriver for HttpPageDriver {
    async fn fetch_page(&self, url: &str, timeout: Duration) -> CopilotResult<PageStructure> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| CopilotError::Transient(format!("page fetch failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CopilotError::Transient(format!(
                "page fetch returned {}",
                response.status()
            )));
        }

        let html = response
            .text()
            .await
            .map_err(|e| CopilotError::Transient(format!("page body read failed: {e}")))?;

        Ok(parse_page(&html, url))
    }
}

fn title_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap())
}

fn button_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<button([^>]*)>(.*?)</button>").unwrap())
}

fn input_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<(?:input|textarea|select)([^>]*)>").unwrap())
}

fn link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?is)<a([^>]*href\s*=[^>]*)>(.*?)</a>"#).unwrap())
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").unwrap())
}

fn attribute(attrs: &str, name: &str) -> Option<String> {
    let re = Regex::new(&format!(r#"(?i){name}\s*=\s*["']([^"']*)["']"#)).ok()?;
    re.captures(attrs).map(|c| c[1].to_string())
}

/// Extract the page structure from raw HTML.
pub fn parse_page(html: &str, url: &str) -> PageStructure {
    let title = title_regex()
        .captures(html)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default();

    let mut selectors = HashMap::new();

    let buttons = button_regex()
        .captures_iter(html)
        .map(|captures| {
            let attrs = captures[1].to_string();
            let text = tag_regex().replace_all(&captures[2], "").trim().to_string();
            let selector = element_selector(&attrs, &mut selectors);
            PageButton {
                text,
                selector,
                visible: true,
            }
        })
        .collect();

    let inputs = input_regex()
        .captures_iter(html)
        .map(|captures| {
            let attrs = captures[1].to_string();
            let selector = element_selector(&attrs, &mut selectors);
            PageInput {
                name: attribute(&attrs, "name").unwrap_or_default(),
                input_type: attribute(&attrs, "type").unwrap_or_else(|| "text".to_string()),
                selector,
                visible: true,
            }
        })
        .collect();

    let links = link_regex()
        .captures_iter(html)
        .map(|captures| {
            let attrs = captures[1].to_string();
            let text = tag_regex().replace_all(&captures[2], "").trim().to_string();
            PageLink {
                text,
                href: attribute(&attrs, "href").unwrap_or_default(),
                visible: true,
            }
        })
        .collect();

    PageStructure {
        title,
        url: url.to_string(),
        buttons,
        inputs,
        links,
        selectors,
    }
}

/// Selector per the data-testid > id > class preference; data-testid
/// elements also land in the recommended-selectors map.
fn element_selector(attrs: &str, selectors: &mut HashMap<String, String>) -> String {
    if let Some(testid) = attribute(attrs, "data-testid") {
        let selector = format!("[data-testid=\"{testid}\"]");
        selectors.insert(testid, selector.clone());
        return selector;
    }
    if let Some(id) = attribute(attrs, "id") {
        return format!("#{id}");
    }
    if let Some(class) = attribute(attrs, "class") {
        if let Some(first) = class.split_whitespace().next() {
            return format!(".{first}");
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HTML: &str = r#"
<html>
<head><title>Login Portal</title></head>
<body>
  <form>
    <input type="text" name="username" data-testid="username-input">
    <input type="password" name="password" id="pw">
    <button data-testid="login-button">Sign <b>in</b></button>
  </form>
  <a href="/reset" class="muted">Forgot password</a>
</body>
</html>
"#;

    #[test]
    fn test_parse_title() {
        let page = parse_page(HTML, "https://example.com/login");
        assert_eq!(page.title, "Login Portal");
        assert_eq!(page.url, "https://example.com/login");
    }

    #[test]
    fn test_parse_elements() {
        let page = parse_page(HTML, "https://example.com/login");

        assert_eq!(page.buttons.len(), 1);
        assert_eq!(page.buttons[0].text, "Sign in");
        assert_eq!(page.buttons[0].selector, "[data-testid=\"login-button\"]");

        assert_eq!(page.inputs.len(), 2);
        assert_eq!(page.inputs[0].name, "username");
        assert_eq!(page.inputs[1].selector, "#pw");

        assert_eq!(page.links.len(), 1);
        assert_eq!(page.links[0].href, "/reset");
        assert_eq!(page.links[0].text, "Forgot password");
    }

    #[test]
    fn test_testid_selectors_collected() {
        let page = parse_page(HTML, "https://example.com/login");
        assert_eq!(
            page.selectors.get("login-button"),
            Some(&"[data-testid=\"login-button\"]".to_string())
        );
        assert_eq!(
            page.selectors.get("username-input"),
            Some(&"[data-testid=\"username-input\"]".to_string())
        );
    }
}
