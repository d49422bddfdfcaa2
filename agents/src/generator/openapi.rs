//! OpenAPI document parsing for API test generation
//!
//! Reduces an OpenAPI JSON document to the endpoint list the generator
//! prompts with: method, path, summary and parameter names.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

const SUPPORTED_METHODS: [&str; 5] = ["get", "post", "put", "delete", "patch"];

/// One operation extracted from an OpenAPI document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiEndpoint {
    pub method: String,
    pub path: String,
    pub summary: String,
    pub parameters: Vec<String>,
}

/// Extract endpoints from a parsed OpenAPI document. When `filter` is
/// non-empty, only paths listed there are returned.
pub fn extract_endpoints(spec: &serde_json::Value, filter: &[String]) -> Result<Vec<ApiEndpoint>> {
    let paths = spec
        .get("paths")
        .and_then(|p| p.as_object())
        .ok_or_else(|| anyhow!("OpenAPI document has no paths object"))?;

    let mut endpoints = Vec::new();
    for (path, item) in paths {
        if !filter.is_empty() && !filter.iter().any(|f| f == path) {
            continue;
        }
        let Some(operations) = item.as_object() else {
            continue;
        };
        for (method, operation) in operations {
            if !SUPPORTED_METHODS.contains(&method.as_str()) {
                continue;
            }
            let summary = operation
                .get("summary")
                .and_then(|s| s.as_str())
                .unwrap_or("")
                .to_string();

            let mut parameters = Vec::new();
            if let Some(params) = operation.get("parameters").and_then(|p| p.as_array()) {
                for param in params {
                    let name = param.get("name").and_then(|n| n.as_str()).unwrap_or("");
                    let location = param.get("in").and_then(|i| i.as_str()).unwrap_or("");
                    if !name.is_empty() {
                        parameters.push(format!("{name} ({location})"));
                    }
                }
            }
            if operation.get("requestBody").is_some() {
                parameters.push("request body".to_string());
            }

            endpoints.push(ApiEndpoint {
                method: method.to_uppercase(),
                path: path.clone(),
                summary,
                parameters,
            });
        }
    }

    debug!("Extracted {} endpoints from OpenAPI document", endpoints.len());
    Ok(endpoints)
}

/// Parse an OpenAPI JSON string and extract its endpoints.
pub fn parse_document(content: &str, filter: &[String]) -> Result<Vec<ApiEndpoint>> {
    let spec: serde_json::Value =
        serde_json::from_str(content).map_err(|e| anyhow!("Failed to parse OpenAPI JSON: {e}"))?;
    extract_endpoints(&spec, filter)
}

/// Encode an endpoint list as a `PageStructure` so API requests flow
/// through the same reconnaissance checkpoint shape: one link per
/// operation, `text` holding "METHOD path", `href` the path.
pub fn endpoints_to_page(document_url: &str, endpoints: &[ApiEndpoint]) -> crate::reconnaissance::PageStructure {
    let links = endpoints
        .iter()
        .map(|endpoint| crate::reconnaissance::PageLink {
            text: format!("{} {}", endpoint.method, endpoint.path),
            href: endpoint.path.clone(),
            visible: true,
        })
        .collect();
    crate::reconnaissance::PageStructure {
        title: "OpenAPI".to_string(),
        url: document_url.to_string(),
        buttons: Vec::new(),
        inputs: Vec::new(),
        links,
        selectors: Default::default(),
    }
}

/// Decode the endpoint list back out of a reconnaissance page.
pub fn endpoints_from_page(page: &crate::reconnaissance::PageStructure) -> Vec<ApiEndpoint> {
    page.links
        .iter()
        .map(|link| {
            let mut parts = link.text.splitn(2, ' ');
            let method = parts.next().unwrap_or("GET").to_string();
            let path = parts.next().unwrap_or(&link.href).to_string();
            ApiEndpoint {
                method,
                path,
                summary: String::new(),
                parameters: Vec::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_spec() -> serde_json::Value {
        json!({
            "openapi": "3.0.0",
            "info": {"title": "VM API"},
            "paths": {
                "/api/v1/vms": {
                    "get": {"summary": "List VMs"},
                    "post": {
                        "summary": "Create VM",
                        "requestBody": {"content": {}}
                    }
                },
                "/api/v1/vms/{id}": {
                    "get": {
                        "summary": "Get VM",
                        "parameters": [{"name": "id", "in": "path"}]
                    },
                    "delete": {"summary": "Delete VM"}
                }
            }
        })
    }

    #[test]
    fn test_extracts_all_supported_operations() {
        let endpoints = extract_endpoints(&sample_spec(), &[]).unwrap();
        assert_eq!(endpoints.len(), 4);
        assert!(endpoints
            .iter()
            .any(|e| e.method == "POST" && e.path == "/api/v1/vms"));
    }

    #[test]
    fn test_path_filter() {
        let endpoints =
            extract_endpoints(&sample_spec(), &["/api/v1/vms/{id}".to_string()]).unwrap();
        assert_eq!(endpoints.len(), 2);
        assert!(endpoints.iter().all(|e| e.path == "/api/v1/vms/{id}"));
    }

    #[test]
    fn test_parameters_and_body_recorded() {
        let endpoints = extract_endpoints(&sample_spec(), &[]).unwrap();
        let get_vm = endpoints
            .iter()
            .find(|e| e.method == "GET" && e.path == "/api/v1/vms/{id}")
            .unwrap();
        assert_eq!(get_vm.parameters, vec!["id (path)".to_string()]);

        let create = endpoints
            .iter()
            .find(|e| e.method == "POST")
            .unwrap();
        assert_eq!(create.parameters, vec!["request body".to_string()]);
    }

    #[test]
    fn test_missing_paths_is_error() {
        let err = extract_endpoints(&json!({"openapi": "3.0.0"}), &[]).unwrap_err();
        assert!(err.to_string().contains("no paths"));
    }

    #[test]
    fn test_page_round_trip_preserves_method_and_path() {
        let endpoints = extract_endpoints(&sample_spec(), &[]).unwrap();
        let page = endpoints_to_page("https://api.example.com/openapi.json", &endpoints);
        let decoded = endpoints_from_page(&page);

        assert_eq!(decoded.len(), endpoints.len());
        for (original, round_tripped) in endpoints.iter().zip(&decoded) {
            assert_eq!(original.method, round_tripped.method);
            assert_eq!(original.path, round_tripped.path);
        }
    }
}
