//! Python AST layer
//!
//! Generated tests are pytest/allure Python sources. This module wraps
//! Tree-sitter to expose exactly the visitable-tree contract the
//! validator needs: imports, call names and test-function definitions,
//! plus a structural hash that ignores comments and whitespace.

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use tree_sitter::{Node, Parser};

/// Parsed Python source with the analysis entry points used by the
/// validator and the optimizer.
pub struct PythonAst {
    tree: tree_sitter::Tree,
    source: String,
}

/// Build a parser for the Python grammar.
fn python_parser() -> Result<Parser> {
    let mut parser = Parser::new();
    parser
        .set_language(tree_sitter_python::language())
        .map_err(|e| anyhow!("Failed to load Python grammar: {e}"))?;
    Ok(parser)
}

impl PythonAst {
    /// Parse a Python source string. Returns Err only when the parser
    /// itself fails; syntax errors in the source are reported through
    /// [`PythonAst::has_syntax_errors`].
    pub fn parse(source: &str) -> Result<Self> {
        let mut parser = python_parser()?;
        let tree = parser
            .parse(source, None)
            .ok_or_else(|| anyhow!("Tree-sitter returned no parse tree"))?;
        Ok(Self {
            tree,
            source: source.to_string(),
        })
    }

    /// Whether the parse tree contains ERROR or MISSING nodes.
    pub fn has_syntax_errors(&self) -> bool {
        self.tree.root_node().has_error()
    }

    /// Root module names of every `import` / `from ... import` statement.
    pub fn imports(&self) -> Vec<String> {
        let mut modules = Vec::new();
        self.walk(|node| match node.kind() {
            "import_statement" => {
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    match child.kind() {
                        "dotted_name" => {
                            if let Some(root) = self.root_module(child) {
                                modules.push(root);
                            }
                        }
                        "aliased_import" => {
                            if let Some(name) = child.child_by_field_name("name") {
                                if let Some(root) = self.root_module(name) {
                                    modules.push(root);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            "import_from_statement" => {
                if let Some(module) = node.child_by_field_name("module_name") {
                    if let Some(root) = self.root_module(module) {
                        modules.push(root);
                    }
                }
            }
            _ => {}
        });
        modules
    }

    /// Names of all call expressions. Attribute calls keep their dotted
    /// form (`os.system`), plain calls their identifier (`eval`).
    pub fn calls(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.walk(|node| {
            if node.kind() == "call" {
                if let Some(function) = node.child_by_field_name("function") {
                    if let Some(text) = self.node_text(function) {
                        names.push(text);
                    }
                }
            }
        });
        names
    }

    /// Names of all function definitions.
    pub fn function_defs(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.walk(|node| {
            if node.kind() == "function_definition" {
                if let Some(name) = node.child_by_field_name("name") {
                    if let Some(text) = self.node_text(name) {
                        names.push(text);
                    }
                }
            }
        });
        names
    }

    /// Structural hash over the parse tree with comments and whitespace
    /// removed. Identical for sources that differ only in formatting.
    pub fn ast_hash(&self) -> String {
        let mut hasher = Sha256::new();
        self.hash_node(self.tree.root_node(), &mut hasher);
        format!("{:x}", hasher.finalize())
    }

    fn hash_node(&self, node: Node, hasher: &mut Sha256) {
        if node.kind() == "comment" {
            return;
        }
        hasher.update(node.kind().as_bytes());
        if node.named_child_count() == 0 {
            if let Some(text) = self.node_text(node) {
                hasher.update(text.as_bytes());
            }
        }
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            self.hash_node(child, hasher);
        }
    }

    /// Depth-first visit over every named node.
    fn walk<F: FnMut(Node)>(&self, mut visit: F) {
        fn recurse<F: FnMut(Node)>(node: Node, visit: &mut F) {
            visit(node);
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                recurse(child, visit);
            }
        }
        recurse(self.tree.root_node(), &mut visit);
    }

    fn node_text(&self, node: Node) -> Option<String> {
        node.utf8_text(self.source.as_bytes())
            .ok()
            .map(|s| s.to_string())
    }

    fn root_module(&self, node: Node) -> Option<String> {
        self.node_text(node)
            .map(|text| text.split('.').next().unwrap_or(&text).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
import pytest
import os.path
from playwright.sync_api import sync_playwright

@pytest.mark.ui
def test_login_works():
    result = do_login("user", "pass")
    assert result is True
"#;

    #[test]
    fn test_parse_valid_source() {
        let ast = PythonAst::parse(SAMPLE).unwrap();
        assert!(!ast.has_syntax_errors());
    }

    #[test]
    fn test_imports_reduced_to_root_module() {
        let ast = PythonAst::parse(SAMPLE).unwrap();
        let imports = ast.imports();
        assert!(imports.contains(&"pytest".to_string()));
        assert!(imports.contains(&"os".to_string()));
        assert!(imports.contains(&"playwright".to_string()));
    }

    #[test]
    fn test_calls_collected() {
        let ast = PythonAst::parse(SAMPLE).unwrap();
        let calls = ast.calls();
        assert!(calls.contains(&"do_login".to_string()));
    }

    #[test]
    fn test_attribute_call_keeps_dotted_name() {
        let ast = PythonAst::parse("import os\nos.system('ls')\n").unwrap();
        assert!(ast.calls().contains(&"os.system".to_string()));
    }

    #[test]
    fn test_function_defs() {
        let ast = PythonAst::parse(SAMPLE).unwrap();
        assert_eq!(ast.function_defs(), vec!["test_login_works".to_string()]);
    }

    #[test]
    fn test_syntax_error_detected() {
        let ast = PythonAst::parse("def broken(:\n    pass\n").unwrap();
        assert!(ast.has_syntax_errors());
    }

    #[test]
    fn test_ast_hash_ignores_comments_and_whitespace() {
        let a = PythonAst::parse("def test_a():\n    assert True\n").unwrap();
        let b = PythonAst::parse("def test_a():\n    # checks the invariant\n    assert True\n")
            .unwrap();
        assert_eq!(a.ast_hash(), b.ast_hash());
    }

    #[test]
    fn test_ast_hash_differs_for_different_code() {
        let a = PythonAst::parse("def test_a():\n    assert True\n").unwrap();
        let b = PythonAst::parse("def test_b():\n    assert True\n").unwrap();
        assert_ne!(a.ast_hash(), b.ast_hash());
    }
}
