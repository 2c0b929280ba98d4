//! Template interpolation for pipeline configs
//!
//! Handles `{{ variable }}` interpolation in queries, bucket names and
//! connection strings. Job queries see `chain_id`, `table` and
//! `staging_table`; any string can pull process environment values with
//! `{{ env.NAME }}`.

use crate::error::{Error, Result};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Regex for matching template variables: {{ variable.path }}
static TEMPLATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)*)\s*\}\}").unwrap()
});

/// Context for template interpolation
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    /// Named variables
    vars: Map<String, Value>,
}

impl TemplateContext {
    /// Create a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a job's queries
    pub fn for_job(chain_id: &str, table: &str, staging_table: &str) -> Self {
        let mut ctx = Self::new();
        ctx.set("chain_id", chain_id)
            .set("table", table)
            .set("staging_table", staging_table);
        ctx
    }

    /// Set a variable
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> &mut Self {
        self.vars.insert(name.to_string(), value.into());
        self
    }

    /// Get a value by path (e.g., "chain_id", "job.table")
    ///
    /// `env.NAME` resolves against the process environment.
    pub fn get(&self, path: &str) -> Option<Value> {
        let parts: Vec<&str> = path.split('.').collect();

        if parts[0] == "env" {
            return match parts.as_slice() {
                [_, name] => std::env::var(name).ok().map(Value::String),
                _ => None,
            };
        }

        let mut current = self.vars.get(parts[0])?;
        for part in &parts[1..] {
            match current {
                Value::Object(map) => current = map.get(*part)?,
                _ => return None,
            }
        }
        Some(current.clone())
    }
}

/// Render a template string with the given context
pub fn render(template: &str, ctx: &TemplateContext) -> Result<String> {
    let mut result = template.to_string();
    let mut errors = Vec::new();

    for cap in TEMPLATE_REGEX.captures_iter(template) {
        let full_match = cap.get(0).unwrap().as_str();
        let var_path = cap.get(1).unwrap().as_str();

        match ctx.get(var_path) {
            Some(value) => {
                let replacement = value_to_string(&value);
                result = result.replace(full_match, &replacement);
            }
            None => {
                errors.push(var_path.to_string());
            }
        }
    }

    if errors.is_empty() {
        Ok(result)
    } else {
        Err(Error::undefined_var(errors.join(", ")))
    }
}

/// Extract all variable names from a template
pub fn extract_variables(template: &str) -> Vec<String> {
    TEMPLATE_REGEX
        .captures_iter(template)
        .map(|cap| cap.get(1).unwrap().as_str().to_string())
        .collect()
}

/// Convert a JSON value to a string for template substitution
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_context() {
        let ctx = TemplateContext::for_job("42", "orders", "staging_orders_42");

        let result = render(
            "SELECT * FROM orders WHERE chain_id = {{ chain_id }}",
            &ctx,
        )
        .unwrap();
        assert_eq!(result, "SELECT * FROM orders WHERE chain_id = 42");

        let result = render(
            "DELETE FROM {{ table }} USING {{ staging_table }} WHERE {{ table }}.id = {{ staging_table }}.id",
            &ctx,
        )
        .unwrap();
        assert_eq!(
            result,
            "DELETE FROM orders USING staging_orders_42 WHERE orders.id = staging_orders_42.id"
        );
    }

    #[test]
    fn test_nested_value() {
        let mut ctx = TemplateContext::new();
        ctx.set("job", serde_json::json!({"table": "users", "limit": 10}));

        assert_eq!(render("{{ job.table }}", &ctx).unwrap(), "users");
        assert_eq!(render("{{ job.limit }}", &ctx).unwrap(), "10");
    }

    #[test]
    fn test_env_lookup() {
        std::env::set_var("CHARIOT_TEMPLATE_TEST_URL", "postgres://localhost/db");
        let ctx = TemplateContext::new();
        assert_eq!(
            render("{{ env.CHARIOT_TEMPLATE_TEST_URL }}", &ctx).unwrap(),
            "postgres://localhost/db"
        );

        let result = render("{{ env.CHARIOT_TEMPLATE_TEST_MISSING }}", &ctx);
        assert!(result.is_err());
    }

    #[test]
    fn test_undefined_variable() {
        let ctx = TemplateContext::new();
        let result = render("{{ chain_id }}", &ctx);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("chain_id"));
    }

    #[test]
    fn test_no_templates() {
        let ctx = TemplateContext::new();
        let result = render("SELECT 1", &ctx).unwrap();
        assert_eq!(result, "SELECT 1");
    }

    #[test]
    fn test_extract_variables() {
        let vars = extract_variables("{{ chain_id }} and {{ env.HOME }}");
        assert_eq!(vars, vec!["chain_id", "env.HOME"]);
    }

    #[test]
    fn test_whitespace_in_template() {
        let ctx = TemplateContext::for_job("7", "t", "s");
        assert_eq!(render("{{chain_id}}", &ctx).unwrap(), "7");
        assert_eq!(render("{{ chain_id }}", &ctx).unwrap(), "7");
        assert_eq!(render("{{  chain_id  }}", &ctx).unwrap(), "7");
    }
}
