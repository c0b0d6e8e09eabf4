//! Jinja2-style predicate evaluation using minijinja.
//!
//! Step declarations carry `include_if`/`exclude_if` predicate strings that
//! are evaluated once at compile time against the resolved constant and
//! parameter environment. The environment is string-valued; values that look
//! like booleans or numbers are coerced so comparisons behave as expected.

use std::collections::HashMap;

use minijinja::{value::ValueKind, Environment, Error, ErrorKind, Value};

use crate::error::{AppError, AppResult};

/// Template renderer for predicate strings.
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    /// Create a new renderer with the filters and tests predicates rely on.
    pub fn new() -> Self {
        let mut env = Environment::new();

        env.add_filter("default", filter_default);
        env.add_filter("lower", filter_lower);
        env.add_filter("upper", filter_upper);
        env.add_filter("trim", filter_trim);
        env.add_filter("length", filter_length);

        env.add_test("defined", test_defined);
        env.add_test("undefined", test_undefined);
        env.add_test("none", test_none);

        Self { env }
    }

    /// Render a template string with the given environment.
    pub fn render(&self, template: &str, context: &HashMap<String, String>) -> AppResult<String> {
        // Quick check for non-template strings
        if !contains_template_syntax(template) {
            return Ok(template.to_string());
        }

        let ctx = env_to_value(context);

        let tmpl = self
            .env
            .template_from_str(template)
            .map_err(|e| AppError::Template(format!("Template parse error: {}", e)))?;

        tmpl.render(ctx)
            .map_err(|e| AppError::Template(format!("Template render error: {}", e)))
    }

    /// Evaluate a condition expression to a boolean.
    ///
    /// Bare expressions are wrapped in `{{ }}` first; the rendered result is
    /// truthy when it reads "true", "1", or "yes".
    pub fn evaluate_condition(
        &self,
        condition: &str,
        context: &HashMap<String, String>,
    ) -> AppResult<bool> {
        let template = if contains_template_syntax(condition) {
            condition.to_string()
        } else {
            format!("{{{{ {} }}}}", condition)
        };

        let rendered = self.render(&template, context)?;
        let trimmed = rendered.trim().to_lowercase();

        Ok(matches!(trimmed.as_str(), "true" | "1" | "yes"))
    }
}

/// Check if a string contains Jinja2 template syntax.
fn contains_template_syntax(s: &str) -> bool {
    (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
}

/// Convert a string environment to a minijinja Value, coercing scalars.
fn env_to_value(context: &HashMap<String, String>) -> Value {
    let converted: HashMap<String, Value> = context
        .iter()
        .map(|(k, v)| (k.clone(), coerce_scalar(v)))
        .collect();
    Value::from_object(converted)
}

/// Parse a string as bool or number where possible so predicate comparisons
/// operate on typed values.
fn coerce_scalar(s: &str) -> Value {
    let trimmed = s.trim();
    if let Ok(b) = trimmed.parse::<bool>() {
        return Value::from(b);
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return Value::from(f);
    }
    Value::from(s)
}

/// Default value filter.
fn filter_default(value: &Value, default: Option<&Value>) -> Value {
    if value.is_undefined() || value.is_none() {
        default.cloned().unwrap_or(Value::from(""))
    } else {
        value.clone()
    }
}

/// Lowercase filter.
fn filter_lower(value: &Value) -> String {
    value.to_string().to_lowercase()
}

/// Uppercase filter.
fn filter_upper(value: &Value) -> String {
    value.to_string().to_uppercase()
}

/// Trim whitespace filter.
fn filter_trim(value: &Value) -> String {
    value.to_string().trim().to_string()
}

/// Length filter.
fn filter_length(value: &Value) -> Result<usize, Error> {
    if let Some(s) = value.as_str() {
        return Ok(s.len());
    }
    if let Some(len) = value.len() {
        return Ok(len);
    }
    Err(Error::new(
        ErrorKind::InvalidOperation,
        "length requires string, sequence, or mapping",
    ))
}

/// Test if value is defined.
fn test_defined(value: &Value) -> bool {
    !value.is_undefined()
}

/// Test if value is undefined.
fn test_undefined(value: &Value) -> bool {
    value.is_undefined()
}

/// Test if value is none/null.
fn test_none(value: &Value) -> bool {
    value.is_none() || value.kind() == ValueKind::None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_context() -> HashMap<String, String> {
        let mut ctx = HashMap::new();
        ctx.insert("region".to_string(), "eu-west".to_string());
        ctx.insert("shards".to_string(), "8".to_string());
        ctx.insert("dry_run".to_string(), "false".to_string());
        ctx
    }

    #[test]
    fn test_plain_string_passthrough() {
        let renderer = TemplateRenderer::new();
        let ctx = make_context();

        let result = renderer.render("no template here", &ctx).unwrap();
        assert_eq!(result, "no template here");
    }

    #[test]
    fn test_variable_render() {
        let renderer = TemplateRenderer::new();
        let ctx = make_context();

        let result = renderer.render("region is {{ region }}", &ctx).unwrap();
        assert_eq!(result, "region is eu-west");
    }

    #[test]
    fn test_numeric_comparison() {
        let renderer = TemplateRenderer::new();
        let ctx = make_context();

        assert!(renderer.evaluate_condition("shards > 4", &ctx).unwrap());
        assert!(!renderer.evaluate_condition("shards > 16", &ctx).unwrap());
    }

    #[test]
    fn test_boolean_coercion() {
        let renderer = TemplateRenderer::new();
        let ctx = make_context();

        assert!(!renderer.evaluate_condition("dry_run", &ctx).unwrap());
        assert!(renderer.evaluate_condition("not dry_run", &ctx).unwrap());
    }

    #[test]
    fn test_string_equality() {
        let renderer = TemplateRenderer::new();
        let ctx = make_context();

        assert!(renderer
            .evaluate_condition("region == 'eu-west'", &ctx)
            .unwrap());
        assert!(!renderer
            .evaluate_condition("region == 'us-east'", &ctx)
            .unwrap());
    }

    #[test]
    fn test_wrapped_condition() {
        let renderer = TemplateRenderer::new();
        let ctx = make_context();

        assert!(renderer
            .evaluate_condition("{{ shards > 4 }}", &ctx)
            .unwrap());
    }

    #[test]
    fn test_default_filter() {
        let renderer = TemplateRenderer::new();
        let ctx = make_context();

        let result = renderer
            .render("{{ missing | default('fallback') }}", &ctx)
            .unwrap();
        assert_eq!(result, "fallback");
    }

    #[test]
    fn test_defined_test() {
        let renderer = TemplateRenderer::new();
        let ctx = make_context();

        assert!(renderer
            .evaluate_condition("region is defined", &ctx)
            .unwrap());
        assert!(renderer
            .evaluate_condition("missing is undefined", &ctx)
            .unwrap());
    }

    #[test]
    fn test_bad_predicate_is_error() {
        let renderer = TemplateRenderer::new();
        let ctx = make_context();

        assert!(renderer.evaluate_condition("{{ region | nosuch }}", &ctx).is_err());
    }
}
